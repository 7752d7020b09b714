use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware,
    routing::get,
    Json,
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;

use crate::{
    http_objects::{
        ImageHostAPIError,
        ImageIdentifierResponse,
        ImageSummary,
        ImagesResponse,
        StatusResponse,
        UserResponse,
    },
    middleware::{owner_middleware, InstanceRequestSpan},
};

pub mod image;
pub mod images;
pub mod metadata;
pub mod routes_state;
pub mod status;
pub mod user;

use routes_state::RouteState;

#[derive(OpenApi)]
#[openapi(
        paths(
            status::status,
            user::get_user,
            images::list_images,
            image::get_image,
            image::head_image,
            image::put_image,
            image::delete_image,
            metadata::get_metadata,
            metadata::put_metadata,
            metadata::post_metadata,
            metadata::delete_metadata,
        ),
        components(
            schemas(
                ImageHostAPIError,
                ImageIdentifierResponse,
                ImageSummary,
                ImagesResponse,
                StatusResponse,
                UserResponse,
            )
        ),
        tags(
            (name = "imagehost", description = "Image hosting API")
        )
    )]
pub struct ApiDoc;

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn index() -> &'static str {
    "Image Host Server"
}

/// Routes scoped to one owner. Every one of them goes through the owner and
/// signature check.
fn user_routes(route_state: RouteState) -> Router {
    Router::new()
        .route(
            "/users/{owner}",
            get(user::get_user).with_state(route_state.clone()),
        )
        .route(
            "/users/{owner}/images",
            get(images::list_images).with_state(route_state.clone()),
        )
        .route(
            "/users/{owner}/images/{image}",
            get(image::get_image)
                .head(image::head_image)
                .put(image::put_image)
                .delete(image::delete_image)
                .with_state(route_state.clone()),
        )
        .route(
            "/users/{owner}/images/{image}/meta",
            get(metadata::get_metadata)
                .put(metadata::put_metadata)
                .post(metadata::post_metadata)
                .delete(metadata::delete_metadata)
                .with_state(route_state.clone()),
        )
        .route_layer(middleware::from_fn_with_state(
            route_state,
            owner_middleware,
        ))
}

pub fn create_routes(route_state: RouteState, request_span: InstanceRequestSpan) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::PUT,
            Method::POST,
            Method::DELETE,
        ])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/docs/openapi.json", get(openapi))
        .route("/status", get(status::status).with_state(route_state.clone()))
        .merge(user_routes(route_state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_failure(()),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(usize::MAX))
}
