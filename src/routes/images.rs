use axum::{
    extract::{Path, State},
    http::Uri,
    Json,
};

use crate::{
    http_objects::{ImageHostAPIError, ImageSummary, ImagesResponse},
    request::RequestParams,
    routes::routes_state::RouteState,
};

/// List the images of an owner
#[utoipa::path(
    get,
    path = "/users/{owner}/images",
    tag = "images",
    params(
        ("owner" = String, Path, description = "public key of the owner"),
        ("page" = Option<usize>, Query, description = "1-based page number"),
        ("limit" = Option<usize>, Query, description = "images per page"),
        ("metadataQuery" = Option<String>, Query, description = "JSON object of dotted metadata keys to values"),
        ("from" = Option<String>, Query, description = "added at or after, unix seconds or RFC 3339"),
        ("to" = Option<String>, Query, description = "added at or before, unix seconds or RFC 3339"),
    ),
    responses(
        (status = 200, description = "images, newest first", body = ImagesResponse),
        (status = 400, description = "invalid query", body = ImageHostAPIError),
    ),
)]
#[tracing::instrument(skip(state, uri))]
pub async fn list_images(
    Path(owner): Path<String>,
    State(state): State<RouteState>,
    uri: Uri,
) -> Result<Json<ImagesResponse>, ImageHostAPIError> {
    let query = RequestParams::parse(uri.query()).image_query()?;
    let images = state.metadata_store.get_images(&owner, &query).await?;
    Ok(Json(ImagesResponse {
        images: images.into_iter().map(ImageSummary::from).collect(),
    }))
}
