use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;

use crate::{
    cache::{self, CacheDecision, CacheValidators},
    http_objects::{ImageHostAPIError, ImageIdentifierResponse},
    request::{parse_metadata_body, validate_identifier},
    routes::routes_state::RouteState,
};

/// Get the metadata of an image
#[utoipa::path(
    get,
    path = "/users/{owner}/images/{image}/meta",
    tag = "metadata",
    responses(
        (status = 200, description = "metadata record"),
        (status = 304, description = "not modified"),
        (status = 404, description = "image not found", body = ImageHostAPIError),
    ),
)]
#[tracing::instrument(skip_all, fields(owner = %owner, image = %identifier))]
pub async fn get_metadata(
    Path((owner, identifier)): Path<(String, String)>,
    State(state): State<RouteState>,
    headers: HeaderMap,
) -> Result<Response, ImageHostAPIError> {
    validate_identifier(&identifier)?;
    let last_modified = state
        .metadata_store
        .get_last_modified(&owner, Some(&identifier))
        .await?;
    let etag = cache::metadata_etag(&owner, &identifier, &cache::http_date(last_modified));
    let validators = CacheValidators::new(etag, last_modified);

    let mut response = match cache::evaluate(&validators, &headers) {
        CacheDecision::NotModified => {
            state.metrics.not_modified.add(1, &[]);
            StatusCode::NOT_MODIFIED.into_response()
        }
        CacheDecision::Modified => {
            let metadata = state.metadata_store.get_metadata(&owner, &identifier).await?;
            Json(metadata).into_response()
        }
    };
    cache::insert_validators(response.headers_mut(), &validators)?;
    Ok(response)
}

/// Replace the metadata of an image
#[utoipa::path(
    put,
    path = "/users/{owner}/images/{image}/meta",
    tag = "metadata",
    request_body(content_type = "application/json", content = Object),
    responses(
        (status = 200, description = "metadata replaced", body = ImageIdentifierResponse),
        (status = 400, description = "missing or invalid JSON", body = ImageHostAPIError),
        (status = 404, description = "image not found", body = ImageHostAPIError),
    ),
)]
#[tracing::instrument(skip_all, fields(owner = %owner, image = %identifier))]
pub async fn put_metadata(
    Path((owner, identifier)): Path<(String, String)>,
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<Json<ImageIdentifierResponse>, ImageHostAPIError> {
    validate_identifier(&identifier)?;
    let metadata = parse_metadata_body(&body)?;

    state
        .metadata_store
        .delete_metadata(&owner, &identifier)
        .await?;
    state
        .metadata_store
        .update_metadata(&owner, &identifier, metadata)
        .await?;
    info!("metadata replaced");
    Ok(Json(ImageIdentifierResponse {
        image_identifier: identifier,
    }))
}

/// Merge keys into the metadata of an image
#[utoipa::path(
    post,
    path = "/users/{owner}/images/{image}/meta",
    tag = "metadata",
    request_body(content_type = "application/json", content = Object),
    responses(
        (status = 200, description = "metadata updated", body = ImageIdentifierResponse),
        (status = 400, description = "missing or invalid JSON", body = ImageHostAPIError),
        (status = 404, description = "image not found", body = ImageHostAPIError),
    ),
)]
#[tracing::instrument(skip_all, fields(owner = %owner, image = %identifier))]
pub async fn post_metadata(
    Path((owner, identifier)): Path<(String, String)>,
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<Json<ImageIdentifierResponse>, ImageHostAPIError> {
    validate_identifier(&identifier)?;
    let update = parse_metadata_body(&body)?;

    let mut metadata = state.metadata_store.get_metadata(&owner, &identifier).await?;
    metadata.merge(update);
    state
        .metadata_store
        .update_metadata(&owner, &identifier, metadata)
        .await?;
    info!("metadata merged");
    Ok(Json(ImageIdentifierResponse {
        image_identifier: identifier,
    }))
}

/// Delete the metadata of an image
#[utoipa::path(
    delete,
    path = "/users/{owner}/images/{image}/meta",
    tag = "metadata",
    responses(
        (status = 200, description = "metadata deleted", body = ImageIdentifierResponse),
        (status = 404, description = "image not found", body = ImageHostAPIError),
    ),
)]
#[tracing::instrument(skip_all, fields(owner = %owner, image = %identifier))]
pub async fn delete_metadata(
    Path((owner, identifier)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<ImageIdentifierResponse>, ImageHostAPIError> {
    validate_identifier(&identifier)?;
    state
        .metadata_store
        .delete_metadata(&owner, &identifier)
        .await?;
    info!("metadata deleted");
    Ok(Json(ImageIdentifierResponse {
        image_identifier: identifier,
    }))
}
