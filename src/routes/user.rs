use axum::{
    extract::{Path, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};

use crate::{
    cache,
    http_objects::{ImageHostAPIError, UserResponse},
    routes::routes_state::RouteState,
};

/// Information about an owner
#[utoipa::path(
    get,
    path = "/users/{owner}",
    tag = "users",
    responses(
        (status = 200, description = "owner information", body = UserResponse),
        (status = 404, description = "unknown public key", body = ImageHostAPIError),
    ),
)]
#[tracing::instrument(skip(state))]
pub async fn get_user(
    Path(owner): Path<String>,
    State(state): State<RouteState>,
) -> Result<Response, ImageHostAPIError> {
    let num_images = state.metadata_store.get_num_images(&owner).await?;
    let last_modified = cache::http_date(state.metadata_store.get_last_modified(&owner, None).await?);
    let header_value = HeaderValue::from_str(&last_modified)
        .map_err(|e| ImageHostAPIError::internal_error_str(&e.to_string()))?;

    let mut response = Json(UserResponse {
        public_key: owner,
        num_images,
        last_modified,
    })
    .into_response();
    response
        .headers_mut()
        .insert(header::LAST_MODIFIED, header_value);
    Ok(response)
}
