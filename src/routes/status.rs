use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use tracing::error;

use crate::{cache, http_objects::StatusResponse, routes::routes_state::RouteState};

/// Health of the storage backends
#[utoipa::path(
    get,
    path = "/status",
    tag = "status",
    responses(
        (status = 200, description = "both backends are reachable", body = StatusResponse),
        (status = 500, description = "a backend is down", body = StatusResponse),
    ),
)]
pub async fn status(State(state): State<RouteState>) -> (StatusCode, Json<StatusResponse>) {
    let (database, storage) = futures::join!(
        state.metadata_store.status(),
        state.blob_store.status()
    );
    let status_code = if database && storage {
        StatusCode::OK
    } else {
        error!(database, storage, "backend status check failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status_code,
        Json(StatusResponse {
            date: cache::http_date(Utc::now()),
            database,
            storage,
        }),
    )
}
