use axum::{
    http::{header::InvalidHeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use data_model::{Image, PreparationError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;
use utoipa::ToSchema;

use crate::{
    auth::AuthError,
    persistence::PersistenceError,
    pipeline::PipelineError,
    request::RequestError,
};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct ImageHostAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ImageHostAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error_str(e: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ImageHostAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        let body = json!({
            "error": {
                "code": self.status_code.as_u16(),
                "message": self.message,
            }
        });
        (self.status_code, Json(body)).into_response()
    }
}

impl From<AuthError> for ImageHostAPIError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::UnknownOwner => Self::not_found(&e.to_string()),
            other => Self::bad_request(&other.to_string()),
        }
    }
}

impl From<RequestError> for ImageHostAPIError {
    fn from(e: RequestError) -> Self {
        Self::bad_request(&e.to_string())
    }
}

impl From<PreparationError> for ImageHostAPIError {
    fn from(e: PreparationError) -> Self {
        match e {
            PreparationError::Empty => Self::bad_request(&e.to_string()),
            PreparationError::UnsupportedType => {
                Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, &e.to_string())
            }
        }
    }
}

impl From<PipelineError> for ImageHostAPIError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::NotAcceptable(_) => {
                Self::new(StatusCode::NOT_ACCEPTABLE, &e.to_string())
            }
            PipelineError::UnknownTransformation(_) | PipelineError::Transformation(_) => {
                Self::bad_request(&e.to_string())
            }
        }
    }
}

impl From<metadata_store::Error> for ImageHostAPIError {
    fn from(e: metadata_store::Error) -> Self {
        match e {
            metadata_store::Error::ImageNotFound => Self::not_found(&e.to_string()),
            metadata_store::Error::Backend { message, source } => {
                error!("metadata store failure: {message}: {source:?}");
                Self::internal_error_str(message)
            }
        }
    }
}

impl From<blob_store::Error> for ImageHostAPIError {
    fn from(e: blob_store::Error) -> Self {
        match e {
            blob_store::Error::NotFound => Self::not_found(&e.to_string()),
            blob_store::Error::Store { message, source } => {
                error!("blob store failure: {message}: {source:?}");
                Self::internal_error_str(message)
            }
        }
    }
}

impl From<InvalidHeaderValue> for ImageHostAPIError {
    fn from(e: InvalidHeaderValue) -> Self {
        Self::internal_error_str(&e.to_string())
    }
}

impl From<PersistenceError> for ImageHostAPIError {
    fn from(e: PersistenceError) -> Self {
        match e {
            PersistenceError::Metadata(e) => e.into(),
            PersistenceError::Blob(e) => e.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageIdentifierResponse {
    pub image_identifier: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub public_key: String,
    pub num_images: usize,
    pub last_modified: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct StatusResponse {
    pub date: String,
    pub database: bool,
    pub storage: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSummary {
    pub image_identifier: String,
    pub mime: String,
    pub extension: String,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub checksum: String,
    pub added: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl From<Image> for ImageSummary {
    fn from(image: Image) -> Self {
        Self {
            image_identifier: image.identifier,
            mime: image.mime_type.as_ref().to_string(),
            extension: image.extension,
            width: image.width,
            height: image.height,
            size: image.file_size,
            checksum: image.checksum,
            added: image.added,
            updated: image.updated,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct ImagesResponse {
    pub images: Vec<ImageSummary>,
}
