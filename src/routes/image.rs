use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use data_model::{Image, MimeType, TransformationSpec};
use tracing::{debug, info};

use crate::{
    cache::{self, CacheDecision, CacheValidators},
    content_negotiation::AcceptHeader,
    http_objects::{ImageHostAPIError, ImageIdentifierResponse},
    pipeline::OutputFormat,
    request::{parse_image_segment, validate_identifier, RequestParams},
    routes::routes_state::RouteState,
};

pub const ORIGINAL_MIME_TYPE: &str = "x-imagehost-originalmimetype";
pub const ORIGINAL_WIDTH: &str = "x-imagehost-originalwidth";
pub const ORIGINAL_HEIGHT: &str = "x-imagehost-originalheight";
pub const ORIGINAL_FILE_SIZE: &str = "x-imagehost-originalfilesize";
pub const ORIGINAL_EXTENSION: &str = "x-imagehost-originalextension";

fn header_value(value: impl ToString) -> Result<HeaderValue, ImageHostAPIError> {
    Ok(HeaderValue::from_str(&value.to_string())?)
}

/// Headers describing the stored image, before any transformation.
fn original_headers(headers: &mut HeaderMap, image: &Image) -> Result<(), ImageHostAPIError> {
    let values = [
        (ORIGINAL_MIME_TYPE, image.mime_type.as_ref().to_string()),
        (ORIGINAL_WIDTH, image.width.to_string()),
        (ORIGINAL_HEIGHT, image.height.to_string()),
        (ORIGINAL_FILE_SIZE, image.file_size.to_string()),
        (ORIGINAL_EXTENSION, image.extension.clone()),
    ];
    for (name, value) in values {
        headers.insert(HeaderName::from_static(name), header_value(value)?);
    }
    Ok(())
}

fn representation_headers(
    headers: &mut HeaderMap,
    validators: &CacheValidators,
) -> Result<(), ImageHostAPIError> {
    cache::insert_validators(headers, validators)?;
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(cache::CACHE_CONTROL),
    );
    Ok(())
}

fn request_uri(uri: &Uri) -> &str {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path())
}

/// The `Accept` header takes part exactly as sent, an empty string when
/// there is none.
fn representation_etag(owner: &str, identifier: &str, headers: &HeaderMap, uri: &Uri) -> String {
    let accept = headers
        .get(header::ACCEPT)
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    cache::compute_etag(
        owner,
        identifier,
        &String::from_utf8_lossy(accept),
        request_uri(uri),
    )
}

/// What GET and HEAD share: the parsed request and the validators of the
/// representation it asks for.
struct ImageRequest<'a> {
    identifier: &'a str,
    extension: Option<MimeType>,
    transformations: Vec<TransformationSpec>,
    accept: Option<&'a str>,
    validators: CacheValidators,
}

impl<'a> ImageRequest<'a> {
    /// Negotiation treats a missing `Accept` header as `*/*`.
    async fn parse(
        state: &RouteState,
        owner: &str,
        segment: &'a str,
        headers: &'a HeaderMap,
        uri: &Uri,
    ) -> Result<Self, ImageHostAPIError> {
        let (identifier, extension) = parse_image_segment(segment)?;
        let transformations = RequestParams::parse(uri.query()).transformations()?;
        let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());

        let etag = representation_etag(owner, identifier, headers, uri);
        let last_modified = state.persistence.last_modified(owner, identifier).await?;
        Ok(Self {
            identifier,
            extension,
            transformations,
            accept,
            validators: CacheValidators::new(etag, last_modified),
        })
    }

    /// A 304 response when the client's validators both match.
    fn not_modified(
        &self,
        state: &RouteState,
        headers: &HeaderMap,
    ) -> Result<Option<Response>, ImageHostAPIError> {
        if cache::evaluate(&self.validators, headers) == CacheDecision::Modified {
            return Ok(None);
        }
        debug!("conditional request matched, not modified");
        state.metrics.not_modified.add(1, &[]);
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        representation_headers(response.headers_mut(), &self.validators)?;
        Ok(Some(response))
    }

    fn output_format(&self) -> OutputFormat {
        match self.extension {
            Some(mime_type) => OutputFormat::Extension(mime_type),
            None => OutputFormat::Negotiate(AcceptHeader::parse(self.accept)),
        }
    }
}

/// Get an image, transformed
#[utoipa::path(
    get,
    path = "/users/{owner}/images/{image}",
    tag = "images",
    params(
        ("owner" = String, Path, description = "public key of the owner"),
        ("image" = String, Path, description = "image identifier, optionally followed by an output extension"),
        ("t[]" = Option<Vec<String>>, Query, description = "transformations, applied in order"),
    ),
    responses(
        (status = 200, description = "image bytes"),
        (status = 304, description = "not modified"),
        (status = 400, description = "bad transformation", body = ImageHostAPIError),
        (status = 404, description = "image not found", body = ImageHostAPIError),
        (status = 406, description = "no acceptable output type", body = ImageHostAPIError),
    ),
)]
#[tracing::instrument(skip_all, fields(owner = %owner, image = %segment))]
pub async fn get_image(
    Path((owner, segment)): Path<(String, String)>,
    State(state): State<RouteState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ImageHostAPIError> {
    let request = ImageRequest::parse(&state, &owner, &segment, &headers, &uri).await?;
    if let Some(response) = request.not_modified(&state, &headers)? {
        return Ok(response);
    }

    let mut image = state.persistence.fetch(&owner, request.identifier).await?;
    state.persistence.load_blob(&mut image).await?;
    let source = image
        .take_blob()
        .ok_or_else(|| ImageHostAPIError::internal_error_str("image data was not loaded"))?;

    let output_format = request.output_format();
    let transformations = request.transformations.clone();
    let pipeline = state.pipeline.clone();
    let original = image.clone();
    let output = tokio::task::spawn_blocking(move || {
        pipeline.run(source, &original, &transformations, &output_format)
    })
    .await
    .map_err(|e| ImageHostAPIError::internal_error_str(&e.to_string()))??;

    state.metrics.images_served.add(1, &[]);
    state
        .metrics
        .bytes_served
        .add(output.bytes.len() as u64, &[]);

    let mut response = Response::new(Body::from(output.bytes.clone()));
    let response_headers = response.headers_mut();
    response_headers.insert(header::CONTENT_TYPE, header_value(output.mime_type)?);
    response_headers.insert(header::CONTENT_LENGTH, header_value(output.bytes.len())?);
    representation_headers(response_headers, &request.validators)?;
    original_headers(response_headers, &image)?;
    Ok(response)
}

/// Image headers, without the body
///
/// Answers like GET, conditional requests and content negotiation included,
/// but the image bytes are never loaded and no pixels are touched.
#[utoipa::path(
    head,
    path = "/users/{owner}/images/{image}",
    tag = "images",
    responses(
        (status = 200, description = "image exists"),
        (status = 304, description = "not modified"),
        (status = 400, description = "bad transformation"),
        (status = 404, description = "image not found"),
        (status = 406, description = "no acceptable output type"),
    ),
)]
#[tracing::instrument(skip_all, fields(owner = %owner, image = %segment))]
pub async fn head_image(
    Path((owner, segment)): Path<(String, String)>,
    State(state): State<RouteState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ImageHostAPIError> {
    let request = ImageRequest::parse(&state, &owner, &segment, &headers, &uri).await?;
    if let Some(response) = request.not_modified(&state, &headers)? {
        return Ok(response);
    }

    let image = state.persistence.fetch(&owner, request.identifier).await?;
    let mime_type = state.pipeline.output_type(
        &image,
        &request.transformations,
        &request.output_format(),
    )?;

    let mut response = StatusCode::OK.into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CONTENT_TYPE, header_value(mime_type)?);
    representation_headers(response_headers, &request.validators)?;
    original_headers(response_headers, &image)?;
    Ok(response)
}

/// Store an image
#[utoipa::path(
    put,
    path = "/users/{owner}/images/{image}",
    tag = "images",
    request_body(content_type = "application/octet-stream", content = Vec<u8>),
    responses(
        (status = 201, description = "image stored", body = ImageIdentifierResponse),
        (status = 400, description = "missing image or bad signature", body = ImageHostAPIError),
        (status = 415, description = "unsupported image type", body = ImageHostAPIError),
        (status = 500, description = "storage failure", body = ImageHostAPIError),
    ),
)]
#[tracing::instrument(skip_all, fields(owner = %owner, image = %identifier))]
pub async fn put_image(
    Path((owner, identifier)): Path<(String, String)>,
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<(StatusCode, Json<ImageIdentifierResponse>), ImageHostAPIError> {
    validate_identifier(&identifier)?;
    let image = Image::prepare(&owner, &identifier, body.clone(), Utc::now())?;
    let put_result = state.persistence.store(&image, body).await?;

    state.metrics.images_stored.add(1, &[]);
    state.metrics.bytes_stored.add(put_result.size_bytes, &[]);
    info!(
        mime_type = %image.mime_type,
        width = image.width,
        height = image.height,
        "image added"
    );
    Ok((
        StatusCode::CREATED,
        Json(ImageIdentifierResponse {
            image_identifier: identifier,
        }),
    ))
}

/// Delete an image
#[utoipa::path(
    delete,
    path = "/users/{owner}/images/{image}",
    tag = "images",
    responses(
        (status = 200, description = "image deleted", body = ImageIdentifierResponse),
        (status = 404, description = "image not found", body = ImageHostAPIError),
    ),
)]
#[tracing::instrument(skip_all, fields(owner = %owner, image = %identifier))]
pub async fn delete_image(
    Path((owner, identifier)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<ImageIdentifierResponse>, ImageHostAPIError> {
    validate_identifier(&identifier)?;
    state.persistence.remove(&owner, &identifier).await?;
    state.metrics.images_deleted.add(1, &[]);
    info!("image deleted");
    Ok(Json(ImageIdentifierResponse {
        image_identifier: identifier,
    }))
}
