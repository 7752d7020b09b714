use axum::{
    extract::{RawPathParams, Request, State},
    http::{Method, Uri},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tower_http::trace::MakeSpan;
use tracing::{warn, Span};

use crate::{
    auth::{AuthError, SecretLookup},
    http_objects::ImageHostAPIError,
    request::{validate_owner, RequestParams},
    routes::routes_state::RouteState,
};

#[derive(Clone)]
pub struct InstanceRequestSpan {
    env: String,
    instance_id: String,
}

impl InstanceRequestSpan {
    pub fn new(env: &str, instance_id: &str) -> Self {
        Self {
            env: env.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl<B> MakeSpan<B> for InstanceRequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        tracing::info_span!(
            "request",
            env = %self.env,
            instance_id = %self.instance_id,
            method = %request.method(),
            uri = %request.uri(),
        )
    }
}

fn requires_signature(method: &Method) -> bool {
    matches!(*method, Method::PUT | Method::POST | Method::DELETE)
}

/// Resolves the `{owner}` of every user route and verifies signed requests.
///
/// Unknown owners are rejected for every method. Writes must be signed; once
/// verified, `signature` and `timestamp` are dropped from the request URI
/// and the [`crate::auth::AuthContext`] is attached as an extension.
pub async fn owner_middleware(
    State(state): State<RouteState>,
    params: RawPathParams,
    mut request: Request,
    next: Next,
) -> Result<Response, ImageHostAPIError> {
    let Some((_, owner)) = params.iter().find(|(key, _)| *key == "owner") else {
        return Ok(next.run(request).await);
    };
    let owner = validate_owner(owner)?.to_string();
    if state.auth.secret_for(&owner).is_none() {
        return Err(AuthError::UnknownOwner.into());
    }

    if requires_signature(request.method()) {
        let mut query = RequestParams::parse(request.uri().query());
        let path = request.uri().path().to_string();
        let context = state
            .authenticator
            .verify(
                &mut query,
                request.method().as_str(),
                &path,
                &owner,
                state.auth.as_ref(),
                Utc::now(),
            )
            .inspect_err(|err| {
                warn!(owner = %owner, error = %err, "rejected signed request");
                state.metrics.auth_failures.add(1, &[]);
            })?;

        let mut parts = request.uri().clone().into_parts();
        parts.path_and_query = Some(
            query
                .to_url(&path)
                .parse()
                .map_err(|_| ImageHostAPIError::bad_request("Invalid request URI"))?,
        );
        *request.uri_mut() = Uri::from_parts(parts)
            .map_err(|_| ImageHostAPIError::bad_request("Invalid request URI"))?;
        request.extensions_mut().insert(context);
    }

    Ok(next.run(request).await)
}
