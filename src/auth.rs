//! Signed request verification.
//!
//! A client signs `METHOD|URL|OWNER|TIMESTAMP` with HMAC-SHA256 keyed by the
//! owner's shared secret, where `URL` is the request path plus every query
//! parameter except `signature` and `timestamp`. Both values travel as query
//! parameters and are stripped once verified.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::request::RequestParams;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PARAM: &str = "signature";
pub const TIMESTAMP_PARAM: &str = "timestamp";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Resolves an owner to the secret its requests are signed with.
pub trait SecretLookup: Send + Sync {
    fn secret_for(&self, owner: &str) -> Option<&str>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing required authentication parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Timestamp has expired: {0}")]
    TimestampExpired(String),

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Unknown public key")]
    UnknownOwner,
}

/// What a verified request was signed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub owner: String,
    pub signature: String,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct RequestAuthenticator {
    freshness_window: Duration,
}

impl RequestAuthenticator {
    pub fn new(freshness_window: Duration) -> Self {
        Self { freshness_window }
    }

    /// Verifies a mutating request. On success the auth parameters are
    /// removed from `params`; on failure `params` is left untouched.
    pub fn verify(
        &self,
        params: &mut RequestParams,
        method: &str,
        path: &str,
        owner: &str,
        secrets: &dyn SecretLookup,
        now: DateTime<Utc>,
    ) -> Result<AuthContext, AuthError> {
        let signature = params
            .get(SIGNATURE_PARAM)
            .ok_or(AuthError::MissingParameter(SIGNATURE_PARAM))?
            .to_string();
        let timestamp = params
            .get(TIMESTAMP_PARAM)
            .ok_or(AuthError::MissingParameter(TIMESTAMP_PARAM))?
            .to_string();

        let signed_at = parse_timestamp(&timestamp)?;
        if (now - signed_at).abs() > self.freshness_window {
            return Err(AuthError::TimestampExpired(timestamp));
        }

        let secret = secrets.secret_for(owner).ok_or(AuthError::UnknownOwner)?;

        let mut remaining = params.clone();
        remaining.remove(SIGNATURE_PARAM);
        remaining.remove(TIMESTAMP_PARAM);
        let url = remaining.to_url(path);

        let supplied = hex::decode(signature.trim()).map_err(|_| AuthError::SignatureMismatch)?;
        signing_mac(secret, method, &url, owner, &timestamp)
            .verify_slice(&supplied)
            .map_err(|_| AuthError::SignatureMismatch)?;

        *params = remaining;
        Ok(AuthContext {
            owner: owner.to_string(),
            signature,
            timestamp,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, AuthError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| AuthError::InvalidTimestamp(raw.to_string()))
}

fn signing_mac(secret: &str, method: &str, url: &str, owner: &str, timestamp: &str) -> HmacSha256 {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac takes keys of any size"));
    mac.update(format!("{method}|{url}|{owner}|{timestamp}").as_bytes());
    mac
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Hex encoded signature for a request; what a client computes before
/// appending `signature` and `timestamp`.
pub fn sign(secret: &str, method: &str, url: &str, owner: &str, timestamp: &str) -> String {
    hex::encode(
        signing_mac(secret, method, url, owner, timestamp)
            .finalize()
            .into_bytes(),
    )
}

/// Appends a fresh signature and timestamp to `params`.
pub fn sign_params(
    params: &mut RequestParams,
    secret: &str,
    method: &str,
    path: &str,
    owner: &str,
    now: DateTime<Utc>,
) {
    let timestamp = format_timestamp(now);
    let signature = sign(secret, method, &params.to_url(path), owner, &timestamp);
    params.push(SIGNATURE_PARAM, &signature);
    params.push(TIMESTAMP_PARAM, &timestamp);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;
    use data_model::test_objects::tests::{TEST_OWNER, TEST_SECRET};

    use super::*;

    struct Secrets(HashMap<String, String>);

    impl SecretLookup for Secrets {
        fn secret_for(&self, owner: &str) -> Option<&str> {
            self.0.get(owner).map(String::as_str)
        }
    }

    const PATH: &str = "/users/publickey/images/abc";

    fn secrets() -> Secrets {
        Secrets(HashMap::from([(
            TEST_OWNER.to_string(),
            TEST_SECRET.to_string(),
        )]))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 10, 30, 0).unwrap()
    }

    fn authenticator() -> RequestAuthenticator {
        RequestAuthenticator::new(Duration::seconds(120))
    }

    fn signed_params(at: DateTime<Utc>) -> RequestParams {
        let mut params = RequestParams::from_pairs([("t[]", "border:width=2")]);
        sign_params(&mut params, TEST_SECRET, "PUT", PATH, TEST_OWNER, at);
        params
    }

    #[test]
    fn test_signed_request_is_accepted_and_stripped() {
        for offset in [-120, -30, 0, 45, 120] {
            let mut params = signed_params(now() + Duration::seconds(offset));
            let context = authenticator()
                .verify(&mut params, "PUT", PATH, TEST_OWNER, &secrets(), now())
                .unwrap();
            assert_eq!(TEST_OWNER, context.owner);
            assert!(!params.contains(SIGNATURE_PARAM));
            assert!(!params.contains(TIMESTAMP_PARAM));
            assert_eq!(Some("border:width=2"), params.get("t[]"));
        }
    }

    #[test]
    fn test_missing_signature_is_reported_first() {
        let mut params = RequestParams::default();
        assert_eq!(
            Err(AuthError::MissingParameter("signature")),
            authenticator().verify(&mut params, "PUT", PATH, TEST_OWNER, &secrets(), now())
        );

        let mut params = RequestParams::from_pairs([("signature", "abc")]);
        assert_eq!(
            Err(AuthError::MissingParameter("timestamp")),
            authenticator().verify(&mut params, "PUT", PATH, TEST_OWNER, &secrets(), now())
        );
        assert_eq!(
            "Missing required authentication parameter: signature",
            AuthError::MissingParameter(SIGNATURE_PARAM).to_string()
        );
    }

    #[test]
    fn test_malformed_timestamp() {
        for raw in ["yesterday", "2024-05-17 10:30:00", "2024-05-17T10:30:00.123Z", ""] {
            let mut params =
                RequestParams::from_pairs([("signature", "abc"), ("timestamp", raw)]);
            assert_eq!(
                Err(AuthError::InvalidTimestamp(raw.to_string())),
                authenticator().verify(&mut params, "PUT", PATH, TEST_OWNER, &secrets(), now())
            );
        }
    }

    #[test]
    fn test_expired_timestamp_with_valid_signature() {
        for offset in [-121, 121, -3600] {
            let at = now() + Duration::seconds(offset);
            let mut params = signed_params(at);
            let before = params.clone();
            assert_eq!(
                Err(AuthError::TimestampExpired(format_timestamp(at))),
                authenticator().verify(&mut params, "PUT", PATH, TEST_OWNER, &secrets(), now())
            );
            assert_eq!(before, params);
        }
    }

    #[test]
    fn test_signature_mismatch() {
        let verify = |params: &mut RequestParams, method: &str, path: &str| {
            authenticator().verify(params, method, path, TEST_OWNER, &secrets(), now())
        };

        assert_eq!(
            Err(AuthError::SignatureMismatch),
            verify(&mut signed_params(now()), "DELETE", PATH)
        );
        assert_eq!(
            Err(AuthError::SignatureMismatch),
            verify(&mut signed_params(now()), "PUT", "/users/publickey/images/other")
        );

        let mut tampered = signed_params(now());
        tampered.push("t[]", "rotate:angle=90");
        assert_eq!(Err(AuthError::SignatureMismatch), verify(&mut tampered, "PUT", PATH));

        let timestamp = format_timestamp(now());
        let mut garbage =
            RequestParams::from_pairs([("signature", "not-hex"), ("timestamp", timestamp.as_str())]);
        assert_eq!(Err(AuthError::SignatureMismatch), verify(&mut garbage, "PUT", PATH));
    }

    #[test]
    fn test_unknown_owner() {
        let mut params = signed_params(now());
        assert_eq!(
            Err(AuthError::UnknownOwner),
            authenticator().verify(&mut params, "PUT", PATH, "someone", &secrets(), now())
        );
    }
}
