use chrono::{DateTime, TimeZone, Utc};
use data_model::{
    query::DEFAULT_LIMIT,
    ImageQuery,
    ImageQueryBuilder,
    InvalidTransformationSpec,
    MetadataRecord,
    MimeType,
    TransformationSpec,
};
use serde_json::Value;

const MAX_OWNER_LEN: usize = 255;
const MAX_IDENTIFIER_LEN: usize = 64;
const TRANSFORMATION_PARAMS: [&str; 2] = ["t[]", "t"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Invalid public key: {0}")]
    InvalidOwner(String),

    #[error("Invalid image identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Unsupported image extension: {0}")]
    UnsupportedExtension(String),

    #[error("Invalid transformation {spec}: {source}")]
    InvalidTransformation {
        spec: String,
        source: InvalidTransformationSpec,
    },

    #[error("Invalid value for {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },

    #[error("Missing JSON data")]
    MissingJson,

    #[error("Invalid JSON data")]
    InvalidJson,
}

/// Decoded query parameters in the order they appeared on the request line.
///
/// Order matters: transformations are applied in the order given, and the
/// canonical string a client signs is rebuilt from these pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams(Vec<(String, String)>);

impl RequestParams {
    pub fn parse(query: Option<&str>) -> Self {
        let pairs = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        Self(pairs)
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }

    /// Removes every occurrence of `name`, returning the first value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let first = self.get(name).map(str::to_string);
        self.0.retain(|(key, _)| key != name);
        first
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_query_string(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.0.iter())
            .finish()
    }

    /// `path` followed by the encoded parameters, if there are any.
    pub fn to_url(&self, path: &str) -> String {
        if self.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, self.to_query_string())
        }
    }

    /// Transformation specs from every `t[]`/`t` parameter, in request order.
    pub fn transformations(&self) -> Result<Vec<TransformationSpec>, RequestError> {
        self.0
            .iter()
            .filter(|(key, _)| TRANSFORMATION_PARAMS.contains(&key.as_str()))
            .map(|(_, raw)| {
                raw.parse::<TransformationSpec>()
                    .map_err(|source| RequestError::InvalidTransformation {
                        spec: raw.clone(),
                        source,
                    })
            })
            .collect()
    }

    /// Builds the image listing query from `page`, `limit`, `metadataQuery`,
    /// `from` and `to`.
    pub fn image_query(&self) -> Result<ImageQuery, RequestError> {
        let mut builder = ImageQueryBuilder::default();

        let limit = match self.get("limit") {
            Some(raw) => parse_positive("limit", raw)?,
            None => DEFAULT_LIMIT,
        };
        let page = match self.get("page") {
            Some(raw) => parse_positive("page", raw)?,
            None => 1,
        };
        builder.limit(limit).offset((page - 1).saturating_mul(limit));

        if let Some(raw) = self.get("metadataQuery") {
            let filters = match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(filters)) => filters,
                _ => {
                    return Err(RequestError::InvalidParameter {
                        name: "metadataQuery",
                        value: raw.to_string(),
                    })
                }
            };
            builder.metadata_query(filters);
        }
        if let Some(raw) = self.get("from") {
            builder.from(parse_instant("from", raw)?);
        }
        if let Some(raw) = self.get("to") {
            builder.to(parse_instant("to", raw)?);
        }

        builder.build().map_err(|e| RequestError::InvalidParameter {
            name: "query",
            value: e.to_string(),
        })
    }
}

fn parse_positive(name: &'static str, raw: &str) -> Result<usize, RequestError> {
    match raw.parse::<usize>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(RequestError::InvalidParameter {
            name,
            value: raw.to_string(),
        }),
    }
}

/// Accepts unix seconds or RFC 3339.
fn parse_instant(name: &'static str, raw: &str) -> Result<DateTime<Utc>, RequestError> {
    let invalid = || RequestError::InvalidParameter {
        name,
        value: raw.to_string(),
    };
    if let Ok(seconds) = raw.parse::<i64>() {
        return Utc.timestamp_opt(seconds, 0).single().ok_or_else(invalid);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid())
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

pub fn validate_owner(owner: &str) -> Result<&str, RequestError> {
    if owner.is_empty() || owner.len() > MAX_OWNER_LEN || !owner.chars().all(is_key_char) {
        return Err(RequestError::InvalidOwner(owner.to_string()));
    }
    Ok(owner)
}

pub fn validate_identifier(identifier: &str) -> Result<&str, RequestError> {
    if identifier.is_empty()
        || identifier.len() > MAX_IDENTIFIER_LEN
        || !identifier.chars().all(is_key_char)
    {
        return Err(RequestError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(identifier)
}

/// Splits the `{identifier}[.{extension}]` path segment.
pub fn parse_image_segment(segment: &str) -> Result<(&str, Option<MimeType>), RequestError> {
    match segment.rsplit_once('.') {
        Some((identifier, extension)) => {
            let mime_type = MimeType::from_extension(extension)
                .ok_or_else(|| RequestError::UnsupportedExtension(extension.to_string()))?;
            Ok((validate_identifier(identifier)?, Some(mime_type)))
        }
        None => Ok((validate_identifier(segment)?, None)),
    }
}

/// Metadata writes carry a JSON object either as the raw body or in a
/// `metadata` form field.
pub fn parse_metadata_body(body: &[u8]) -> Result<MetadataRecord, RequestError> {
    let text = std::str::from_utf8(body).map_err(|_| RequestError::InvalidJson)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(RequestError::MissingJson);
    }

    let raw = if text.starts_with('{') {
        text.to_string()
    } else {
        match RequestParams::parse(Some(text)).get("metadata") {
            Some(value) if value.trim().is_empty() => return Err(RequestError::MissingJson),
            Some(value) => value.to_string(),
            None => text.to_string(),
        }
    };

    let value: Value = serde_json::from_str(&raw).map_err(|_| RequestError::InvalidJson)?;
    MetadataRecord::try_from(value).map_err(|_| RequestError::InvalidJson)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_params_preserve_order_and_remove() {
        let mut params = RequestParams::parse(Some(
            "t[]=crop:width=10,height=10&signature=abc&t[]=border&timestamp=2024-01-01T00%3A00%3A00Z",
        ));
        assert_eq!(Some("abc"), params.get("signature"));
        assert_eq!(Some("abc".to_string()), params.remove("signature"));
        assert!(!params.contains("signature"));
        params.remove("timestamp");

        let names: Vec<String> = params
            .transformations()
            .unwrap()
            .into_iter()
            .map(|spec| spec.name)
            .collect();
        assert_eq!(vec!["crop", "border"], names);
        assert_eq!(
            "/users/a/images/b?t%5B%5D=crop%3Awidth%3D10%2Cheight%3D10&t%5B%5D=border",
            params.to_url("/users/a/images/b")
        );
    }

    #[test]
    fn test_image_segment() {
        assert_eq!(("abc", None), parse_image_segment("abc").unwrap());
        assert_eq!(
            ("abc", Some(MimeType::Jpeg)),
            parse_image_segment("abc.jpg").unwrap()
        );
        assert_eq!(
            Err(RequestError::UnsupportedExtension("bmp".to_string())),
            parse_image_segment("abc.bmp")
        );
        assert!(parse_image_segment("a/b").is_err());
        assert!(parse_image_segment("").is_err());
        assert!(validate_owner("publickey").is_ok());
        assert!(validate_owner("public key").is_err());
    }

    #[test]
    fn test_image_query_from_params() {
        let params = RequestParams::from_pairs([
            ("page", "3"),
            ("limit", "5"),
            ("metadataQuery", r#"{"style":"IPA"}"#),
            ("from", "1700000000"),
        ]);
        let query = params.image_query().unwrap();
        assert_eq!(5, query.limit);
        assert_eq!(10, query.offset);
        assert_eq!(Some(&json!("IPA")), query.metadata_query.get("style"));
        assert_eq!(1_700_000_000, query.from.unwrap().timestamp());
        assert!(query.to.is_none());

        let bad = RequestParams::from_pairs([("page", "0")]);
        assert!(bad.image_query().is_err());
        let bad = RequestParams::from_pairs([("metadataQuery", "[1]")]);
        assert!(bad.image_query().is_err());
    }

    #[test]
    fn test_metadata_body() {
        let record = parse_metadata_body(br#"{"foo":"bar"}"#).unwrap();
        assert_eq!(Some(&json!("bar")), record.get("foo"));

        let record = parse_metadata_body(b"metadata=%7B%22foo%22%3A1%7D").unwrap();
        assert_eq!(Some(&json!(1)), record.get("foo"));

        assert_eq!(Err(RequestError::MissingJson), parse_metadata_body(b""));
        assert_eq!(Err(RequestError::MissingJson), parse_metadata_body(b"metadata="));
        assert_eq!(Err(RequestError::InvalidJson), parse_metadata_body(b"{not json"));
        assert_eq!(Err(RequestError::InvalidJson), parse_metadata_body(b"[1,2]"));
    }
}
