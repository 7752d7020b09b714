pub mod query;
pub mod test_objects;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    io::Cursor,
    str::FromStr,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
pub use query::{ImageQuery, ImageQueryBuilder, MetadataFilter};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, EnumIter, EnumString};

/// Image formats the service knows how to store and produce.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    AsRefStr,
    EnumIter,
    EnumString,
)]
pub enum MimeType {
    #[serde(rename = "image/png")]
    #[strum(serialize = "image/png")]
    Png,
    #[serde(rename = "image/jpeg")]
    #[strum(serialize = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/gif")]
    #[strum(serialize = "image/gif")]
    Gif,
    #[serde(rename = "image/webp")]
    #[strum(serialize = "image/webp")]
    Webp,
}

impl MimeType {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }

    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            Self::Png => image::ImageFormat::Png,
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Gif => image::ImageFormat::Gif,
            Self::Webp => image::ImageFormat::WebP,
        }
    }

    pub fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Png => Some(Self::Png),
            image::ImageFormat::Jpeg => Some(Self::Jpeg),
            image::ImageFormat::Gif => Some(Self::Gif),
            image::ImageFormat::WebP => Some(Self::Webp),
            _ => None,
        }
    }
}

impl Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PreparationError {
    #[error("No image attached")]
    Empty,

    #[error("Unsupported image type")]
    UnsupportedType,
}

/// An image owned by a single owner key.
///
/// Every field except `blob` is what the metadata store persists. The blob is
/// only present once the bytes have been loaded from the blob store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub owner: String,
    pub identifier: String,
    pub mime_type: MimeType,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
    pub extension: String,
    pub checksum: String,
    pub added: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(skip)]
    blob: Option<Bytes>,
}

impl Image {
    /// Sniffs the uploaded bytes and builds the record that gets inserted on
    /// create. Only the header is decoded.
    pub fn prepare(
        owner: &str,
        identifier: &str,
        blob: Bytes,
        now: DateTime<Utc>,
    ) -> Result<Image, PreparationError> {
        if blob.is_empty() {
            return Err(PreparationError::Empty);
        }
        let reader = image::ImageReader::new(Cursor::new(&blob[..]))
            .with_guessed_format()
            .map_err(|_| PreparationError::UnsupportedType)?;
        let mime_type = reader
            .format()
            .and_then(MimeType::from_image_format)
            .ok_or(PreparationError::UnsupportedType)?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|_| PreparationError::UnsupportedType)?;

        Ok(Image {
            owner: owner.to_string(),
            identifier: identifier.to_string(),
            mime_type,
            width,
            height,
            file_size: blob.len() as u64,
            extension: mime_type.extension().to_string(),
            checksum: hex::encode(Sha256::digest(&blob)),
            added: now,
            updated: now,
            blob: Some(blob),
        })
    }

    pub fn blob(&self) -> Option<&Bytes> {
        self.blob.as_ref()
    }

    pub fn has_blob(&self) -> bool {
        self.blob.is_some()
    }

    pub fn set_blob(&mut self, blob: Bytes) {
        self.blob = Some(blob);
    }

    pub fn take_blob(&mut self) -> Option<Bytes> {
        self.blob.take()
    }

    /// A copy of the record without the loaded bytes.
    pub fn without_blob(&self) -> Image {
        Image {
            blob: None,
            ..self.clone()
        }
    }
}

/// User supplied metadata attached to exactly one image.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct MetadataRecord(serde_json::Map<String, serde_json::Value>);

impl MetadataRecord {
    pub fn new(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(fields)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Overwrites the top level keys present in `other`, keeping the rest.
    pub fn merge(&mut self, other: MetadataRecord) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    /// Resolves a dotted path such as `brewery.country`.
    pub fn lookup(&self, dotted_path: &str) -> Option<&serde_json::Value> {
        let mut segments = dotted_path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn into_inner(self) -> serde_json::Map<String, serde_json::Value> {
        self.0
    }
}

impl TryFrom<serde_json::Value> for MetadataRecord {
    type Error = serde_json::Value;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::Object(fields) => Ok(Self(fields)),
            other => Err(other),
        }
    }
}

/// The unit both metadata store backends persist per (owner, identifier).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageDocument {
    pub image: Image,
    #[serde(default)]
    pub metadata: MetadataRecord,
}

impl ImageDocument {
    pub fn new(image: Image) -> Self {
        Self {
            image: image.without_blob(),
            metadata: MetadataRecord::default(),
        }
    }
}

pub type TransformationParams = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidTransformationSpec {
    #[error("Missing transformation name in: {0}")]
    MissingName(String),

    #[error("Invalid transformation parameter: {0}")]
    InvalidParameter(String),
}

/// One entry of an ordered transformation chain, e.g.
/// `crop:x=0,y=0,width=10,height=10`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationSpec {
    pub name: String,
    #[serde(default)]
    pub params: TransformationParams,
}

impl TransformationSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: TransformationParams::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn convert_to(mime_type: MimeType) -> Self {
        Self::new("convert").with_param("type", mime_type.extension())
    }
}

impl FromStr for TransformationSpec {
    type Err = InvalidTransformationSpec;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (name, params) = match raw.split_once(':') {
            Some((name, params)) => (name.trim(), params),
            None => (raw.trim(), ""),
        };
        if name.is_empty() {
            return Err(InvalidTransformationSpec::MissingName(raw.to_string()));
        }

        let mut spec = TransformationSpec::new(name);
        for pair in params.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| InvalidTransformationSpec::InvalidParameter(pair.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(InvalidTransformationSpec::InvalidParameter(
                    pair.to_string(),
                ));
            }
            spec.params.insert(key.to_string(), value.trim().to_string());
        }
        Ok(spec)
    }
}

impl Display for TransformationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.params.is_empty() {
            let params = self
                .params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            write!(f, ":{params}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_objects::tests::{mock_png, TEST_OWNER};

    #[test]
    fn test_mime_type_strings() {
        assert_eq!("image/png", MimeType::Png.as_ref());
        assert_eq!(Ok(MimeType::Webp), MimeType::from_str("image/webp"));
        assert_eq!(Some(MimeType::Jpeg), MimeType::from_extension("JPEG"));
        assert_eq!("jpg", MimeType::Jpeg.extension());
        assert_eq!(None, MimeType::from_extension("tiff"));
        assert_eq!(
            "\"image/gif\"",
            serde_json::to_string(&MimeType::Gif).unwrap()
        );
    }

    #[test]
    fn test_prepare_png() {
        let blob = mock_png(100, 50);
        let image = Image::prepare(TEST_OWNER, "abc", blob.clone(), Utc::now()).unwrap();
        assert_eq!(MimeType::Png, image.mime_type);
        assert_eq!(100, image.width);
        assert_eq!(50, image.height);
        assert_eq!(blob.len() as u64, image.file_size);
        assert_eq!("png", image.extension);
        assert_eq!(64, image.checksum.len());
        assert_eq!(Some(&blob), image.blob());
        assert!(!image.without_blob().has_blob());
    }

    #[test]
    fn test_prepare_rejects_garbage() {
        assert_eq!(
            Err(PreparationError::Empty),
            Image::prepare(TEST_OWNER, "abc", Bytes::new(), Utc::now())
        );
        assert_eq!(
            Err(PreparationError::UnsupportedType),
            Image::prepare(
                TEST_OWNER,
                "abc",
                Bytes::from_static(b"definitely not an image"),
                Utc::now()
            )
        );
    }

    #[test]
    fn test_blob_is_not_serialized() {
        let image = Image::prepare(TEST_OWNER, "abc", mock_png(2, 2), Utc::now()).unwrap();
        let value = serde_json::to_value(&image).unwrap();
        assert!(value.get("blob").is_none());
        assert_eq!("image/png", value["mimeType"]);

        let decoded: Image = serde_json::from_value(value).unwrap();
        assert!(!decoded.has_blob());
    }

    #[test]
    fn test_parse_transformation_spec() {
        let spec: TransformationSpec = "crop:x=1,y=2,width=30,height=40".parse().unwrap();
        assert_eq!("crop", spec.name);
        assert_eq!(Some(&"30".to_string()), spec.params.get("width"));
        assert_eq!(4, spec.params.len());

        let spec: TransformationSpec = "flipHorizontally".parse().unwrap();
        assert_eq!("flipHorizontally", spec.name);
        assert!(spec.params.is_empty());

        assert!(matches!(
            ":width=1".parse::<TransformationSpec>(),
            Err(InvalidTransformationSpec::MissingName(_))
        ));
        assert!(matches!(
            "border:width".parse::<TransformationSpec>(),
            Err(InvalidTransformationSpec::InvalidParameter(_))
        ));
        assert_eq!(
            "convert:type=webp",
            TransformationSpec::convert_to(MimeType::Webp).to_string()
        );
    }

    #[test]
    fn test_metadata_lookup_and_merge() {
        let mut record =
            MetadataRecord::try_from(json!({"style": "IPA", "brewery": {"country": "NO"}}))
                .unwrap();
        assert_eq!(Some(&json!("NO")), record.lookup("brewery.country"));
        assert_eq!(None, record.lookup("brewery.city"));

        record.merge(MetadataRecord::try_from(json!({"style": "Stout", "abv": 9})).unwrap());
        assert_eq!(Some(&json!("Stout")), record.get("style"));
        assert_eq!(Some(&json!(9)), record.get("abv"));
        assert!(record.get("brewery").is_some());

        assert!(MetadataRecord::try_from(json!(["not", "an", "object"])).is_err());
    }
}
