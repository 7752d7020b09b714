pub mod builtin;
pub mod registry;

use std::io::Cursor;

use bytes::Bytes;
use data_model::{MimeType, TransformationParams};
use image::{codecs::jpeg::JpegEncoder, DynamicImage, ImageError, Rgba};

pub use self::{
    builtin::{BuiltinKind, BuiltinTransformation},
    registry::{Capability, RegistryError, TransformationRegistry},
};

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Largest width or height a transformation may produce.
pub const DEFAULT_MAX_DIMENSION: u32 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum TransformationError {
    #[error("Missing required parameter '{param}' for transformation {transformation}")]
    MissingParameter {
        transformation: String,
        param: String,
    },

    #[error("Invalid value '{value}' for parameter '{param}' of transformation {transformation}")]
    InvalidParameter {
        transformation: String,
        param: String,
        value: String,
    },

    #[error("Transformation {transformation} failed: {reason}")]
    Failed {
        transformation: String,
        reason: String,
    },

    #[error("Unable to decode image: {0}")]
    Decode(#[source] ImageError),

    #[error("Unable to encode image: {0}")]
    Encode(#[source] ImageError),
}

impl TransformationError {
    pub fn failed(transformation: &str, reason: impl ToString) -> Self {
        Self::Failed {
            transformation: transformation.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A parameterized operation on the working image. Implementations must be
/// pure: the same input and parameters always give the same output.
pub trait Transformation: Send + Sync {
    fn apply(&self, image: &mut WorkingImage) -> Result<(), TransformationError>;
}

/// Builds a [`Transformation`] from request parameters. Registered with
/// [`TransformationRegistry::register`] to extend the built-in set.
pub trait TransformationFactory: Send + Sync {
    fn create(
        &self,
        params: &TransformationParams,
    ) -> Result<Box<dyn Transformation>, TransformationError>;
}

/// The image a pipeline run operates on.
///
/// Pixels are only decoded when a transformation asks for them, and the
/// result is only re-encoded when something changed, so a run without
/// effective transformations hands back the stored bytes untouched.
pub struct WorkingImage {
    source: Bytes,
    source_mime_type: MimeType,
    pixels: Option<DynamicImage>,
    mime_type: MimeType,
    width: u32,
    height: u32,
    quality: Option<u8>,
    modified: bool,
    max_dimension: u32,
}

impl WorkingImage {
    pub fn new(source: Bytes, mime_type: MimeType, width: u32, height: u32) -> Self {
        Self {
            source,
            source_mime_type: mime_type,
            pixels: None,
            mime_type,
            width,
            height,
            quality: None,
            modified: false,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    pub fn max_dimension(&self) -> u32 {
        self.max_dimension
    }

    /// Rejects an output size before anything of that size is allocated.
    /// `None` stands for a size that overflowed while it was computed.
    pub fn check_output(
        &self,
        transformation: &str,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<(u32, u32), TransformationError> {
        match (width, height) {
            (Some(width), Some(height))
                if width <= self.max_dimension && height <= self.max_dimension =>
            {
                Ok((width, height))
            }
            (Some(width), Some(height)) => Err(TransformationError::failed(
                transformation,
                format!(
                    "output of {width}x{height} exceeds the maximum dimension of {}",
                    self.max_dimension
                ),
            )),
            _ => Err(TransformationError::failed(
                transformation,
                "output dimensions are out of range",
            )),
        }
    }

    pub fn mime_type(&self) -> MimeType {
        self.mime_type
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Takes the decoded pixels out of the buffer. Callers put the result
    /// back with [`WorkingImage::replace_pixels`].
    pub fn take_pixels(&mut self) -> Result<DynamicImage, TransformationError> {
        match self.pixels.take() {
            Some(pixels) => Ok(pixels),
            None => image::load_from_memory_with_format(
                &self.source,
                self.source_mime_type.image_format(),
            )
            .map_err(TransformationError::Decode),
        }
    }

    pub fn replace_pixels(&mut self, pixels: DynamicImage) {
        self.width = pixels.width();
        self.height = pixels.height();
        self.pixels = Some(pixels);
        self.modified = true;
    }

    pub fn set_mime_type(&mut self, mime_type: MimeType) {
        if mime_type != self.mime_type {
            self.mime_type = mime_type;
            self.modified = true;
        }
    }

    pub fn set_quality(&mut self, quality: u8) {
        self.quality = Some(quality);
        self.modified = true;
    }

    pub fn encode(mut self) -> Result<Bytes, TransformationError> {
        if !self.modified {
            return Ok(self.source);
        }
        let pixels = self.take_pixels()?;
        let mut buf = Cursor::new(Vec::new());
        let written = match self.mime_type {
            MimeType::Jpeg => {
                let quality = self.quality.unwrap_or(DEFAULT_JPEG_QUALITY);
                DynamicImage::ImageRgb8(pixels.to_rgb8())
                    .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))
            }
            other => DynamicImage::ImageRgba8(pixels.to_rgba8())
                .write_to(&mut buf, other.image_format()),
        };
        written.map_err(TransformationError::Encode)?;
        Ok(Bytes::from(buf.into_inner()))
    }
}

/// Typed access to one transformation's parameters.
pub struct Params<'a> {
    transformation: &'a str,
    params: &'a TransformationParams,
}

impl<'a> Params<'a> {
    pub fn new(transformation: &'a str, params: &'a TransformationParams) -> Self {
        Self {
            transformation,
            params,
        }
    }

    fn invalid(&self, param: &str, value: &str) -> TransformationError {
        TransformationError::InvalidParameter {
            transformation: self.transformation.to_string(),
            param: param.to_string(),
            value: value.to_string(),
        }
    }

    pub fn get(&self, param: &str) -> Option<&'a str> {
        self.params.get(param).map(String::as_str)
    }

    pub fn required(&self, param: &str) -> Result<&'a str, TransformationError> {
        self.get(param)
            .ok_or_else(|| TransformationError::MissingParameter {
                transformation: self.transformation.to_string(),
                param: param.to_string(),
            })
    }

    pub fn parse<T: std::str::FromStr>(&self, param: &str) -> Result<Option<T>, TransformationError> {
        self.get(param)
            .map(|raw| raw.trim().parse::<T>().map_err(|_| self.invalid(param, raw)))
            .transpose()
    }

    pub fn parse_or<T: std::str::FromStr>(
        &self,
        param: &str,
        default: T,
    ) -> Result<T, TransformationError> {
        Ok(self.parse(param)?.unwrap_or(default))
    }

    pub fn required_parse<T: std::str::FromStr>(&self, param: &str) -> Result<T, TransformationError> {
        let raw = self.required(param)?;
        raw.trim().parse::<T>().map_err(|_| self.invalid(param, raw))
    }

    /// A dimension: a positive integer.
    pub fn dimension(&self, param: &str) -> Result<Option<u32>, TransformationError> {
        match self.parse::<u32>(param)? {
            Some(0) => Err(self.invalid(param, "0")),
            other => Ok(other),
        }
    }

    pub fn color_or(&self, param: &str, default: &str) -> Result<Rgba<u8>, TransformationError> {
        let raw = self.get(param).unwrap_or(default);
        parse_color(raw).ok_or_else(|| self.invalid(param, raw))
    }

    pub fn one_of<T: Copy>(
        &self,
        param: &str,
        choices: &[(&str, T)],
        default: T,
    ) -> Result<T, TransformationError> {
        let Some(raw) = self.get(param) else {
            return Ok(default);
        };
        choices
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(raw.trim()))
            .map(|(_, value)| *value)
            .ok_or_else(|| self.invalid(param, raw))
    }

    pub fn invalid_value(&self, param: &str, value: &str) -> TransformationError {
        self.invalid(param, value)
    }
}

/// `rgb` or `rrggbb`, with or without a leading `#`.
pub fn parse_color(raw: &str) -> Option<Rgba<u8>> {
    let hex = raw.trim().trim_start_matches('#');
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let expanded: String = match hex.len() {
        3 => hex.chars().flat_map(|c| [c, c]).collect(),
        6 => hex.to_string(),
        _ => return None,
    };
    let channel = |i: usize| u8::from_str_radix(&expanded[i..i + 2], 16).ok();
    Some(Rgba([channel(0)?, channel(2)?, channel(4)?, 255]))
}
