use data_model::{MimeType, TransformationParams};
use image::{
    imageops::{self, FilterType},
    DynamicImage,
    GenericImageView,
    Rgba,
    RgbaImage,
};
use strum::{AsRefStr, EnumIter, EnumString};

use super::{Params, TransformationError, WorkingImage};

const FILTER: FilterType = FilterType::Triangle;

/// Names of the transformations every registry starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumIter, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum BuiltinKind {
    Border,
    Canvas,
    Compress,
    Convert,
    Crop,
    FlipHorizontally,
    FlipVertically,
    Resize,
    Rotate,
    Thumbnail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderMode {
    /// Grows the image by the border on each side.
    Outbound,
    /// Paints the border over the outer pixels, keeping the size.
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanvasMode {
    Free,
    Center,
    CenterX,
    CenterY,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailFit {
    Outbound,
    Inset,
}

/// A built-in transformation with its parameters already validated.
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinTransformation {
    Border {
        color: Rgba<u8>,
        width: u32,
        height: u32,
        mode: BorderMode,
    },
    Canvas {
        width: Option<u32>,
        height: Option<u32>,
        mode: CanvasMode,
        x: u32,
        y: u32,
        background: Rgba<u8>,
    },
    Compress {
        quality: u8,
    },
    Convert {
        mime_type: MimeType,
    },
    Crop {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    FlipHorizontally,
    FlipVertically,
    Resize {
        width: Option<u32>,
        height: Option<u32>,
    },
    Rotate {
        quarter_turns: u8,
    },
    Thumbnail {
        width: u32,
        height: u32,
        fit: ThumbnailFit,
    },
}

impl BuiltinKind {
    pub fn instantiate(
        self,
        params: &TransformationParams,
    ) -> Result<BuiltinTransformation, TransformationError> {
        let p = Params::new(self.as_ref(), params);
        let transformation = match self {
            BuiltinKind::Border => BuiltinTransformation::Border {
                color: p.color_or("color", "000000")?,
                width: p.parse_or("width", 1)?,
                height: p.parse_or("height", 1)?,
                mode: p.one_of(
                    "mode",
                    &[("outbound", BorderMode::Outbound), ("inline", BorderMode::Inline)],
                    BorderMode::Outbound,
                )?,
            },
            BuiltinKind::Canvas => BuiltinTransformation::Canvas {
                width: p.dimension("width")?,
                height: p.dimension("height")?,
                mode: p.one_of(
                    "mode",
                    &[
                        ("free", CanvasMode::Free),
                        ("center", CanvasMode::Center),
                        ("center-x", CanvasMode::CenterX),
                        ("center-y", CanvasMode::CenterY),
                    ],
                    CanvasMode::Free,
                )?,
                x: p.parse_or("x", 0)?,
                y: p.parse_or("y", 0)?,
                background: p.color_or("bg", "ffffff")?,
            },
            BuiltinKind::Compress => {
                let quality: u8 = p.required_parse("quality")?;
                if !(1..=100).contains(&quality) {
                    return Err(p.invalid_value("quality", &quality.to_string()));
                }
                BuiltinTransformation::Compress { quality }
            }
            BuiltinKind::Convert => {
                let extension = p.required("type")?;
                let mime_type = MimeType::from_extension(extension.trim())
                    .ok_or_else(|| p.invalid_value("type", extension))?;
                BuiltinTransformation::Convert { mime_type }
            }
            BuiltinKind::Crop => BuiltinTransformation::Crop {
                x: p.parse_or("x", 0)?,
                y: p.parse_or("y", 0)?,
                width: p
                    .dimension("width")?
                    .ok_or_else(|| missing(self, "width"))?,
                height: p
                    .dimension("height")?
                    .ok_or_else(|| missing(self, "height"))?,
            },
            BuiltinKind::FlipHorizontally => BuiltinTransformation::FlipHorizontally,
            BuiltinKind::FlipVertically => BuiltinTransformation::FlipVertically,
            BuiltinKind::Resize => {
                let width = p.dimension("width")?;
                let height = p.dimension("height")?;
                if width.is_none() && height.is_none() {
                    return Err(missing(self, "width"));
                }
                BuiltinTransformation::Resize { width, height }
            }
            BuiltinKind::Rotate => {
                let raw = p.required("angle")?;
                let angle: f64 = p.required_parse("angle")?;
                let normalized = angle.rem_euclid(360.0);
                if normalized % 90.0 != 0.0 {
                    return Err(p.invalid_value("angle", raw));
                }
                BuiltinTransformation::Rotate {
                    quarter_turns: (normalized / 90.0) as u8,
                }
            }
            BuiltinKind::Thumbnail => BuiltinTransformation::Thumbnail {
                width: p.dimension("width")?.unwrap_or(50),
                height: p.dimension("height")?.unwrap_or(50),
                fit: p.one_of(
                    "fit",
                    &[("outbound", ThumbnailFit::Outbound), ("inset", ThumbnailFit::Inset)],
                    ThumbnailFit::Outbound,
                )?,
            },
        };
        Ok(transformation)
    }
}

fn missing(kind: BuiltinKind, param: &str) -> TransformationError {
    TransformationError::MissingParameter {
        transformation: kind.as_ref().to_string(),
        param: param.to_string(),
    }
}

impl BuiltinTransformation {
    pub fn apply(&self, image: &mut WorkingImage) -> Result<(), TransformationError> {
        match *self {
            BuiltinTransformation::Compress { quality } => image.set_quality(quality),
            BuiltinTransformation::Convert { mime_type } => image.set_mime_type(mime_type),
            _ => {
                let pixels = image.take_pixels()?;
                let rendered = self.render(pixels, image)?;
                image.replace_pixels(rendered);
            }
        }
        Ok(())
    }

    /// Output dimensions are checked against `limits` before rendering.
    fn render(
        &self,
        pixels: DynamicImage,
        limits: &WorkingImage,
    ) -> Result<DynamicImage, TransformationError> {
        let rendered = match *self {
            BuiltinTransformation::Border {
                color,
                width,
                height,
                mode,
            } => {
                let outer = match mode {
                    BorderMode::Outbound => limits.check_output(
                        BuiltinKind::Border.as_ref(),
                        grown(pixels.width(), width),
                        grown(pixels.height(), height),
                    )?,
                    BorderMode::Inline => pixels.dimensions(),
                };
                border(&pixels, color, (width, height), outer, mode)
            }
            BuiltinTransformation::Canvas {
                width,
                height,
                mode,
                x,
                y,
                background,
            } => {
                let (width, height) = limits.check_output(
                    BuiltinKind::Canvas.as_ref(),
                    Some(width.unwrap_or(pixels.width())),
                    Some(height.unwrap_or(pixels.height())),
                )?;
                let centered = |outer: u32, inner: u32| (i64::from(outer) - i64::from(inner)) / 2;
                let (x, y) = match mode {
                    CanvasMode::Free => (i64::from(x), i64::from(y)),
                    CanvasMode::Center => (
                        centered(width, pixels.width()),
                        centered(height, pixels.height()),
                    ),
                    CanvasMode::CenterX => (centered(width, pixels.width()), i64::from(y)),
                    CanvasMode::CenterY => (i64::from(x), centered(height, pixels.height())),
                };
                let mut canvas = RgbaImage::from_pixel(width, height, background);
                imageops::overlay(&mut canvas, &pixels.to_rgba8(), x, y);
                DynamicImage::ImageRgba8(canvas)
            }
            BuiltinTransformation::Crop {
                x,
                y,
                width,
                height,
            } => {
                let fits_x = x.checked_add(width).is_some_and(|right| right <= pixels.width());
                let fits_y = y.checked_add(height).is_some_and(|bottom| bottom <= pixels.height());
                if !fits_x || !fits_y {
                    return Err(TransformationError::failed(
                        BuiltinKind::Crop.as_ref(),
                        format!(
                            "crop area {width}x{height}+{x}+{y} is outside of the {}x{} image",
                            pixels.width(),
                            pixels.height()
                        ),
                    ));
                }
                pixels.crop_imm(x, y, width, height)
            }
            BuiltinTransformation::FlipHorizontally => pixels.fliph(),
            BuiltinTransformation::FlipVertically => pixels.flipv(),
            BuiltinTransformation::Resize { width, height } => {
                let (width, height) = scaled(pixels.dimensions(), width, height);
                let (width, height) =
                    limits.check_output(BuiltinKind::Resize.as_ref(), width, height)?;
                pixels.resize_exact(width, height, FILTER)
            }
            BuiltinTransformation::Rotate { quarter_turns } => match quarter_turns {
                1 => pixels.rotate90(),
                2 => pixels.rotate180(),
                3 => pixels.rotate270(),
                _ => pixels,
            },
            BuiltinTransformation::Thumbnail { width, height, fit } => {
                let (width, height) =
                    limits.check_output(BuiltinKind::Thumbnail.as_ref(), Some(width), Some(height))?;
                match fit {
                    ThumbnailFit::Outbound => pixels.resize_to_fill(width, height, FILTER),
                    ThumbnailFit::Inset => pixels.resize(width, height, FILTER),
                }
            }
            BuiltinTransformation::Compress { .. } | BuiltinTransformation::Convert { .. } => {
                pixels
            }
        };
        Ok(rendered)
    }
}

/// Fills in a missing target dimension so the aspect ratio is kept. `None`
/// when the scaled side does not fit in a `u32`.
fn scaled(
    (w, h): (u32, u32),
    width: Option<u32>,
    height: Option<u32>,
) -> (Option<u32>, Option<u32>) {
    // a * b / c, rounded half up.
    let ratio = |a: u32, b: u32, c: u32| {
        let c = u128::from(c.max(1));
        let rounded = (u128::from(a) * u128::from(b) * 2 + c) / (c * 2);
        u32::try_from(rounded.max(1)).ok()
    };
    match (width, height) {
        (Some(width), Some(height)) => (Some(width), Some(height)),
        (Some(width), None) => (Some(width), ratio(width, h, w)),
        (None, Some(height)) => (ratio(height, w, h), Some(height)),
        (None, None) => (Some(w), Some(h)),
    }
}

/// `side` plus a border on both ends.
fn grown(side: u32, border: u32) -> Option<u32> {
    border.checked_mul(2)?.checked_add(side)
}

/// `outer` is the size of the bordered image, already checked.
fn border(
    pixels: &DynamicImage,
    color: Rgba<u8>,
    (width, height): (u32, u32),
    (outer_width, outer_height): (u32, u32),
    mode: BorderMode,
) -> DynamicImage {
    let (w, h) = pixels.dimensions();
    match mode {
        BorderMode::Outbound => {
            let mut canvas = RgbaImage::from_pixel(outer_width, outer_height, color);
            imageops::overlay(&mut canvas, &pixels.to_rgba8(), i64::from(width), i64::from(height));
            DynamicImage::ImageRgba8(canvas)
        }
        BorderMode::Inline => {
            let mut canvas = pixels.to_rgba8();
            for (x, y, pixel) in canvas.enumerate_pixels_mut() {
                let on_border = x < width
                    || y < height
                    || x >= w.saturating_sub(width)
                    || y >= h.saturating_sub(height);
                if on_border {
                    *pixel = color;
                }
            }
            DynamicImage::ImageRgba8(canvas)
        }
    }
}
