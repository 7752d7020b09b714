pub mod tests {
    use std::io::Cursor;

    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

    use crate::{Image, ImageDocument, MimeType};

    pub const TEST_OWNER: &str = "publickey";
    pub const TEST_SECRET: &str = "privatekey";
    pub const TEST_IDENTIFIER: &str = "929db9c5fc3099f7576f5655207eba47";

    /// A deterministic gradient so that geometric transformations produce
    /// distinguishable output.
    pub fn mock_pixels(width: u32, height: u32) -> DynamicImage {
        let pixels = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([
                (x * 255 / width.max(1)) as u8,
                (y * 255 / height.max(1)) as u8,
                128,
                255,
            ])
        });
        DynamicImage::ImageRgba8(pixels)
    }

    pub fn mock_encoded(width: u32, height: u32, format: ImageFormat) -> Bytes {
        let mut buf = Cursor::new(Vec::new());
        let pixels = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(mock_pixels(width, height).to_rgb8()),
            _ => mock_pixels(width, height),
        };
        pixels
            .write_to(&mut buf, format)
            .expect("unable to encode mock image");
        Bytes::from(buf.into_inner())
    }

    pub fn mock_png(width: u32, height: u32) -> Bytes {
        mock_encoded(width, height, ImageFormat::Png)
    }

    pub fn mock_image(owner: &str, identifier: &str, width: u32, height: u32) -> Image {
        Image::prepare(owner, identifier, mock_png(width, height), Utc::now())
            .expect("mock png must be valid")
    }

    pub fn mock_document(owner: &str, identifier: &str, added: DateTime<Utc>) -> ImageDocument {
        let mut image = Image::prepare(owner, identifier, mock_png(4, 4), added)
            .expect("mock png must be valid");
        image.take_blob();
        assert_eq!(MimeType::Png, image.mime_type);
        ImageDocument::new(image)
    }
}
