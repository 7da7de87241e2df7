//! Raster codec: format detection, decoding and format-preserving encoding

use crate::error::{Result, WatermarkError};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// JPEG quality used when re-encoding watermarked derivatives
pub const JPEG_QUALITY: u8 = 95;

/// Raster formats a derivative can be stored in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Jpeg,
    Png,
    WebP,
}

impl ImageFormat {
    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::WebP => "webp",
        }
    }

    /// Get the MIME type for this format
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::WebP => "image/webp",
        }
    }

    /// Check if this format supports transparency
    pub fn supports_transparency(&self) -> bool {
        matches!(self, ImageFormat::Png | ImageFormat::WebP)
    }

    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        match mime_type.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(ImageFormat::Jpeg),
            "image/png" => Some(ImageFormat::Png),
            "image/webp" => Some(ImageFormat::WebP),
            _ => None,
        }
    }

    fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Jpeg => Some(ImageFormat::Jpeg),
            image::ImageFormat::Png => Some(ImageFormat::Png),
            image::ImageFormat::WebP => Some(ImageFormat::WebP),
            _ => None,
        }
    }

    fn as_image_format(&self) -> image::ImageFormat {
        match self {
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::WebP => image::ImageFormat::WebP,
        }
    }
}

/// A decoded raster together with the codec it came from
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub format: ImageFormat,
}

/// Sniff the format from the leading bytes
pub fn detect_format(bytes: &[u8]) -> Result<ImageFormat> {
    let guessed = image::guess_format(bytes).map_err(|e| WatermarkError::ImageDecode {
        message: format!("Unrecognized image data: {}", e),
    })?;

    ImageFormat::from_image_format(guessed).ok_or_else(|| WatermarkError::ImageDecode {
        message: format!("Unsupported image format: {:?}", guessed),
    })
}

/// Decode a derivative, remembering its codec for re-encoding
pub fn decode(bytes: &[u8]) -> Result<DecodedImage> {
    let format = detect_format(bytes)?;
    let image = image::load_from_memory_with_format(bytes, format.as_image_format()).map_err(
        |e| WatermarkError::ImageDecode {
            message: format!("Failed to decode {} image: {}", format.mime_type(), e),
        },
    )?;

    Ok(DecodedImage { image, format })
}

/// Encode an image in the given format.
///
/// JPEG is written at [`JPEG_QUALITY`], PNG with best compression and
/// adaptive filtering, WebP losslessly. Alpha is kept for formats that can
/// carry it and dropped for JPEG.
pub fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let keep_alpha = format.supports_transparency() && image.color().has_alpha();

    let result = match format {
        ImageFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
            image.to_rgb8().write_with_encoder(encoder)
        }
        ImageFormat::Png => {
            let encoder =
                PngEncoder::new_with_quality(&mut buffer, CompressionType::Best, FilterType::Adaptive);
            if keep_alpha {
                image.to_rgba8().write_with_encoder(encoder)
            } else {
                image.to_rgb8().write_with_encoder(encoder)
            }
        }
        ImageFormat::WebP => {
            let encoder = WebPEncoder::new_lossless(&mut buffer);
            if keep_alpha {
                image.to_rgba8().write_with_encoder(encoder)
            } else {
                image.to_rgb8().write_with_encoder(encoder)
            }
        }
    };

    result.map_err(|e| WatermarkError::ImageEncode {
        message: format!("Failed to encode {} image: {}", format.mime_type(), e),
    })?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn sample_rgb() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(40, 20, |x, y| {
            Rgb([(x * 6) as u8, (y * 12) as u8, 128])
        }))
    }

    fn sample_rgba() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(16, 16, |x, _| {
            Rgba([200, 10, 10, if x < 8 { 0 } else { 255 }])
        }))
    }

    #[test]
    fn test_image_format_properties() {
        assert_eq!(ImageFormat::Jpeg.extension(), "jpg");
        assert_eq!(ImageFormat::Png.mime_type(), "image/png");
        assert!(ImageFormat::Png.supports_transparency());
        assert!(!ImageFormat::Jpeg.supports_transparency());
        assert_eq!(ImageFormat::from_mime_type("IMAGE/WEBP"), Some(ImageFormat::WebP));
        assert_eq!(ImageFormat::from_mime_type("image/gif"), None);
    }

    #[test]
    fn test_encode_keeps_format() {
        for format in [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP] {
            let bytes = encode(&sample_rgb(), format).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded.format, format);
            assert_eq!((decoded.image.width(), decoded.image.height()), (40, 20));
        }
    }

    #[test]
    fn test_png_alpha_is_preserved() {
        let bytes = encode(&sample_rgba(), ImageFormat::Png).unwrap();
        let decoded = decode(&bytes).unwrap().image;
        assert!(decoded.color().has_alpha());
        assert_eq!(decoded.to_rgba8().get_pixel(0, 0)[3], 0);
        assert_eq!(decoded.to_rgba8().get_pixel(15, 0)[3], 255);
    }

    #[test]
    fn test_jpeg_drops_alpha() {
        let bytes = encode(&sample_rgba(), ImageFormat::Jpeg).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.format, ImageFormat::Jpeg);
        assert!(!decoded.image.color().has_alpha());
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let err = decode(b"definitely not an image").unwrap_err();
        assert_eq!(err.error_type(), "image_decode_error");

        // Valid PNG signature followed by nothing useful
        let err = decode(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]).unwrap_err();
        assert_eq!(err.error_type(), "image_decode_error");
    }
}
