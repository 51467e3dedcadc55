//! Final encoding of the canvas into the target codec.

use crate::{errors::MediaResult, models::transform::OutputFormat};
use image::{
    DynamicImage,
    codecs::{
        avif::AvifEncoder,
        jpeg::JpegEncoder,
        png::{CompressionType, FilterType as PngFilter, PngEncoder},
    },
};
use std::io::Cursor;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;
pub const DEFAULT_AVIF_QUALITY: u8 = 50;
const AVIF_SPEED: u8 = 8;

/// Formats where a compress level changes the encoder settings. Everything
/// else ignores it.
pub fn supports_quality(format: OutputFormat) -> bool {
    matches!(
        format,
        OutputFormat::Jpeg | OutputFormat::Png | OutputFormat::Avif
    )
}

/// JPEG has no alpha channel so it is encoded from RGB8; every other codec
/// gets RGBA8.
pub fn encode(image: &DynamicImage, format: OutputFormat, quality: Option<u8>) -> MediaResult<Vec<u8>> {
    let mut buf = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            let encoder =
                JpegEncoder::new_with_quality(&mut buf, quality.unwrap_or(DEFAULT_JPEG_QUALITY));
            rgb.write_with_encoder(encoder)?;
        }
        OutputFormat::Png => {
            let compression = match quality {
                Some(_) => CompressionType::Best,
                None => CompressionType::Default,
            };
            let encoder = PngEncoder::new_with_quality(&mut buf, compression, PngFilter::Adaptive);
            DynamicImage::ImageRgba8(image.to_rgba8()).write_with_encoder(encoder)?;
        }
        OutputFormat::Avif => {
            let encoder = AvifEncoder::new_with_speed_quality(
                &mut buf,
                AVIF_SPEED,
                quality.unwrap_or(DEFAULT_AVIF_QUALITY),
            );
            DynamicImage::ImageRgba8(image.to_rgba8()).write_with_encoder(encoder)?;
        }
        other => {
            DynamicImage::ImageRgba8(image.to_rgba8())
                .write_to(&mut Cursor::new(&mut buf), other.image_format())?;
        }
    }
    Ok(buf)
}
