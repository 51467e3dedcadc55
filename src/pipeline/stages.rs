//! Pixel operations behind each pipeline stage.

use crate::{
    errors::{MediaError, MediaResult},
    models::transform::{CropRect, WatermarkPlan},
    services::watermark::FetchedImage,
};
use image::{DynamicImage, RgbaImage, imageops, imageops::FilterType};

/// Sepia recombination matrix, one row per output channel (r, g, b).
pub const SEPIA_MATRIX: [[f32; 3]; 3] = [
    [0.3588, 0.7044, 0.1368],
    [0.299, 0.587, 0.114],
    [0.2392, 0.4696, 0.0912],
];

/// Watermarks are scaled to this fraction of the canvas width.
pub const WATERMARK_WIDTH_RATIO: f64 = 0.2;

pub fn resize(image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    image.resize_exact(width, height, FilterType::Lanczos3)
}

/// Clockwise rotation. Right angles are lossless; other angles expand the
/// canvas to fit and fill the corners with transparent black.
pub fn rotate(image: DynamicImage, degrees: f64) -> DynamicImage {
    let folded = degrees.rem_euclid(360.0);
    if folded == 0.0 || folded >= 360.0 {
        image
    } else if folded == 90.0 {
        image.rotate90()
    } else if folded == 180.0 {
        image.rotate180()
    } else if folded == 270.0 {
        image.rotate270()
    } else {
        rotate_free(&image, folded)
    }
}

fn rotate_free(image: &DynamicImage, degrees: f64) -> DynamicImage {
    let src = image.to_rgba8();
    let (w, h) = src.dimensions();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let (wf, hf) = (f64::from(w), f64::from(h));
    let out_w = (wf * cos.abs() + hf * sin.abs()).round().max(1.0) as u32;
    let out_h = (wf * sin.abs() + hf * cos.abs()).round().max(1.0) as u32;
    let (cx, cy) = (wf / 2.0, hf / 2.0);
    let (ox, oy) = (f64::from(out_w) / 2.0, f64::from(out_h) / 2.0);

    let mut out = RgbaImage::new(out_w, out_h);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        // inverse-map the destination pixel centre back into the source
        let dx = f64::from(x) + 0.5 - ox;
        let dy = f64::from(y) + 0.5 - oy;
        let sx = dx * cos + dy * sin + cx;
        let sy = -dx * sin + dy * cos + cy;
        if sx >= 0.0 && sy >= 0.0 && sx < wf && sy < hf {
            *pixel = *src.get_pixel(sx as u32, sy as u32);
        }
    }
    DynamicImage::ImageRgba8(out)
}

pub fn crop(image: &DynamicImage, rect: CropRect) -> MediaResult<DynamicImage> {
    let (w, h) = (image.width(), image.height());
    let fits = u64::from(rect.x) + u64::from(rect.width) <= u64::from(w)
        && u64::from(rect.y) + u64::from(rect.height) <= u64::from(h);
    if !fits {
        return Err(MediaError::invalid_spec(format!(
            "crop {}x{}+{}+{} exceeds {}x{} canvas",
            rect.width, rect.height, rect.x, rect.y, w, h
        )));
    }
    Ok(image.crop_imm(rect.x, rect.y, rect.width, rect.height))
}

pub fn sepia(image: &DynamicImage) -> DynamicImage {
    let mut rgba = image.to_rgba8();
    for pixel in rgba.pixels_mut() {
        let [r, g, b, a] = pixel.0;
        let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
        let mix = |row: [f32; 3]| (row[0] * r + row[1] * g + row[2] * b).round().clamp(0.0, 255.0) as u8;
        pixel.0 = [
            mix(SEPIA_MATRIX[0]),
            mix(SEPIA_MATRIX[1]),
            mix(SEPIA_MATRIX[2]),
            a,
        ];
    }
    DynamicImage::ImageRgba8(rgba)
}

/// Scale the mark to a fraction of the canvas width (aspect kept), apply
/// opacity and composite it at the anchor.
pub fn watermark(
    canvas: &DynamicImage,
    fetched: &FetchedImage,
    plan: &WatermarkPlan,
) -> MediaResult<DynamicImage> {
    let mark = image::load_from_memory(&fetched.bytes).map_err(|err| {
        MediaError::InvalidWatermarkSource(format!("{}: undecodable image: {err}", plan.url))
    })?;
    let (cw, ch) = (canvas.width(), canvas.height());
    let target_w = (f64::from(cw) * WATERMARK_WIDTH_RATIO).floor().max(1.0) as u32;
    let target_h = (f64::from(mark.height()) * f64::from(target_w) / f64::from(mark.width()))
        .round()
        .max(1.0) as u32;

    let mut mark = mark
        .resize_exact(target_w, target_h, FilterType::Lanczos3)
        .to_rgba8();
    if plan.opacity < 1.0 {
        for pixel in mark.pixels_mut() {
            pixel.0[3] = (f32::from(pixel.0[3]) * plan.opacity).round() as u8;
        }
    }

    let (x, y) = plan.position.origin((cw, ch), (target_w, target_h));
    let mut base = canvas.to_rgba8();
    imageops::overlay(&mut base, &mark, x, y);
    Ok(DynamicImage::ImageRgba8(base))
}
