//! Pipeline Engine: a fixed, ordered list of stages over an in-memory canvas.
//!
//! The caller's field order never matters; [`STAGES`] decides. Each stage
//! takes the canvas by value and hands back a replacement, and the first error
//! aborts the run. The source bytes are never touched, so a failed run leaves
//! nothing behind.

pub mod encode;
pub mod stages;

use crate::{
    errors::{MediaError, MediaResult},
    models::transform::{OutputFormat, TransformPlan},
    services::{
        retry::RetryPolicy,
        watermark::{FetchedImage, WatermarkFetcher},
    },
};
use bytes::Bytes;
use image::DynamicImage;
use std::{fmt, sync::Arc};
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Resize,
    Rotate,
    Crop,
    Format,
    Filters,
    Orientation,
    Compress,
    Watermark,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Resize => "resize",
            Stage::Rotate => "rotate",
            Stage::Crop => "crop",
            Stage::Format => "format",
            Stage::Filters => "filters",
            Stage::Orientation => "orientation",
            Stage::Compress => "compress",
            Stage::Watermark => "watermark",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Working state threaded through the stages.
pub struct Canvas {
    pub image: DynamicImage,
    pub format: OutputFormat,
    /// Set by the compress stage for codecs that honour it.
    pub quality: Option<u8>,
}

/// Read-only inputs every stage may consult.
pub struct StageInput<'a> {
    pub plan: &'a TransformPlan,
    pub watermark: Option<&'a FetchedImage>,
}

type StageFn = fn(Canvas, &StageInput<'_>) -> MediaResult<Canvas>;

/// Application order.
pub const STAGES: [(Stage, StageFn); 8] = [
    (Stage::Resize, resize_stage),
    (Stage::Rotate, rotate_stage),
    (Stage::Crop, crop_stage),
    (Stage::Format, format_stage),
    (Stage::Filters, filters_stage),
    (Stage::Orientation, orientation_stage),
    (Stage::Compress, compress_stage),
    (Stage::Watermark, watermark_stage),
];

fn resize_stage(mut canvas: Canvas, input: &StageInput<'_>) -> MediaResult<Canvas> {
    if let Some((width, height)) = input.plan.resize {
        canvas.image = stages::resize(&canvas.image, width, height);
    }
    Ok(canvas)
}

fn rotate_stage(mut canvas: Canvas, input: &StageInput<'_>) -> MediaResult<Canvas> {
    if let Some(degrees) = input.plan.rotate {
        canvas.image = stages::rotate(canvas.image, degrees);
    }
    Ok(canvas)
}

fn crop_stage(mut canvas: Canvas, input: &StageInput<'_>) -> MediaResult<Canvas> {
    if let Some(rect) = input.plan.crop {
        canvas.image = stages::crop(&canvas.image, rect)?;
    }
    Ok(canvas)
}

fn format_stage(mut canvas: Canvas, input: &StageInput<'_>) -> MediaResult<Canvas> {
    if let Some(format) = input.plan.format {
        canvas.format = format;
    }
    Ok(canvas)
}

fn filters_stage(mut canvas: Canvas, input: &StageInput<'_>) -> MediaResult<Canvas> {
    if input.plan.grayscale {
        canvas.image = canvas.image.grayscale();
    }
    if input.plan.sepia {
        canvas.image = stages::sepia(&canvas.image);
    }
    Ok(canvas)
}

fn orientation_stage(mut canvas: Canvas, input: &StageInput<'_>) -> MediaResult<Canvas> {
    if input.plan.flip {
        canvas.image = canvas.image.flipv();
    }
    if input.plan.mirror {
        canvas.image = canvas.image.fliph();
    }
    Ok(canvas)
}

fn compress_stage(mut canvas: Canvas, input: &StageInput<'_>) -> MediaResult<Canvas> {
    if let Some(quality) = input.plan.quality {
        if encode::supports_quality(canvas.format) {
            canvas.quality = Some(quality);
        } else {
            debug!("compress ignored for {}", canvas.format);
        }
    }
    Ok(canvas)
}

fn watermark_stage(mut canvas: Canvas, input: &StageInput<'_>) -> MediaResult<Canvas> {
    let Some(plan) = &input.plan.watermark else {
        return Ok(canvas);
    };
    let fetched = input.watermark.ok_or_else(|| {
        MediaError::PipelineFailure(format!("watermark {} was not fetched", plan.url))
    })?;
    canvas.image = stages::watermark(&canvas.image, fetched, plan)?;
    Ok(canvas)
}

/// Bytes and MIME type of a finished rendition.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub bytes: Bytes,
    pub mime_type: String,
    pub format: OutputFormat,
}

/// Synchronous core: decode, run every stage in order, encode.
pub fn run(
    source: &[u8],
    source_mime: &str,
    plan: &TransformPlan,
    watermark: Option<&FetchedImage>,
) -> MediaResult<PipelineOutput> {
    let source_format = OutputFormat::from_mime(source_mime);
    let image = match &source_format {
        Ok(format) => image::load_from_memory_with_format(source, format.image_format())?,
        Err(_) => image::load_from_memory(source)?,
    };
    let initial_format = match (source_format, plan.format) {
        (Ok(format), _) => format,
        (Err(_), Some(target)) => target,
        (Err(err), None) => return Err(err),
    };

    let input = StageInput { plan, watermark };
    let mut canvas = Canvas {
        image,
        format: initial_format,
        quality: None,
    };
    for (stage, apply) in STAGES {
        canvas = apply(canvas, &input).inspect_err(|err| {
            debug!("stage {} failed: {}", stage, err);
        })?;
        trace!(
            "stage {} done ({}x{})",
            stage,
            canvas.image.width(),
            canvas.image.height()
        );
    }

    let bytes = encode::encode(&canvas.image, canvas.format, canvas.quality)?;
    // an untouched format keeps the MIME type the source was stored with
    let mime_type = match plan.format {
        Some(target) => target.mime_type(),
        None => source_mime.to_string(),
    };
    Ok(PipelineOutput {
        bytes: Bytes::from(bytes),
        mime_type,
        format: canvas.format,
    })
}

/// Async front for the worker. Network I/O for the watermark happens before
/// any pixel work; decoding and encoding run on the blocking pool.
#[derive(Clone)]
pub struct PipelineEngine {
    fetcher: Arc<dyn WatermarkFetcher>,
    retry: RetryPolicy,
}

impl PipelineEngine {
    pub fn new(fetcher: Arc<dyn WatermarkFetcher>, retry: RetryPolicy) -> Self {
        Self { fetcher, retry }
    }

    pub async fn apply(
        &self,
        source: Bytes,
        source_mime: &str,
        plan: &TransformPlan,
    ) -> MediaResult<PipelineOutput> {
        let watermark = match &plan.watermark {
            Some(mark) => {
                let fetched = self
                    .retry
                    .run("watermark fetch", || self.fetcher.fetch(&mark.url))
                    .await?;
                fetched.ensure_image(&mark.url)?;
                Some(fetched)
            }
            None => None,
        };

        let plan = plan.clone();
        let source_mime = source_mime.to_string();
        tokio::task::spawn_blocking(move || run(&source, &source_mime, &plan, watermark.as_ref()))
            .await
            .map_err(|err| MediaError::PipelineFailure(format!("pipeline task: {err}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::transform::{TransformSpec, WatermarkPosition, WatermarkPlan};
    use async_trait::async_trait;
    use image::{ImageFormat, Rgba, RgbaImage, codecs::png::PngEncoder};
    use parking_lot::Mutex;
    use reqwest::Url;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 7 % 256) as u8, (y * 11 % 256) as u8, 90, 255])
        }));
        let mut buf = Vec::new();
        image.write_with_encoder(PngEncoder::new(&mut buf)).unwrap();
        buf
    }

    fn plan(json: &str) -> TransformPlan {
        serde_json::from_str::<TransformSpec>(json)
            .unwrap()
            .validate()
            .unwrap()
    }

    fn decode(output: &PipelineOutput) -> DynamicImage {
        image::load_from_memory(&output.bytes).unwrap()
    }

    #[test]
    fn stage_order_is_fixed() {
        let order: Vec<_> = STAGES.iter().map(|(stage, _)| stage.name()).collect();
        assert_eq!(
            order,
            [
                "resize",
                "rotate",
                "crop",
                "format",
                "filters",
                "orientation",
                "compress",
                "watermark"
            ]
        );
    }

    #[test]
    fn field_order_does_not_change_output() {
        let source = png(40, 20);
        let a = run(
            &source,
            "image/png",
            &plan(r#"{"rotate": 90, "resize": {"width": 10, "height": 30}}"#),
            None,
        )
        .unwrap();
        let b = run(
            &source,
            "image/png",
            &plan(r#"{"resize": {"width": 10, "height": 30}, "rotate": 90}"#),
            None,
        )
        .unwrap();
        assert_eq!(a.bytes, b.bytes);
        // resize happened first: 10x30 rotated is 30x10
        let out = decode(&a);
        assert_eq!((out.width(), out.height()), (30, 10));
    }

    #[test]
    fn crop_runs_after_rotation() {
        let source = png(40, 20);
        // only valid on the rotated 20x40 canvas
        let out = run(
            &source,
            "image/png",
            &plan(r#"{"rotate": 90, "crop": {"x": 0, "y": 25, "width": 20, "height": 15}}"#),
            None,
        )
        .unwrap();
        let image = decode(&out);
        assert_eq!((image.width(), image.height()), (20, 15));
    }

    #[test]
    fn crop_outside_canvas_aborts() {
        let err = run(
            &png(10, 10),
            "image/png",
            &plan(r#"{"crop": {"x": 5, "y": 5, "width": 6, "height": 1}}"#),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, MediaError::InvalidSpec(_)));
    }

    #[test]
    fn format_conversion_sets_mime() {
        let out = run(&png(8, 8), "image/png", &plan(r#"{"format": "jpeg"}"#), None).unwrap();
        assert_eq!(out.mime_type, "image/jpeg");
        assert_eq!(out.format, OutputFormat::Jpeg);
        assert_eq!(image::guess_format(&out.bytes).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn untouched_format_keeps_source_mime() {
        let out = run(&png(8, 8), "image/png", &plan(r#"{"flip": true}"#), None).unwrap();
        assert_eq!(out.mime_type, "image/png");
    }

    #[test]
    fn compress_is_a_no_op_for_webp() {
        let source = png(16, 16);
        let plain = run(&source, "image/png", &plan(r#"{"format": "webp"}"#), None).unwrap();
        let compressed = run(
            &source,
            "image/png",
            &plan(r#"{"format": "webp", "compress": 10}"#),
            None,
        )
        .unwrap();
        assert_eq!(plain.bytes, compressed.bytes);
    }

    #[test]
    fn undecodable_source_is_a_pipeline_failure() {
        let err = run(b"not an image", "image/png", &plan(r#"{"flip": true}"#), None).unwrap_err();
        assert!(matches!(err, MediaError::PipelineFailure(_)));
    }

    #[test]
    fn flip_then_mirror() {
        let mut image = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255]));
        image.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_with_encoder(PngEncoder::new(&mut buf))
            .unwrap();
        let out = run(&buf, "image/png", &plan(r#"{"flip": true, "mirror": true}"#), None).unwrap();
        let rgba = decode(&out).to_rgba8();
        assert_eq!(rgba.get_pixel(1, 1).0, [255, 0, 0, 255]);
    }

    struct StubFetcher {
        content_type: &'static str,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl WatermarkFetcher for StubFetcher {
        async fn fetch(&self, _url: &Url) -> MediaResult<FetchedImage> {
            *self.calls.lock() += 1;
            Ok(FetchedImage {
                bytes: Bytes::from(png(4, 2)),
                content_type: Some(self.content_type.to_string()),
            })
        }
    }

    fn watermark_plan() -> TransformPlan {
        TransformPlan {
            watermark: Some(WatermarkPlan {
                url: Url::parse("https://cdn.example.com/mark.png").unwrap(),
                position: WatermarkPosition::Center,
                opacity: 0.8,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn engine_fetches_and_composites_watermark() {
        let fetcher = Arc::new(StubFetcher {
            content_type: "image/png",
            calls: Mutex::new(0),
        });
        let engine = PipelineEngine::new(fetcher.clone(), RetryPolicy::default());
        let out = engine
            .apply(Bytes::from(png(50, 50)), "image/png", &watermark_plan())
            .await
            .unwrap();
        assert_eq!(*fetcher.calls.lock(), 1);
        assert_eq!(out.mime_type, "image/png");
    }

    #[tokio::test]
    async fn non_image_watermark_is_rejected_before_pixel_work() {
        let fetcher = Arc::new(StubFetcher {
            content_type: "text/html",
            calls: Mutex::new(0),
        });
        let engine = PipelineEngine::new(fetcher, RetryPolicy::default());
        let err = engine
            .apply(Bytes::from_static(b"garbage"), "image/png", &watermark_plan())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidWatermarkSource(_)));
    }

    #[test]
    fn missing_watermark_payload_is_reported() {
        let err = run(&png(10, 10), "image/png", &watermark_plan(), None).unwrap_err();
        assert!(matches!(err, MediaError::PipelineFailure(_)));
    }
}
