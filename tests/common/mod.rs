#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use image::{
    DynamicImage, Rgb, RgbImage, Rgba, RgbaImage,
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
};
use media_pipeline::{
    db,
    errors::MediaResult,
    pipeline::PipelineEngine,
    services::{
        blob_store::LocalBlobStore,
        cache::MemoryCache,
        dispatcher::TransformDispatcher,
        media_service::{MediaService, MediaSettings},
        metadata_store::SqliteMetadataStore,
        queue::{MemoryQueue, TransformQueue},
        retry::RetryPolicy,
        watermark::{FetchedImage, WatermarkFetcher},
        worker::{TransformWorker, WorkerSettings},
    },
    state::AppState,
};
use reqwest::Url;
use std::{path::Path, sync::Arc, time::Duration};
use tempfile::TempDir;

/// Serves a fixed PNG with a configurable content type.
pub struct StubFetcher {
    pub content_type: &'static str,
}

#[async_trait]
impl WatermarkFetcher for StubFetcher {
    async fn fetch(&self, _url: &Url) -> MediaResult<FetchedImage> {
        Ok(FetchedImage {
            bytes: png(8, 4),
            content_type: Some(self.content_type.to_string()),
        })
    }
}

pub struct Harness {
    pub media: MediaService,
    pub dispatcher: TransformDispatcher,
    pub worker: TransformWorker,
    pub queue: Arc<MemoryQueue>,
    pub metadata: Arc<SqliteMetadataStore>,
    pub cache: Arc<MemoryCache>,
    pub blob_dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_watermark_type("image/png").await
    }

    pub async fn with_watermark_type(content_type: &'static str) -> Self {
        let blob_dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(SqliteMetadataStore::new(
            db::connect_in_memory().await.unwrap(),
        ));
        let blobs = Arc::new(LocalBlobStore::new(blob_dir.path()));
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(MemoryQueue::new());
        let retry = RetryPolicy::new(2, Duration::from_millis(1));

        let media = MediaService::new(
            metadata.clone(),
            blobs.clone(),
            cache.clone(),
            retry,
            MediaSettings::default(),
        );
        let dispatcher = TransformDispatcher::new(metadata.clone(), queue.clone(), retry);
        let worker = TransformWorker::new(
            metadata.clone(),
            blobs,
            cache.clone(),
            PipelineEngine::new(Arc::new(StubFetcher { content_type }), retry),
            retry,
            WorkerSettings::default(),
        );
        Self {
            media,
            dispatcher,
            worker,
            queue,
            metadata,
            cache,
            blob_dir,
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            media: self.media.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Run every queued message through the worker. Returns how many ran.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        while let Some(delivery) = self.queue.try_receive().await {
            self.worker.handle(&delivery).await;
            self.queue.ack(&delivery).await.unwrap();
            handled += 1;
        }
        handled
    }

    pub fn blob_count(&self) -> usize {
        count_files(self.blob_dir.path())
    }
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            if path.is_dir() { count_files(&path) } else { 1 }
        })
        .sum()
}

pub fn png(width: u32, height: u32) -> Bytes {
    let image = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 5 % 256) as u8, (y * 3 % 256) as u8, 128, 255])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_with_encoder(PngEncoder::new(&mut buf))
        .unwrap();
    Bytes::from(buf)
}

/// High-entropy JPEG; 600x400 lands around half a megabyte.
pub fn noisy_jpeg(width: u32, height: u32) -> Bytes {
    let mut state: u32 = 0x9E37_79B9;
    let image = RgbImage::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let [r, g, b, _] = state.to_le_bytes();
        Rgb([r, g, b])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, 90))
        .unwrap();
    Bytes::from(buf)
}
