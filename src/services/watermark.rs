//! Remote watermark retrieval.

use crate::errors::{MediaError, MediaResult};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Url, header::CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;

/// Raw bytes plus the content type the remote reported.
#[derive(Clone, Debug)]
pub struct FetchedImage {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

impl FetchedImage {
    /// Rejects anything the remote did not label as `image/*`.
    pub fn ensure_image(&self, url: &Url) -> MediaResult<()> {
        match self.content_type.as_deref() {
            Some(ct) if ct.trim().to_ascii_lowercase().starts_with("image/") => Ok(()),
            other => Err(MediaError::InvalidWatermarkSource(format!(
                "{url} returned content type {}",
                other.unwrap_or("<none>")
            ))),
        }
    }
}

#[async_trait]
pub trait WatermarkFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> MediaResult<FetchedImage>;
}

#[derive(Clone)]
pub struct HttpWatermarkFetcher {
    client: reqwest::Client,
}

impl HttpWatermarkFetcher {
    pub fn new(timeout: Duration) -> MediaResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| MediaError::Backend(format!("building http client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WatermarkFetcher for HttpWatermarkFetcher {
    async fn fetch(&self, url: &Url) -> MediaResult<FetchedImage> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(MediaError::TransientIo(format!("{url} answered {status}")));
        }
        if !status.is_success() {
            return Err(MediaError::InvalidWatermarkSource(format!(
                "{url} answered {status}"
            )));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        debug!("fetched watermark {} ({} bytes)", url, bytes.len());
        Ok(FetchedImage {
            bytes,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetched(content_type: Option<&str>) -> FetchedImage {
        FetchedImage {
            bytes: Bytes::new(),
            content_type: content_type.map(str::to_string),
        }
    }

    #[test]
    fn only_image_content_types_pass() {
        let url = Url::parse("https://cdn.example.com/logo").unwrap();
        assert!(fetched(Some("image/png")).ensure_image(&url).is_ok());
        assert!(fetched(Some("Image/WEBP")).ensure_image(&url).is_ok());
        for bad in [Some("text/html"), Some("application/octet-stream"), None] {
            assert!(matches!(
                fetched(bad).ensure_image(&url),
                Err(MediaError::InvalidWatermarkSource(_))
            ));
        }
    }
}
