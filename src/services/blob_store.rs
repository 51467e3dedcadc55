//! src/services/blob_store.rs
//!
//! Blob storage for media payloads. `LocalBlobStore` keeps bytes on local disk
//! sharded beneath `base_path/{shard}/{shard}/{key}`; metadata lives elsewhere.

use crate::errors::{MediaError, MediaResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_BLOB_KEY_LEN: usize = 1024;

/// Result of a successful put.
#[derive(Debug, Clone)]
pub struct PutReceipt {
    pub locator: String,
    pub size_bytes: u64,
    pub etag: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> MediaResult<PutReceipt>;

    async fn get(&self, key: &str) -> MediaResult<Bytes>;

    /// Deleting a missing blob is not an error.
    async fn delete(&self, key: &str) -> MediaResult<()>;
}

/// Key for an uploaded original: `{domain}/{owner}/{timestamp}.{ext}`.
pub fn original_key(domain: &str, owner_id: Uuid, at: DateTime<Utc>, ext: &str) -> String {
    let stamp = at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp_micros());
    format!("{domain}/{owner_id}/{stamp}.{ext}")
}

/// Key for a derived rendition. Deterministic in (source, fingerprint) so a
/// repeated transform overwrites the same blob instead of leaking a new one.
pub fn derived_key(
    domain: &str,
    owner_id: Uuid,
    source_id: Uuid,
    fingerprint: &str,
    ext: &str,
) -> String {
    format!("{domain}/{owner_id}/{source_id}-{fingerprint}-transformed.{ext}")
}

/// Disk-backed blob store.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Rejects empty or oversized keys, absolute paths, `..` segments and
    /// control characters.
    fn ensure_key_safe(key: &str) -> MediaResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_BLOB_KEY_LEN
            || key.starts_with('/')
            || key.split('/').any(|segment| segment == ".." || segment.is_empty())
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(MediaError::invalid_spec(format!("invalid blob key `{key}`")));
        }
        Ok(())
    }

    /// Two-level shard identifiers from MD5(key), as lowercase hex (00-ff).
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Remove empty directories from `start` up to, not including, the base path.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    /// Write to a temp file, fsync, then rename into place.
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> MediaResult<PutReceipt> {
        Self::ensure_key_safe(key)?;
        let path = self.blob_path(key);
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            MediaError::from(io::Error::other("blob path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &path).await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        debug!(
            "stored blob {} ({} bytes, {})",
            key,
            bytes.len(),
            content_type
        );
        Ok(PutReceipt {
            locator: path.display().to_string(),
            size_bytes: bytes.len() as u64,
            etag: format!("{:x}", md5::compute(&bytes)),
        })
    }

    async fn get(&self, key: &str) -> MediaResult<Bytes> {
        Self::ensure_key_safe(key)?;
        match fs::read(self.blob_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(MediaError::not_found(format!("blob `{key}`")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> MediaResult<()> {
        Self::ensure_key_safe(key)?;
        let path = self.blob_path(key);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed blob {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", path.display());
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }
}
