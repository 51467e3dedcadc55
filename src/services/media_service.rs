//! src/services/media_service.rs
//!
//! Read and write path for media objects: uploads, read-through cached
//! lookups, paginated listings keyed by the owner's generation, and deletes.
//!
//! Every mutation of an owner's object set bumps the owner's generation, which
//! orphans all list pages cached under the previous one.

use crate::{
    errors::{MediaError, MediaResult},
    models::{
        media_object::{MediaObject, NewMediaObject, mime_extension},
        transform::OutputFormat,
    },
    services::{
        blob_store::{BlobStore, original_key},
        cache::{Cache, keys},
        metadata_store::MetadataStore,
        retry::RetryPolicy,
        version_ledger::VersionLedger,
    },
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest page size a listing will return.
pub const MAX_PAGE_LIMIT: u32 = 10;

const DEFAULT_FILENAME: &str = "upload";

#[derive(Clone, Debug)]
pub struct MediaSettings {
    pub blob_domain: String,
    pub cache_ttl: Duration,
    pub max_upload_bytes: usize,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            blob_domain: "media-pipeline".into(),
            cache_ttl: Duration::from_secs(300),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Normalized pagination window: `page` starts at 1, `limit` is clamped to
/// `1..=MAX_PAGE_LIMIT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(MAX_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn skip(&self) -> u32 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

#[derive(Clone)]
pub struct MediaService {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<dyn Cache>,
    ledger: VersionLedger,
    retry: RetryPolicy,
    settings: MediaSettings,
}

impl MediaService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        cache: Arc<dyn Cache>,
        retry: RetryPolicy,
        settings: MediaSettings,
    ) -> Self {
        let ledger = VersionLedger::new(cache.clone());
        Self {
            metadata,
            blobs,
            cache,
            ledger,
            retry,
            settings,
        }
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.settings.max_upload_bytes
    }

    /// Store a new original. The blob is written first; if the metadata write
    /// fails the blob is removed again.
    pub async fn upload(
        &self,
        owner_id: Uuid,
        filename: Option<&str>,
        content_type: &str,
        bytes: Bytes,
    ) -> MediaResult<MediaObject> {
        if bytes.is_empty() {
            return Err(MediaError::invalid_spec("upload body is empty"));
        }
        if bytes.len() > self.settings.max_upload_bytes {
            return Err(MediaError::invalid_spec(format!(
                "upload of {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.settings.max_upload_bytes
            )));
        }
        let mime_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        OutputFormat::from_mime(&mime_type)?;

        let key = original_key(
            &self.settings.blob_domain,
            owner_id,
            Utc::now(),
            mime_extension(&mime_type),
        );
        let receipt = self
            .retry
            .run("original put", || {
                self.blobs.put(&key, bytes.clone(), &mime_type)
            })
            .await?;

        let record = NewMediaObject {
            owner_id,
            storage_key: key.clone(),
            mime_type: mime_type.clone(),
            size_bytes: receipt.size_bytes as i64,
            filename: filename
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .unwrap_or(DEFAULT_FILENAME)
                .to_string(),
            parent_id: None,
            fingerprint: None,
        };
        let object = match self
            .retry
            .run("original record", || self.metadata.insert(record.clone()))
            .await
        {
            Ok(object) => object,
            Err(err) => {
                if let Err(cleanup) = self.blobs.delete(&key).await {
                    warn!("failed to remove orphaned blob {}: {}", key, cleanup);
                }
                return Err(err);
            }
        };

        self.ledger.bump(owner_id).await?;
        info!(
            "stored {} ({} bytes) for owner {}",
            object.id, object.size_bytes, owner_id
        );
        Ok(object)
    }

    /// Read-through lookup under `obj:{owner}:{id}`.
    pub async fn get(&self, owner_id: Uuid, id: Uuid) -> MediaResult<MediaObject> {
        let key = keys::object(owner_id, id);
        if let Some(object) = self.cached::<MediaObject>(&key).await? {
            return Ok(object);
        }
        let object = self
            .retry
            .run("object lookup", || self.metadata.find_owned(owner_id, id))
            .await?
            .ok_or_else(|| MediaError::not_found(format!("object {id}")))?;
        self.store(&key, &object).await?;
        Ok(object)
    }

    /// Metadata plus payload.
    pub async fn content(&self, owner_id: Uuid, id: Uuid) -> MediaResult<(MediaObject, Bytes)> {
        let object = self.get(owner_id, id).await?;
        let bytes = self
            .retry
            .run("object fetch", || self.blobs.get(&object.storage_key))
            .await?;
        Ok((object, bytes))
    }

    /// One page of the owner's objects, originals and derived alike.
    pub async fn list(&self, owner_id: Uuid, page: PageRequest) -> MediaResult<Vec<MediaObject>> {
        let generation = self.ledger.current(owner_id).await?;
        let key = keys::list(owner_id, generation, page.page, page.limit);
        if let Some(objects) = self.cached::<Vec<MediaObject>>(&key).await? {
            return Ok(objects);
        }
        let objects = self
            .retry
            .run("object listing", || {
                self.metadata.list_by_owner(owner_id, page.skip(), page.limit)
            })
            .await?;
        self.store(&key, &objects).await?;
        Ok(objects)
    }

    /// One page of renditions derived from `parent_id`. Works after the parent
    /// itself has been deleted.
    pub async fn list_derived(
        &self,
        owner_id: Uuid,
        parent_id: Uuid,
        page: PageRequest,
    ) -> MediaResult<Vec<MediaObject>> {
        let generation = self.ledger.current(owner_id).await?;
        let key = keys::children(owner_id, generation, parent_id, page.page, page.limit);
        if let Some(objects) = self.cached::<Vec<MediaObject>>(&key).await? {
            return Ok(objects);
        }
        let objects = self
            .retry
            .run("derived listing", || {
                self.metadata
                    .list_children(owner_id, parent_id, page.skip(), page.limit)
            })
            .await?;
        self.store(&key, &objects).await?;
        Ok(objects)
    }

    /// Remove the record, its payload and its cached read; bump the owner's
    /// generation. Deleting a rendition also forgets the transform result, so
    /// the same request rebuilds it.
    pub async fn delete(&self, owner_id: Uuid, id: Uuid) -> MediaResult<MediaObject> {
        let object = self
            .retry
            .run("object delete", || self.metadata.delete_owned(owner_id, id))
            .await?
            .ok_or_else(|| MediaError::not_found(format!("object {id}")))?;

        if let Err(err) = self
            .retry
            .run("blob delete", || self.blobs.delete(&object.storage_key))
            .await
        {
            warn!("blob {} left behind: {}", object.storage_key, err);
        }
        self.cache.delete(&keys::object(owner_id, id)).await?;
        if let (Some(parent_id), Some(fingerprint)) = (object.parent_id, &object.fingerprint) {
            self.cache
                .delete(&keys::transform(parent_id, fingerprint))
                .await?;
        }
        self.ledger.bump(owner_id).await?;
        info!("deleted {} for owner {}", id, owner_id);
        Ok(object)
    }

    /// Readiness: the metadata store answers and the blob store accepts a
    /// write.
    pub async fn check_metadata(&self) -> MediaResult<()> {
        self.metadata.ping().await
    }

    pub async fn check_blobs(&self) -> MediaResult<()> {
        let key = format!("{}/.readyz-{}", self.settings.blob_domain, Uuid::new_v4());
        self.blobs
            .put(&key, Bytes::from_static(b"readyz"), "text/plain")
            .await?;
        let read = self.blobs.get(&key).await;
        self.blobs.delete(&key).await?;
        if read? != Bytes::from_static(b"readyz") {
            return Err(MediaError::Backend("blob probe content mismatch".into()));
        }
        Ok(())
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> MediaResult<Option<T>> {
        let Some(raw) = self.cache.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!("cache hit on {}", key);
                Ok(Some(value))
            }
            Err(err) => {
                warn!("discarding unreadable cache entry {}: {}", key, err);
                self.cache.delete(key).await?;
                Ok(None)
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T) -> MediaResult<()> {
        let raw = serde_json::to_string(value)?;
        self.cache
            .set(key, raw, Some(self.settings.cache_ttl))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        services::{blob_store::LocalBlobStore, cache::MemoryCache, metadata_store::SqliteMetadataStore},
    };
    use tempfile::TempDir;

    struct Fixture {
        service: MediaService,
        cache: Arc<MemoryCache>,
        _dir: TempDir,
    }

    async fn fixture(max_upload_bytes: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MemoryCache::new());
        let service = MediaService::new(
            Arc::new(SqliteMetadataStore::new(db::connect_in_memory().await.unwrap())),
            Arc::new(LocalBlobStore::new(dir.path())),
            cache.clone(),
            RetryPolicy::default(),
            MediaSettings {
                max_upload_bytes,
                ..Default::default()
            },
        );
        Fixture {
            service,
            cache,
            _dir: dir,
        }
    }

    fn payload() -> Bytes {
        Bytes::from_static(b"\x89PNG not really")
    }

    #[test]
    fn page_request_clamps() {
        assert_eq!(PageRequest::new(None, None), PageRequest { page: 1, limit: 10 });
        assert_eq!(PageRequest::new(Some(0), Some(0)), PageRequest { page: 1, limit: 1 });
        assert_eq!(PageRequest::new(Some(3), Some(50)).limit, 10);
        assert_eq!(PageRequest::new(Some(3), Some(4)).skip(), 8);
    }

    #[tokio::test]
    async fn upload_validates_body_and_type() {
        let f = fixture(8).await;
        let owner = Uuid::new_v4();
        let cases = [
            (Bytes::new(), "image/png"),
            (Bytes::from_static(b"123456789"), "image/png"),
        ];
        for (body, mime) in cases {
            let err = f.service.upload(owner, None, mime, body).await.unwrap_err();
            assert!(matches!(err, MediaError::InvalidSpec(_)));
        }
        let err = f
            .service
            .upload(owner, None, "application/pdf", Bytes::from_static(b"1"))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn upload_then_read_back() {
        let f = fixture(1024).await;
        let owner = Uuid::new_v4();
        let object = f
            .service
            .upload(owner, Some("cat.png"), "image/PNG; q=1", payload())
            .await
            .unwrap();
        assert_eq!(object.mime_type, "image/png");
        assert_eq!(object.filename, "cat.png");
        assert!(object.storage_key.ends_with(".png"));

        let (meta, bytes) = f.service.content(owner, object.id).await.unwrap();
        assert_eq!(meta.id, object.id);
        assert_eq!(bytes, payload());
        assert!(
            f.cache
                .get(&keys::object(owner, object.id))
                .await
                .unwrap()
                .is_some()
        );

        let err = f.service.get(Uuid::new_v4(), object.id).await.unwrap_err();
        assert!(matches!(err, MediaError::NotFound(_)));
    }

    #[tokio::test]
    async fn mutations_orphan_cached_list_pages() {
        let f = fixture(1024).await;
        let owner = Uuid::new_v4();
        let page = PageRequest::new(None, None);

        let first = f.service.upload(owner, None, "image/png", payload()).await.unwrap();
        let generation = f.service.ledger().current(owner).await.unwrap();
        assert_eq!(f.service.list(owner, page).await.unwrap().len(), 1);
        let old_key = keys::list(owner, generation, 1, 10);
        assert!(f.cache.get(&old_key).await.unwrap().is_some());

        f.service.upload(owner, None, "image/png", payload()).await.unwrap();
        assert!(f.service.ledger().current(owner).await.unwrap() > generation);
        assert_eq!(f.service.list(owner, page).await.unwrap().len(), 2);

        f.service.delete(owner, first.id).await.unwrap();
        assert_eq!(f.service.list(owner, page).await.unwrap().len(), 1);
        // the stale page is still there, just never read again
        assert!(f.cache.get(&old_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_clears_object_cache_and_payload() {
        let f = fixture(1024).await;
        let owner = Uuid::new_v4();
        let object = f.service.upload(owner, None, "image/png", payload()).await.unwrap();
        f.service.get(owner, object.id).await.unwrap();

        let deleted = f.service.delete(owner, object.id).await.unwrap();
        assert_eq!(deleted.id, object.id);
        assert!(
            f.cache
                .get(&keys::object(owner, object.id))
                .await
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            f.service.get(owner, object.id).await,
            Err(MediaError::NotFound(_))
        ));
        assert!(matches!(
            f.service.delete(owner, object.id).await,
            Err(MediaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn readiness_probes_pass() {
        let f = fixture(1024).await;
        f.service.check_metadata().await.unwrap();
        f.service.check_blobs().await.unwrap();
    }
}
