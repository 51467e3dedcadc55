//! Represents a stored media object, either an upload or a derived rendition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata for a single media object.
///
/// The payload itself lives in the blob store under `storage_key`; this record
/// is immutable once written except for deletion.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct MediaObject {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Owning user.
    pub owner_id: Uuid,

    /// Blob store key of the payload.
    pub storage_key: String,

    /// Content type (MIME type), e.g. `image/jpeg`.
    pub mime_type: String,

    /// Payload size in bytes.
    pub size_bytes: i64,

    /// Original or synthesized filename.
    pub filename: String,

    /// Source object for derived renditions; absent for uploads.
    pub parent_id: Option<Uuid>,

    /// Transform fingerprint for derived renditions; absent for uploads.
    pub fingerprint: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Fields the caller supplies when creating a record.
#[derive(Clone, Debug)]
pub struct NewMediaObject {
    pub owner_id: Uuid,
    pub storage_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub filename: String,
    pub parent_id: Option<Uuid>,
    pub fingerprint: Option<String>,
}

impl NewMediaObject {
    pub fn into_object(self, id: Uuid, created_at: DateTime<Utc>) -> MediaObject {
        MediaObject {
            id,
            owner_id: self.owner_id,
            storage_key: self.storage_key,
            mime_type: self.mime_type,
            size_bytes: self.size_bytes,
            filename: self.filename,
            parent_id: self.parent_id,
            fingerprint: self.fingerprint,
            created_at,
        }
    }
}

impl MediaObject {
    pub fn is_derived(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Subtype of the MIME type, used as file extension (`image/png` -> `png`).
    pub fn extension(&self) -> &str {
        mime_extension(&self.mime_type)
    }
}

pub fn mime_extension(mime: &str) -> &str {
    mime.split_once('/').map(|(_, sub)| sub).unwrap_or(mime)
}
