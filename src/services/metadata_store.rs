//! src/services/metadata_store.rs
//!
//! Durable media metadata. `SqliteMetadataStore` keeps one row per
//! `MediaObject`; derived renditions are unique per (parent, fingerprint).

use crate::{
    errors::{MediaError, MediaResult},
    models::media_object::{MediaObject, NewMediaObject},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

const SELECT_COLUMNS: &str = "SELECT id, owner_id, storage_key, mime_type, size_bytes, \
     filename, parent_id, fingerprint, created_at FROM media_objects";

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert(&self, new: NewMediaObject) -> MediaResult<MediaObject>;

    /// The object if it exists and belongs to `owner_id`.
    async fn find_owned(&self, owner_id: Uuid, id: Uuid) -> MediaResult<Option<MediaObject>>;

    async fn list_by_owner(
        &self,
        owner_id: Uuid,
        skip: u32,
        limit: u32,
    ) -> MediaResult<Vec<MediaObject>>;

    async fn list_children(
        &self,
        owner_id: Uuid,
        parent_id: Uuid,
        skip: u32,
        limit: u32,
    ) -> MediaResult<Vec<MediaObject>>;

    /// Insert a derived object, or refresh the existing row for the same
    /// (parent, fingerprint). Returns the canonical row.
    async fn upsert_derived(&self, new: NewMediaObject) -> MediaResult<MediaObject>;

    async fn delete_owned(&self, owner_id: Uuid, id: Uuid) -> MediaResult<Option<MediaObject>>;

    async fn ping(&self) -> MediaResult<()>;
}

#[derive(Clone)]
pub struct SqliteMetadataStore {
    db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert(&self, new: NewMediaObject) -> MediaResult<MediaObject> {
        let object = new.into_object(Uuid::new_v4(), Utc::now());
        sqlx::query(
            "INSERT INTO media_objects (
                id, owner_id, storage_key, mime_type, size_bytes,
                filename, parent_id, fingerprint, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(object.id)
        .bind(object.owner_id)
        .bind(&object.storage_key)
        .bind(&object.mime_type)
        .bind(object.size_bytes)
        .bind(&object.filename)
        .bind(object.parent_id)
        .bind(&object.fingerprint)
        .bind(object.created_at)
        .execute(&*self.db)
        .await?;
        Ok(object)
    }

    async fn find_owned(&self, owner_id: Uuid, id: Uuid) -> MediaResult<Option<MediaObject>> {
        let row = sqlx::query_as::<_, MediaObject>(&format!(
            "{SELECT_COLUMNS} WHERE id = ? AND owner_id = ?"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    async fn list_by_owner(
        &self,
        owner_id: Uuid,
        skip: u32,
        limit: u32,
    ) -> MediaResult<Vec<MediaObject>> {
        let rows = sqlx::query_as::<_, MediaObject>(&format!(
            "{SELECT_COLUMNS} WHERE owner_id = ? ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?"
        ))
        .bind(owner_id)
        .bind(i64::from(limit))
        .bind(i64::from(skip))
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn list_children(
        &self,
        owner_id: Uuid,
        parent_id: Uuid,
        skip: u32,
        limit: u32,
    ) -> MediaResult<Vec<MediaObject>> {
        let rows = sqlx::query_as::<_, MediaObject>(&format!(
            "{SELECT_COLUMNS} WHERE owner_id = ? AND parent_id = ? \
             ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?"
        ))
        .bind(owner_id)
        .bind(parent_id)
        .bind(i64::from(limit))
        .bind(i64::from(skip))
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn upsert_derived(&self, new: NewMediaObject) -> MediaResult<MediaObject> {
        if new.parent_id.is_none() || new.fingerprint.is_none() {
            return Err(MediaError::Backend(
                "derived objects need a parent and a fingerprint".into(),
            ));
        }
        let candidate = new.into_object(Uuid::new_v4(), Utc::now());
        let row = sqlx::query_as::<_, MediaObject>(
            r#"
            INSERT INTO media_objects (
                id, owner_id, storage_key, mime_type, size_bytes,
                filename, parent_id, fingerprint, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(parent_id, fingerprint) DO UPDATE SET
                storage_key = excluded.storage_key,
                mime_type = excluded.mime_type,
                size_bytes = excluded.size_bytes,
                filename = excluded.filename
            RETURNING id, owner_id, storage_key, mime_type, size_bytes,
                      filename, parent_id, fingerprint, created_at
            "#,
        )
        .bind(candidate.id)
        .bind(candidate.owner_id)
        .bind(&candidate.storage_key)
        .bind(&candidate.mime_type)
        .bind(candidate.size_bytes)
        .bind(&candidate.filename)
        .bind(candidate.parent_id)
        .bind(&candidate.fingerprint)
        .bind(candidate.created_at)
        .fetch_one(&*self.db)
        .await?;
        Ok(row)
    }

    async fn delete_owned(&self, owner_id: Uuid, id: Uuid) -> MediaResult<Option<MediaObject>> {
        let row = sqlx::query_as::<_, MediaObject>(
            "DELETE FROM media_objects WHERE id = ? AND owner_id = ?
             RETURNING id, owner_id, storage_key, mime_type, size_bytes,
                       filename, parent_id, fingerprint, created_at",
        )
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    async fn ping(&self) -> MediaResult<()> {
        let value = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if value != 1 {
            return Err(MediaError::Backend(format!("unexpected ping result {value}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(db::connect_in_memory().await.unwrap())
    }

    fn original(owner: Uuid, name: &str) -> NewMediaObject {
        NewMediaObject {
            owner_id: owner,
            storage_key: format!("media/{owner}/{name}"),
            mime_type: "image/png".into(),
            size_bytes: 42,
            filename: name.into(),
            parent_id: None,
            fingerprint: None,
        }
    }

    #[tokio::test]
    async fn find_is_scoped_to_owner() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let object = store.insert(original(owner, "a.png")).await.unwrap();

        let found = store.find_owned(owner, object.id).await.unwrap().unwrap();
        assert_eq!(found.id, object.id);
        assert_eq!(found.storage_key, object.storage_key);
        assert_eq!(store.find_owned(Uuid::new_v4(), object.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_paginates_in_creation_order() {
        let store = store().await;
        let owner = Uuid::new_v4();
        for i in 0..5 {
            store
                .insert(original(owner, &format!("{i}.png")))
                .await
                .unwrap();
        }
        store.insert(original(Uuid::new_v4(), "other.png")).await.unwrap();

        let first = store.list_by_owner(owner, 0, 2).await.unwrap();
        let rest = store.list_by_owner(owner, 2, 10).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 3);
        assert!(first.iter().chain(&rest).all(|o| o.owner_id == owner));
    }

    #[tokio::test]
    async fn upsert_derived_keeps_one_row_per_fingerprint() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let parent = store.insert(original(owner, "p.png")).await.unwrap();
        let derived = |size| NewMediaObject {
            size_bytes: size,
            parent_id: Some(parent.id),
            fingerprint: Some("abc".into()),
            ..original(owner, "p.png-transformed")
        };

        let first = store.upsert_derived(derived(10)).await.unwrap();
        let second = store.upsert_derived(derived(11)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.size_bytes, 11);

        let children = store.list_children(owner, parent.id, 0, 10).await.unwrap();
        assert_eq!(children.len(), 1);
    }

    #[tokio::test]
    async fn delete_returns_removed_row_once() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let object = store.insert(original(owner, "d.png")).await.unwrap();

        assert_eq!(store.delete_owned(Uuid::new_v4(), object.id).await.unwrap(), None);
        assert_eq!(
            store.delete_owned(owner, object.id).await.unwrap().map(|o| o.id),
            Some(object.id)
        );
        assert_eq!(store.delete_owned(owner, object.id).await.unwrap(), None);
        store.ping().await.unwrap();
    }
}
