//! Request-path entry point for transforms: validate, check the source, enqueue.

use crate::{
    errors::{MediaError, MediaResult},
    models::{
        message::{TransformAck, TransformMessage},
        transform::TransformSpec,
    },
    services::{metadata_store::MetadataStore, queue::TransformQueue, retry::RetryPolicy},
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct TransformDispatcher {
    metadata: Arc<dyn MetadataStore>,
    queue: Arc<dyn TransformQueue>,
    retry: RetryPolicy,
}

impl TransformDispatcher {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        queue: Arc<dyn TransformQueue>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            metadata,
            queue,
            retry,
        }
    }

    /// Publishes exactly one message and returns without waiting for the
    /// worker. Duplicate requests are not collapsed here.
    pub async fn request_transform(
        &self,
        owner_id: Uuid,
        source_id: Uuid,
        spec: TransformSpec,
    ) -> MediaResult<TransformAck> {
        spec.validate()?;
        if spec.is_empty() {
            return Err(MediaError::invalid_spec("no transformations requested"));
        }

        self.retry
            .run("source lookup", || self.metadata.find_owned(owner_id, source_id))
            .await?
            .ok_or_else(|| MediaError::not_found(format!("object {source_id}")))?;

        let message = TransformMessage {
            owner_id,
            source_object_id: source_id,
            transform_spec: spec,
        };
        self.retry
            .run("enqueue transform", || self.queue.publish(&message))
            .await?;
        info!("queued transform of {} for owner {}", source_id, owner_id);
        Ok(TransformAck::queued())
    }
}
