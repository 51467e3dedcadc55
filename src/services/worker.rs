//! Transform Worker: consumes queued requests and produces derived objects.
//!
//! Per message the worker walks a fixed sequence of steps (see [`WorkerStep`]).
//! A cache hit on the fingerprint ends the run early. Nothing reaches the
//! metadata store until the pipeline has produced the full output buffer.
//! Failures are logged and the message is dropped; the worker never answers
//! a caller.

use crate::{
    errors::MediaError,
    models::{
        media_object::{MediaObject, NewMediaObject, mime_extension},
        message::TransformMessage,
        transform::TransformPlan,
    },
    pipeline::PipelineEngine,
    services::{
        blob_store::{BlobStore, derived_key},
        cache::{Cache, keys},
        fingerprint::fingerprint,
        metadata_store::MetadataStore,
        queue::{Delivery, TransformQueue},
        retry::RetryPolicy,
        version_ledger::VersionLedger,
    },
};
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};

const RECEIVE_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStep {
    Decode,
    Fingerprint,
    CacheCheck,
    Validate,
    Lease,
    LoadSource,
    Pipeline,
    Persist,
    VersionBump,
    CacheWrite,
}

impl fmt::Display for WorkerStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerStep::Decode => "decode",
            WorkerStep::Fingerprint => "fingerprint",
            WorkerStep::CacheCheck => "cache_check",
            WorkerStep::Validate => "validate",
            WorkerStep::Lease => "lease",
            WorkerStep::LoadSource => "load_source",
            WorkerStep::Pipeline => "pipeline",
            WorkerStep::Persist => "persist",
            WorkerStep::VersionBump => "version_bump",
            WorkerStep::CacheWrite => "cache_write",
        };
        f.write_str(name)
    }
}

/// A failed run and the step it failed in.
#[derive(Debug, Error)]
#[error("{step}: {error}")]
pub struct StepFailure {
    pub step: WorkerStep,
    #[source]
    pub error: MediaError,
}

trait AtStep<T> {
    fn at(self, step: WorkerStep) -> Result<T, StepFailure>;
}

impl<T, E: Into<MediaError>> AtStep<T> for Result<T, E> {
    fn at(self, step: WorkerStep) -> Result<T, StepFailure> {
        self.map_err(|err| StepFailure {
            step,
            error: err.into(),
        })
    }
}

/// How a message that did not fail was resolved.
#[derive(Debug)]
pub enum Processed {
    Created(MediaObject),
    /// The fingerprint was already cached.
    CacheHit,
    /// Another consumer holds the lease for this fingerprint.
    InFlight,
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub blob_domain: String,
    pub cache_ttl: Duration,
    pub dedupe_in_flight: bool,
    pub lease_ttl: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            blob_domain: "media-pipeline".into(),
            cache_ttl: Duration::from_secs(300),
            dedupe_in_flight: true,
            lease_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct TransformWorker {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<dyn Cache>,
    ledger: VersionLedger,
    engine: PipelineEngine,
    retry: RetryPolicy,
    settings: WorkerSettings,
}

impl TransformWorker {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        cache: Arc<dyn Cache>,
        engine: PipelineEngine,
        retry: RetryPolicy,
        settings: WorkerSettings,
    ) -> Self {
        let ledger = VersionLedger::new(cache.clone());
        Self {
            metadata,
            blobs,
            cache,
            ledger,
            engine,
            retry,
            settings,
        }
    }

    /// Handle one delivery. Outcomes are only logged.
    pub async fn handle(&self, delivery: &Delivery) {
        let message = match TransformMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    delivery = delivery.id,
                    step = %WorkerStep::Decode,
                    "dropping undecodable message: {}",
                    err
                );
                return;
            }
        };

        let span = info_span!(
            "transform",
            owner_id = %message.owner_id,
            source_id = %message.source_object_id,
            attempt = delivery.attempt,
            fingerprint = field::Empty,
        );
        let outcome = self.process(&message).instrument(span.clone()).await;
        span.in_scope(|| match outcome {
            Ok(Processed::Created(object)) => {
                info!("stored derived object {} at {}", object.id, object.storage_key)
            }
            Ok(Processed::CacheHit) => debug!("already transformed"),
            Ok(Processed::InFlight) => debug!("identical transform in progress elsewhere"),
            Err(failure) => log_failure(&failure),
        });
    }

    /// The full state machine for one message.
    pub async fn process(&self, message: &TransformMessage) -> Result<Processed, StepFailure> {
        let source_id = message.source_object_id;
        let fingerprint =
            fingerprint(source_id, &message.transform_spec).at(WorkerStep::Fingerprint)?;
        Span::current().record("fingerprint", fingerprint.as_str());

        let result_key = keys::transform(source_id, &fingerprint);
        if self
            .cache
            .get(&result_key)
            .await
            .at(WorkerStep::CacheCheck)?
            .is_some()
        {
            debug!("cache hit on {}", result_key);
            return Ok(Processed::CacheHit);
        }

        let plan = message.transform_spec.validate().at(WorkerStep::Validate)?;

        let lease = if self.settings.dedupe_in_flight {
            let key = keys::lease(source_id, &fingerprint);
            let acquired = self
                .cache
                .set_if_absent(&key, "1".into(), Some(self.settings.lease_ttl))
                .await
                .at(WorkerStep::Lease)?;
            if !acquired {
                return Ok(Processed::InFlight);
            }
            Some(key)
        } else {
            None
        };

        let outcome = self
            .execute(message, &fingerprint, &result_key, &plan)
            .await;

        if let Some(key) = lease {
            if let Err(err) = self.cache.delete(&key).await {
                warn!("failed to release lease {}: {}", key, err);
            }
        }
        outcome.map(Processed::Created)
    }

    async fn execute(
        &self,
        message: &TransformMessage,
        fingerprint: &str,
        result_key: &str,
        plan: &TransformPlan,
    ) -> Result<MediaObject, StepFailure> {
        let owner_id = message.owner_id;
        let source_id = message.source_object_id;

        let source = self
            .retry
            .run("source lookup", || self.metadata.find_owned(owner_id, source_id))
            .await
            .and_then(|found| {
                found.ok_or_else(|| MediaError::not_found(format!("object {source_id}")))
            })
            .at(WorkerStep::LoadSource)?;
        let bytes = self
            .retry
            .run("source fetch", || self.blobs.get(&source.storage_key))
            .await
            .at(WorkerStep::LoadSource)?;

        let output = self
            .engine
            .apply(bytes, &source.mime_type, plan)
            .await
            .at(WorkerStep::Pipeline)?;

        let key = derived_key(
            &self.settings.blob_domain,
            owner_id,
            source_id,
            fingerprint,
            mime_extension(&output.mime_type),
        );
        let receipt = self
            .retry
            .run("derived put", || {
                self.blobs
                    .put(&key, output.bytes.clone(), &output.mime_type)
            })
            .await
            .at(WorkerStep::Persist)?;
        let record = NewMediaObject {
            owner_id,
            storage_key: key.clone(),
            mime_type: output.mime_type.clone(),
            size_bytes: receipt.size_bytes as i64,
            filename: format!("{}-transformed", source.filename),
            parent_id: Some(source_id),
            fingerprint: Some(fingerprint.to_string()),
        };
        let derived = self
            .retry
            .run("derived record", || self.metadata.upsert_derived(record.clone()))
            .await
            .at(WorkerStep::Persist)?;

        // the row is visible from here on; list pages must not hide it
        self.ledger
            .bump(owner_id)
            .await
            .at(WorkerStep::VersionBump)?;

        let cached = serde_json::to_string(&derived).at(WorkerStep::CacheWrite)?;
        self.cache
            .set(result_key, cached, Some(self.settings.cache_ttl))
            .await
            .at(WorkerStep::CacheWrite)?;
        Ok(derived)
    }
}

fn log_failure(failure: &StepFailure) {
    let step = failure.step;
    let kind = failure.error.kind();
    match &failure.error {
        MediaError::PipelineFailure(_) | MediaError::Backend(_) => {
            error!(%step, kind, "dropping transform: {}", failure.error)
        }
        MediaError::TransientIo(_) => {
            warn!(%step, kind, "retries exhausted, dropping transform: {}", failure.error)
        }
        _ => warn!(%step, kind, "dropping transform: {}", failure.error),
    }
}

/// Start `count` consumer loops on `queue`. Each loop finishes the message in
/// hand before observing `shutdown`.
pub fn spawn_workers(
    worker: TransformWorker,
    queue: Arc<dyn TransformQueue>,
    count: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|index| {
            let worker = worker.clone();
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(consume(index, worker, queue, shutdown))
        })
        .collect()
}

async fn consume(
    index: usize,
    worker: TransformWorker,
    queue: Arc<dyn TransformQueue>,
    shutdown: CancellationToken,
) {
    info!("transform worker {} started", index);
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = queue.receive() => received,
        };
        match received {
            Ok(Some(delivery)) => {
                worker.handle(&delivery).await;
                // failures are dropped, never requeued
                if let Err(err) = queue.ack(&delivery).await {
                    warn!("failed to ack delivery {}: {}", delivery.id, err);
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("queue receive failed: {}", err);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                }
            }
        }
    }
    info!("transform worker {} stopped", index);
}
