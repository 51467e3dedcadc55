//! Collaborators and orchestration behind the HTTP layer.

pub mod blob_store;
pub mod cache;
pub mod dispatcher;
pub mod fingerprint;
pub mod media_service;
pub mod metadata_store;
pub mod queue;
pub mod retry;
pub mod version_ledger;
pub mod watermark;
pub mod worker;
