//! Media storage with an asynchronous, cache-aware transform pipeline.
//!
//! Requests to transform an object are validated and queued on the request
//! path; background workers run the fixed-order [`pipeline`] and publish the
//! derived object through the metadata store and cache.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
pub mod state;
