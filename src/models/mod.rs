//! Core data models for the media transformation service.
//!
//! `MediaObject` maps to the `media_objects` table via `sqlx::FromRow`;
//! transform specs and queue messages serialize as JSON via `serde`.

pub mod media_object;
pub mod message;
pub mod transform;
