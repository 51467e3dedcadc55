//! Routes for media objects and transform requests.
//!
//! - `POST   /objects`: upload (raw body, `?filename=`)
//! - `GET    /objects`: list the caller's objects (`?page=&limit=`)
//! - `GET    /objects/{id}`: metadata
//! - `DELETE /objects/{id}`: delete
//! - `GET    /objects/{id}/content`: payload
//! - `GET    /objects/{id}/derived`: renditions derived from `{id}`
//! - `POST   /objects/{id}/transform`: queue a transform, answers 202

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{
            delete_object, get_content, get_object, list_derived, list_objects, transform_object,
            upload_object,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Transform requests are small JSON documents.
const TRANSFORM_BODY_LIMIT: usize = 64 * 1024;

pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/objects", post(upload_object).get(list_objects))
        .route("/objects/{id}", get(get_object).delete(delete_object))
        .route("/objects/{id}/content", get(get_content))
        .route("/objects/{id}/derived", get(list_derived))
        .route(
            "/objects/{id}/transform",
            post(transform_object).layer(DefaultBodyLimit::max(TRANSFORM_BODY_LIMIT)),
        )
}
