//! Shared state handed to every handler.

use crate::services::{dispatcher::TransformDispatcher, media_service::MediaService};

#[derive(Clone)]
pub struct AppState {
    pub media: MediaService,
    pub dispatcher: TransformDispatcher,
}
