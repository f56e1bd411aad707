//! HTTP handlers. Thin translation between requests and `ObjectService`.

pub mod health_handlers;
pub mod object_handlers;

use crate::services::object_service::ObjectService;

/// Shared state handed to every handler.
#[derive(Clone, Debug)]
pub struct AppState {
    pub objects: ObjectService,
    /// Base for share links, without a trailing slash.
    pub public_url: Option<String>,
}
