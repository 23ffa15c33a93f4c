use std::sync::Arc;
use std::time::Duration;

use crate::db::VideoRepository;
use crate::services::queue::EnrichmentQueue;
use crate::storage::ObjectStore;

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub videos: Arc<dyn VideoRepository>,
    pub queue: EnrichmentQueue,
    pub playback_url_ttl: Duration,
    pub max_file_size: usize,
}
