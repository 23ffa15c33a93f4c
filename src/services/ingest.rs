use bytes::Bytes;
use std::path::Path;
use uuid::Uuid;

use crate::db::models::{NewVideo, Video};
use crate::db::VideoRepository;
use crate::error::Result;
use crate::services::queue::EnrichmentQueue;
use crate::storage::ObjectStore;

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub data: Bytes,
}

/// Stores the raw upload, records it as `processing` and queues enrichment.
///
/// Returns as soon as the record exists; enrichment happens in the background.
pub async fn ingest_upload(
    store: &dyn ObjectStore,
    videos: &dyn VideoRepository,
    queue: &EnrichmentQueue,
    upload: UploadedFile,
) -> Result<Video> {
    let video_id = Uuid::new_v4();
    let object_key = format!("{}{}", video_id, extension_of(&upload.filename));

    log::info!(
        "Storing upload {} ({} bytes) as {}",
        upload.filename,
        upload.data.len(),
        object_key
    );
    let storage_key = store
        .put(&object_key, &upload.content_type, upload.data)
        .await?;

    let video = videos
        .create(NewVideo {
            id: video_id,
            title: upload.filename,
            storage_key,
        })
        .await?;

    // A video that could not be queued is picked up by startup recovery.
    if let Err(e) = queue.submit(video.id).await {
        log::warn!("Could not queue enrichment for {}: {}", video.id, e);
    }

    Ok(video)
}

/// Lower-cased extension including the dot, or empty when there is no usable one.
fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}
