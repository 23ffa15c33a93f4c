//! In-memory stand-ins for the stores and media tools.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::models::{NewVideo, Video, VideoStatus};
use crate::db::VideoRepository;
use crate::error::{Error, Result};
use crate::services::byte_source::ByteSource;
use crate::services::frame::FrameExtractor;
use crate::services::probe::MediaProbe;
use crate::storage::{namespaced_key, ObjectStore};

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (String, Vec<u8>)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, content_type: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (content_type.to_string(), data));
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|(_, d)| d.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().unwrap().get(key).map(|(c, _)| c.clone())
    }

    pub fn presigned_form(key: &str, ttl: Duration) -> String {
        format!("http://memory/{}?expires={}", key, ttl.as_secs())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<String> {
        let key = namespaced_key("videos", key);
        self.insert(&key, content_type, data.to_vec());
        Ok(key)
    }

    async fn put_streamed(
        &self,
        key: &str,
        content_type: &str,
        source: ByteSource,
    ) -> Result<String> {
        let data = source.collect_bytes().await?;
        self.put(key, content_type, Bytes::from(data)).await
    }

    async fn presigned_read_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if !self.objects.lock().unwrap().contains_key(key) {
            return Err(Error::StorageRead(format!("object {} does not exist", key)));
        }
        Ok(Self::presigned_form(key, ttl))
    }

    fn public_url(&self, key: &str) -> String {
        format!("http://memory/{}", key)
    }
}

#[derive(Default)]
pub struct MemoryVideoRepository {
    rows: Mutex<HashMap<Uuid, Video>>,
    enrichment_writes: AtomicUsize,
    fail_enrichment: AtomicBool,
}

impl MemoryVideoRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_processing(&self, title: &str, storage_key: &str) -> Uuid {
        let video = self
            .create(NewVideo {
                id: Uuid::new_v4(),
                title: title.to_string(),
                storage_key: storage_key.to_string(),
            })
            .await
            .unwrap();
        video.id
    }

    pub fn enrichment_writes(&self) -> usize {
        self.enrichment_writes.load(Ordering::SeqCst)
    }

    pub fn fail_enrichment_writes(&self) {
        self.fail_enrichment.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl VideoRepository for MemoryVideoRepository {
    async fn create(&self, video: NewVideo) -> Result<Video> {
        let mut rows = self.rows.lock().unwrap();
        // Strictly increasing timestamps keep "newest first" deterministic.
        let now = Utc::now().naive_utc() + chrono::Duration::milliseconds(rows.len() as i64);
        let row = Video {
            id: video.id,
            title: video.title,
            storage_key: video.storage_key,
            status: VideoStatus::Processing,
            duration_seconds: None,
            thumbnail_key: None,
            created_at: now,
            updated_at: now,
        };
        if rows.contains_key(&row.id) {
            return Err(Error::MetadataStore(format!("duplicate id {}", row.id)));
        }
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Video> {
        self.rows
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    async fn list_ready(&self) -> Result<Vec<Video>> {
        let mut list: Vec<Video> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|v| v.status.is_ready())
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn list_processing(&self) -> Result<Vec<Uuid>> {
        let rows = self.rows.lock().unwrap();
        let mut list: Vec<&Video> = rows
            .values()
            .filter(|v| v.status == VideoStatus::Processing)
            .collect();
        list.sort_by_key(|v| v.created_at);
        Ok(list.into_iter().map(|v| v.id).collect())
    }

    async fn update_status(&self, id: Uuid, status: VideoStatus) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(Error::NotFound(id))?;
        row.status = status;
        row.updated_at = Utc::now().naive_utc();
        Ok(())
    }

    async fn update_enrichment(
        &self,
        id: Uuid,
        thumbnail_key: Option<String>,
        duration_seconds: Option<i32>,
    ) -> Result<()> {
        if self.fail_enrichment.load(Ordering::SeqCst) {
            return Err(Error::MetadataStore("connection reset".into()));
        }
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(Error::NotFound(id))?;
        row.thumbnail_key = thumbnail_key;
        row.duration_seconds = duration_seconds;
        row.updated_at = Utc::now().naive_utc();
        self.enrichment_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

enum ProbeBehavior {
    Duration(u32),
    Fail,
    Slow(Duration, u32),
}

pub struct FakeProbe {
    behavior: ProbeBehavior,
    seen: Arc<Mutex<Vec<String>>>,
    gate: Option<Arc<Semaphore>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FakeProbe {
    fn with(behavior: ProbeBehavior) -> Self {
        Self {
            behavior,
            seen: Arc::default(),
            gate: None,
            running: Arc::default(),
            peak: Arc::default(),
        }
    }

    pub fn duration(seconds: u32) -> Self {
        Self::with(ProbeBehavior::Duration(seconds))
    }

    pub fn failing() -> Self {
        Self::with(ProbeBehavior::Fail)
    }

    pub fn slow(delay: Duration, seconds: u32) -> Self {
        Self::with(ProbeBehavior::Slow(delay, seconds))
    }

    /// Each probe call waits for one permit on the returned semaphore.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn seen_urls(&self) -> Arc<Mutex<Vec<String>>> {
        self.seen.clone()
    }

    /// Highest number of probes that were in flight at the same time.
    pub fn peak_concurrency(&self) -> Arc<AtomicUsize> {
        self.peak.clone()
    }
}

#[async_trait]
impl MediaProbe for FakeProbe {
    async fn probe_duration(&self, source_url: &str, cancel: &CancellationToken) -> Result<u32> {
        self.seen.lock().unwrap().push(source_url.to_string());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result: Result<u32> = async {
            if let Some(gate) = &self.gate {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    permit = gate.acquire() => {
                        permit.map_err(|_| Error::Probe("gate closed".into()))?.forget();
                    }
                }
            }
            match &self.behavior {
                ProbeBehavior::Duration(seconds) => Ok(*seconds),
                ProbeBehavior::Fail => Err(Error::Probe("ffprobe exited with 1".into())),
                ProbeBehavior::Slow(delay, seconds) => {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                        _ = tokio::time::sleep(*delay) => Ok(*seconds),
                    }
                }
            }
        }
        .await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

enum ExtractBehavior {
    Frame(Vec<u8>),
    Fail,
    FailAfter(Vec<u8>),
}

pub struct FakeExtractor {
    behavior: ExtractBehavior,
    seen: Arc<Mutex<Vec<String>>>,
}

impl FakeExtractor {
    fn with(behavior: ExtractBehavior) -> Self {
        Self {
            behavior,
            seen: Arc::default(),
        }
    }

    pub fn frame(data: Vec<u8>) -> Self {
        Self::with(ExtractBehavior::Frame(data))
    }

    pub fn failing() -> Self {
        Self::with(ExtractBehavior::Fail)
    }

    /// Streams `data`, then reports a failed exit.
    pub fn fails_after(data: Vec<u8>) -> Self {
        Self::with(ExtractBehavior::FailAfter(data))
    }

    pub fn seen_urls(&self) -> Arc<Mutex<Vec<String>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl FrameExtractor for FakeExtractor {
    async fn extract_frame(&self, source_url: &str, _at: Duration) -> Result<ByteSource> {
        self.seen.lock().unwrap().push(source_url.to_string());
        match &self.behavior {
            ExtractBehavior::Frame(data) => Ok(ByteSource::from_bytes(data.clone())),
            ExtractBehavior::Fail => Err(Error::Extraction("failed to spawn ffmpeg".into())),
            ExtractBehavior::FailAfter(data) => Ok(ByteSource::new(stream::iter(vec![
                Ok(Bytes::from(data.clone())),
                Err(Error::Extraction("ffmpeg exited with 1".into())),
            ]))),
        }
    }
}

/// Polls until `id` leaves `processing` or the timeout passes.
pub async fn wait_until_enriched(videos: &dyn VideoRepository, id: Uuid) -> Video {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let video = videos.get(id).await.unwrap();
        if video.status != VideoStatus::Processing {
            return video;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "video {} still processing",
            id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
