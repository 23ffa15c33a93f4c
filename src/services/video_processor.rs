// src/services/video_processor.rs
//! Enrichment of a single uploaded video.
//!
//! A job reads the record, presigns a short-lived URL for the raw object, runs
//! frame extraction and duration probing against that URL, writes whatever was
//! derived and moves the video out of `processing`. Sub-step failures only cost
//! the field they were producing; the video still becomes playable, flagged as
//! `degraded` when anything is missing.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::models::{Video, VideoStatus};
use crate::db::VideoRepository;
use crate::error::{Error, Result};
use crate::services::frame::FrameExtractor;
use crate::services::probe::MediaProbe;
use crate::storage::ObjectStore;

const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Where in the video the thumbnail frame is taken.
    pub thumbnail_offset: Duration,
    /// Lifetime of the URL handed to ffmpeg/ffprobe.
    pub source_url_ttl: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            thumbnail_offset: Duration::from_secs(2),
            source_url_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// One unit of enrichment work, owned by the worker running it.
#[derive(Debug)]
pub struct EnrichmentJob {
    pub video_id: Uuid,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl EnrichmentJob {
    pub fn new(video_id: Uuid, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            video_id,
            deadline: Instant::now() + timeout,
            cancel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    Success {
        thumbnail_key: String,
        duration_seconds: i32,
    },
    PartialSuccess {
        thumbnail_key: Option<String>,
        duration_seconds: Option<i32>,
    },
    Failed,
}

impl EnrichmentOutcome {
    pub fn from_parts(thumbnail_key: Option<String>, duration_seconds: Option<i32>) -> Self {
        match (thumbnail_key, duration_seconds) {
            (Some(thumbnail_key), Some(duration_seconds)) => EnrichmentOutcome::Success {
                thumbnail_key,
                duration_seconds,
            },
            (None, None) => EnrichmentOutcome::Failed,
            (thumbnail_key, duration_seconds) => EnrichmentOutcome::PartialSuccess {
                thumbnail_key,
                duration_seconds,
            },
        }
    }

    pub fn status(&self) -> VideoStatus {
        match self {
            EnrichmentOutcome::Success { .. } => VideoStatus::Ready,
            _ => VideoStatus::Degraded,
        }
    }

    pub fn thumbnail_key(&self) -> Option<&str> {
        match self {
            EnrichmentOutcome::Success { thumbnail_key, .. } => Some(thumbnail_key),
            EnrichmentOutcome::PartialSuccess { thumbnail_key, .. } => thumbnail_key.as_deref(),
            EnrichmentOutcome::Failed => None,
        }
    }

    pub fn duration_seconds(&self) -> Option<i32> {
        match self {
            EnrichmentOutcome::Success {
                duration_seconds, ..
            } => Some(*duration_seconds),
            EnrichmentOutcome::PartialSuccess {
                duration_seconds, ..
            } => *duration_seconds,
            EnrichmentOutcome::Failed => None,
        }
    }
}

pub struct VideoProcessor {
    store: Arc<dyn ObjectStore>,
    videos: Arc<dyn VideoRepository>,
    probe: Arc<dyn MediaProbe>,
    extractor: Arc<dyn FrameExtractor>,
    settings: ProcessorSettings,
}

impl VideoProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        videos: Arc<dyn VideoRepository>,
        probe: Arc<dyn MediaProbe>,
        extractor: Arc<dyn FrameExtractor>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            videos,
            probe,
            extractor,
            settings,
        }
    }

    /// Runs the job to completion.
    ///
    /// `None` means the video had already left `processing` and nothing was
    /// done. Errors mean the record was not moved out of `processing`: the
    /// video does not exist, the job was cancelled, or the final status write
    /// failed.
    pub async fn process(&self, job: &EnrichmentJob) -> Result<Option<EnrichmentOutcome>> {
        let video_id = job.video_id;
        log::info!("Processing video {}", video_id);

        let video = self.videos.get(video_id).await.map_err(|e| {
            log::error!("Failed to get video {}: {}", video_id, e);
            e
        })?;

        if video.status != VideoStatus::Processing {
            log::info!("Video {} is already {}, skipping", video_id, video.status);
            return Ok(None);
        }

        let outcome = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => return Err(Error::Cancelled),
            outcome = self.derive(&video, job) => outcome,
        };

        let outcome = self.persist(video_id, outcome).await;

        self.videos
            .update_status(video_id, outcome.status())
            .await
            .map_err(|e| {
                log::error!("Failed to update status of video {}: {}", video_id, e);
                e
            })?;

        log::info!(
            "Video {} processing complete: {} (duration: {:?}, thumbnail: {:?})",
            video_id,
            outcome.status(),
            outcome.duration_seconds(),
            outcome.thumbnail_key()
        );
        Ok(Some(outcome))
    }

    async fn derive(&self, video: &Video, job: &EnrichmentJob) -> EnrichmentOutcome {
        let presign = self
            .store
            .presigned_read_url(&video.storage_key, self.settings.source_url_ttl);
        let source_url = match timeout_at(job.deadline, presign).await {
            Ok(Ok(url)) => url,
            Ok(Err(e)) => {
                log::warn!("No source URL for video {}: {}", video.id, e);
                return EnrichmentOutcome::Failed;
            }
            Err(_) => {
                log::warn!("Timed out presigning source of video {}", video.id);
                return EnrichmentOutcome::Failed;
            }
        };

        let (thumbnail, duration) = tokio::join!(
            timeout_at(
                job.deadline,
                self.generate_thumbnail(video.id, &source_url)
            ),
            timeout_at(
                job.deadline,
                self.probe.probe_duration(&source_url, &job.cancel)
            ),
        );

        let thumbnail_key = match thumbnail {
            Ok(Ok(key)) => Some(key),
            Ok(Err(e)) => {
                log::warn!("Thumbnail failed for {}: {}", video.id, e);
                None
            }
            Err(_) => {
                log::warn!("Thumbnail for {} timed out", video.id);
                None
            }
        };

        let duration_seconds = match duration {
            Ok(Ok(seconds)) => Some(i32::try_from(seconds).unwrap_or(i32::MAX)),
            Ok(Err(e)) => {
                log::warn!("Duration probe failed for {}: {}", video.id, e);
                None
            }
            Err(_) => {
                log::warn!("Duration probe for {} timed out", video.id);
                None
            }
        };

        EnrichmentOutcome::from_parts(thumbnail_key, duration_seconds)
    }

    async fn generate_thumbnail(&self, video_id: Uuid, source_url: &str) -> Result<String> {
        let frame = self
            .extractor
            .extract_frame(source_url, self.settings.thumbnail_offset)
            .await?;

        self.store
            .put_streamed(
                &format!("thumbnails/{}.jpg", video_id),
                THUMBNAIL_CONTENT_TYPE,
                frame,
            )
            .await
    }

    /// Writes the derived fields. If that write fails nothing was persisted, so
    /// the outcome degrades to `Failed`.
    async fn persist(&self, video_id: Uuid, outcome: EnrichmentOutcome) -> EnrichmentOutcome {
        if outcome == EnrichmentOutcome::Failed {
            return outcome;
        }

        let result = self
            .videos
            .update_enrichment(
                video_id,
                outcome.thumbnail_key().map(str::to_string),
                outcome.duration_seconds(),
            )
            .await;

        match result {
            Ok(()) => outcome,
            Err(e) => {
                log::error!("Failed to store enrichment for video {}: {}", video_id, e);
                EnrichmentOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        FakeExtractor, FakeProbe, MemoryObjectStore, MemoryVideoRepository,
    };

    struct Harness {
        store: Arc<MemoryObjectStore>,
        videos: Arc<MemoryVideoRepository>,
        processor: VideoProcessor,
    }

    fn harness(probe: FakeProbe, extractor: FakeExtractor) -> Harness {
        let store = Arc::new(MemoryObjectStore::new());
        let videos = Arc::new(MemoryVideoRepository::new());
        let processor = VideoProcessor::new(
            store.clone(),
            videos.clone(),
            Arc::new(probe),
            Arc::new(extractor),
            ProcessorSettings::default(),
        );
        Harness {
            store,
            videos,
            processor,
        }
    }

    async fn seed(h: &Harness) -> Uuid {
        h.store.insert("videos/raw.mp4", "video/mp4", vec![0u8; 16]);
        h.videos.seed_processing("clip.mp4", "videos/raw.mp4").await
    }

    fn job(id: Uuid) -> EnrichmentJob {
        EnrichmentJob::new(id, Duration::from_secs(5), CancellationToken::new())
    }

    #[tokio::test]
    async fn full_success_marks_ready() {
        let h = harness(FakeProbe::duration(42), FakeExtractor::frame(vec![1, 2, 3]));
        let id = seed(&h).await;

        let outcome = h.processor.process(&job(id)).await.unwrap().unwrap();

        let thumbnail_key = format!("videos/thumbnails/{}.jpg", id);
        assert_eq!(
            outcome,
            EnrichmentOutcome::Success {
                thumbnail_key: thumbnail_key.clone(),
                duration_seconds: 42
            }
        );
        let video = h.videos.get(id).await.unwrap();
        assert_eq!(video.status, VideoStatus::Ready);
        assert_eq!(video.duration_seconds, Some(42));
        assert_eq!(video.thumbnail_key.as_deref(), Some(thumbnail_key.as_str()));
        assert_eq!(h.store.object(&thumbnail_key), Some(vec![1, 2, 3]));
        assert_eq!(
            h.store.content_type(&thumbnail_key).as_deref(),
            Some("image/jpeg")
        );
    }

    #[tokio::test]
    async fn tools_receive_the_presigned_source_url() {
        let probe = FakeProbe::duration(1);
        let extractor = FakeExtractor::frame(vec![7]);
        let (seen_probe, seen_extract) = (probe.seen_urls(), extractor.seen_urls());
        let h = harness(probe, extractor);
        let id = seed(&h).await;

        h.processor.process(&job(id)).await.unwrap().unwrap();

        let expected = MemoryObjectStore::presigned_form("videos/raw.mp4", Duration::from_secs(900));
        assert_eq!(*seen_probe.lock().unwrap(), vec![expected.clone()]);
        assert_eq!(*seen_extract.lock().unwrap(), vec![expected]);
    }

    #[tokio::test]
    async fn extractor_failure_keeps_duration() {
        let h = harness(FakeProbe::duration(42), FakeExtractor::failing());
        let id = seed(&h).await;

        let outcome = h.processor.process(&job(id)).await.unwrap().unwrap();

        assert_eq!(
            outcome,
            EnrichmentOutcome::PartialSuccess {
                thumbnail_key: None,
                duration_seconds: Some(42)
            }
        );
        let video = h.videos.get(id).await.unwrap();
        assert!(video.status.is_ready());
        assert_eq!(video.status, VideoStatus::Degraded);
        assert_eq!(video.duration_seconds, Some(42));
        assert_eq!(video.thumbnail_key, None);
    }

    #[tokio::test]
    async fn mid_stream_extractor_failure_leaves_no_thumbnail() {
        let h = harness(
            FakeProbe::duration(9),
            FakeExtractor::fails_after(vec![0xff, 0xd8]),
        );
        let id = seed(&h).await;

        h.processor.process(&job(id)).await.unwrap().unwrap();

        let video = h.videos.get(id).await.unwrap();
        assert_eq!(video.thumbnail_key, None);
        assert_eq!(h.store.object(&format!("videos/thumbnails/{}.jpg", id)), None);
        assert_eq!(video.status, VideoStatus::Degraded);
    }

    #[tokio::test]
    async fn probe_failure_keeps_thumbnail() {
        let h = harness(FakeProbe::failing(), FakeExtractor::frame(vec![5; 10]));
        let id = seed(&h).await;

        h.processor.process(&job(id)).await.unwrap().unwrap();

        let video = h.videos.get(id).await.unwrap();
        assert_eq!(video.status, VideoStatus::Degraded);
        assert_eq!(video.duration_seconds, None);
        assert!(video.thumbnail_key.is_some());
    }

    #[tokio::test]
    async fn both_failures_still_reach_ready_class() {
        let h = harness(FakeProbe::failing(), FakeExtractor::failing());
        let id = seed(&h).await;

        let outcome = h.processor.process(&job(id)).await.unwrap().unwrap();

        assert_eq!(outcome, EnrichmentOutcome::Failed);
        let video = h.videos.get(id).await.unwrap();
        assert!(video.status.is_ready());
        assert_eq!(video.duration_seconds, None);
        assert_eq!(video.thumbnail_key, None);
        assert_eq!(h.videos.enrichment_writes(), 0);
    }

    #[tokio::test]
    async fn missing_source_object_degrades_without_running_tools() {
        let probe = FakeProbe::duration(42);
        let calls = probe.seen_urls();
        let h = harness(probe, FakeExtractor::frame(vec![1]));
        let id = h.videos.seed_processing("gone.mp4", "videos/gone.mp4").await;

        let outcome = h.processor.process(&job(id)).await.unwrap().unwrap();

        assert_eq!(outcome, EnrichmentOutcome::Failed);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(h.videos.get(id).await.unwrap().status, VideoStatus::Degraded);
    }

    #[tokio::test]
    async fn unknown_video_aborts_without_writes() {
        let h = harness(FakeProbe::duration(1), FakeExtractor::frame(vec![1]));
        let id = Uuid::new_v4();

        let err = h.processor.process(&job(id)).await.unwrap_err();

        assert!(matches!(err, Error::NotFound(missing) if missing == id));
        assert_eq!(h.videos.enrichment_writes(), 0);
    }

    #[tokio::test]
    async fn deadline_cuts_slow_probe_but_still_finishes() {
        let h = harness(
            FakeProbe::slow(Duration::from_secs(30), 42),
            FakeExtractor::frame(vec![1, 2, 3]),
        );
        let id = seed(&h).await;
        let job = EnrichmentJob::new(id, Duration::from_millis(100), CancellationToken::new());

        let outcome = h.processor.process(&job).await.unwrap().unwrap();

        assert_eq!(outcome.duration_seconds(), None);
        assert!(outcome.thumbnail_key().is_some());
        assert_eq!(h.videos.get(id).await.unwrap().status, VideoStatus::Degraded);
    }

    #[tokio::test]
    async fn cancellation_leaves_video_processing() {
        let h = harness(
            FakeProbe::slow(Duration::from_secs(30), 42),
            FakeExtractor::frame(vec![1]),
        );
        let id = seed(&h).await;
        let cancel = CancellationToken::new();
        let job = EnrichmentJob::new(id, Duration::from_secs(60), cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = h.processor.process(&job).await.unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(
            h.videos.get(id).await.unwrap().status,
            VideoStatus::Processing
        );
    }

    #[tokio::test]
    async fn failed_enrichment_write_degrades() {
        let h = harness(FakeProbe::duration(3), FakeExtractor::frame(vec![1]));
        let id = seed(&h).await;
        h.videos.fail_enrichment_writes();

        let outcome = h.processor.process(&job(id)).await.unwrap().unwrap();

        assert_eq!(outcome, EnrichmentOutcome::Failed);
        assert_eq!(h.videos.get(id).await.unwrap().status, VideoStatus::Degraded);
    }

    #[tokio::test]
    async fn finished_video_is_not_enriched_again() {
        let probe = FakeProbe::duration(42);
        let calls = probe.seen_urls();
        let h = harness(probe, FakeExtractor::frame(vec![1, 2, 3]));
        let id = seed(&h).await;

        assert!(h.processor.process(&job(id)).await.unwrap().is_some());
        assert!(h.processor.process(&job(id)).await.unwrap().is_none());

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(h.videos.enrichment_writes(), 1);
        assert_eq!(h.videos.get(id).await.unwrap().status, VideoStatus::Ready);
    }

    #[test]
    fn outcome_tagging() {
        assert_eq!(EnrichmentOutcome::from_parts(None, None), EnrichmentOutcome::Failed);
        assert_eq!(
            EnrichmentOutcome::from_parts(Some("k".into()), None).status(),
            VideoStatus::Degraded
        );
        assert_eq!(
            EnrichmentOutcome::from_parts(Some("k".into()), Some(1)).status(),
            VideoStatus::Ready
        );
    }
}
