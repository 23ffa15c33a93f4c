//! Bounded enrichment worker pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::VideoRepository;
use crate::error::{Error, Result};
use crate::services::video_processor::{EnrichmentJob, VideoProcessor};

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Jobs allowed to run at the same time.
    pub workers: usize,
    /// Ids allowed to wait for a worker before `submit` blocks.
    pub capacity: usize,
    pub job_timeout: Duration,
}

/// Ids that are queued or running. A video is never held twice.
type Pending = Arc<Mutex<HashSet<Uuid>>>;

#[derive(Clone)]
pub struct EnrichmentQueue {
    tx: mpsc::Sender<Uuid>,
    pending: Pending,
    shutdown: CancellationToken,
}

impl EnrichmentQueue {
    /// Spawns the dispatcher. The handle resolves once every started job has
    /// finished after `shutdown`, or after all queue handles are dropped.
    pub fn start(processor: Arc<VideoProcessor>, settings: QueueSettings) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let shutdown = CancellationToken::new();
        let pending = Pending::default();
        let handle = tokio::spawn(dispatch(
            rx,
            processor,
            settings,
            pending.clone(),
            shutdown.clone(),
        ));
        (
            Self {
                tx,
                pending,
                shutdown,
            },
            handle,
        )
    }

    /// Waits for queue capacity, then hands `video_id` to the pool.
    ///
    /// Returns `false` without queueing when the id is already queued or running.
    pub async fn submit(&self, video_id: Uuid) -> Result<bool> {
        if self.shutdown.is_cancelled() {
            return Err(Error::QueueClosed);
        }
        if !self.pending.lock().await.insert(video_id) {
            log::debug!("Video {} is already queued", video_id);
            return Ok(false);
        }
        if self.tx.send(video_id).await.is_err() {
            self.pending.lock().await.remove(&video_id);
            return Err(Error::QueueClosed);
        }
        Ok(true)
    }

    /// Stops taking work and cancels running jobs.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Uuid>,
    processor: Arc<VideoProcessor>,
    settings: QueueSettings,
    pending: Pending,
    shutdown: CancellationToken,
) {
    let workers = Arc::new(Semaphore::new(settings.workers.max(1)));
    let mut running = JoinSet::new();

    log::info!(
        "Enrichment queue started with {} workers, capacity {}",
        settings.workers.max(1),
        settings.capacity.max(1)
    );

    loop {
        let video_id = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    log::error!("Enrichment task panicked: {}", e);
                }
                continue;
            }
            next = rx.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // The deadline starts when a worker is free, not at submission.
        let job = EnrichmentJob::new(video_id, settings.job_timeout, shutdown.child_token());
        let processor = processor.clone();
        let pending = pending.clone();
        running.spawn(async move {
            run_job(&processor, job).await;
            pending.lock().await.remove(&video_id);
            drop(permit);
        });
    }

    rx.close();
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            log::error!("Enrichment task panicked: {}", e);
        }
    }
    log::info!("Enrichment queue stopped");
}

async fn run_job(processor: &VideoProcessor, job: EnrichmentJob) {
    let video_id = job.video_id;
    match processor.process(&job).await {
        Ok(Some(outcome)) => {
            log::debug!("Enrichment of {} finished as {}", video_id, outcome.status())
        }
        Ok(None) => {}
        Err(Error::Cancelled) => {
            log::warn!("Enrichment of {} cancelled, left in processing", video_id)
        }
        Err(e) => log::error!("Enrichment of {} failed: {}", video_id, e),
    }
}

/// Ids left in `processing` by a previous run.
///
/// Must be read before the server accepts uploads, otherwise a fresh upload
/// would be picked up here as well.
pub async fn find_stuck_videos(videos: &dyn VideoRepository) -> Result<Vec<Uuid>> {
    let stuck = videos.list_processing().await?;
    if !stuck.is_empty() {
        log::info!("Found {} videos left in processing", stuck.len());
    }
    Ok(stuck)
}

/// Queues `ids` for enrichment. Returns how many were actually queued.
pub async fn resubmit(queue: &EnrichmentQueue, ids: Vec<Uuid>) -> Result<usize> {
    let mut queued = 0;
    for id in ids {
        if queue.submit(id).await? {
            queued += 1;
        }
    }
    Ok(queued)
}

/// `find_stuck_videos` followed by `resubmit`.
pub async fn recover_stuck_videos(
    videos: &dyn VideoRepository,
    queue: &EnrichmentQueue,
) -> Result<usize> {
    let stuck = find_stuck_videos(videos).await?;
    resubmit(queue, stuck).await
}
