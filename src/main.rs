use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use std::sync::Arc;

use video_ingest::config::AppConfig;
use video_ingest::db::{self, PgVideoRepository, VideoRepository};
use video_ingest::services::frame::FfmpegFrameExtractor;
use video_ingest::services::probe::FfprobeProbe;
use video_ingest::services::queue::{find_stuck_videos, resubmit, EnrichmentQueue, QueueSettings};
use video_ingest::services::video_processor::{ProcessorSettings, VideoProcessor};
use video_ingest::state::AppState;
use video_ingest::storage::{ObjectStore, S3ObjectStore};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logger
    env_logger::init();

    let config = AppConfig::new().context("Failed to load configuration")?;

    let pool = db::create_pool(&config.database.url, config.database.max_connections)
        .context("Failed to create database pool")?;
    let videos: Arc<dyn VideoRepository> = Arc::new(PgVideoRepository::new(pool));

    let store: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::connect(&config.storage)
            .await
            .context("Failed to initialise object storage")?,
    );

    let processor = Arc::new(VideoProcessor::new(
        store.clone(),
        videos.clone(),
        Arc::new(FfprobeProbe::new(&config.ffmpeg.ffprobe_path)),
        Arc::new(FfmpegFrameExtractor::new(&config.ffmpeg.ffmpeg_path)),
        ProcessorSettings {
            thumbnail_offset: config.ffmpeg.thumbnail_offset(),
            source_url_ttl: config.enrichment.source_url_ttl(),
        },
    ));

    let (queue, dispatcher) = EnrichmentQueue::start(
        processor,
        QueueSettings {
            workers: config.enrichment.workers,
            capacity: config.enrichment.queue_capacity,
            job_timeout: config.enrichment.job_timeout(),
        },
    );

    if config.enrichment.recover_on_startup {
        // Listed before the server binds so no fresh upload is included.
        let stuck = find_stuck_videos(videos.as_ref())
            .await
            .context("Failed to list videos left in processing")?;
        let queue = queue.clone();
        tokio::spawn(async move {
            if let Err(e) = resubmit(&queue, stuck).await {
                log::error!("Startup recovery failed: {}", e);
            }
        });
    }

    let state = AppState {
        store,
        videos,
        queue: queue.clone(),
        playback_url_ttl: config.enrichment.playback_url_ttl(),
        max_file_size: config.storage.max_file_size,
    };

    log::info!(
        "Starting server on {}:{}",
        config.server.host,
        config.server.port
    );

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(actix_cors::Cors::permissive()) // Configure properly in production
            .configure(video_ingest::api::configure)
    })
    .bind((config.server.host.clone(), config.server.port))?
    .run()
    .await?;

    // Running jobs are cancelled; their videos stay in processing for the next start.
    queue.shutdown();
    if let Err(e) = dispatcher.await {
        log::error!("Enrichment dispatcher ended abnormally: {}", e);
    }

    Ok(())
}
