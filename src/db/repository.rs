use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use uuid::Uuid;

use super::models::{NewVideo, Video, VideoStatus};
use super::schema::videos;
use super::DbPool;
use crate::error::{Error, Result};

/// Persistence for video records. Every mutation is a single-row statement.
#[async_trait]
pub trait VideoRepository: Send + Sync {
    /// Inserts a new record; the status is always `processing`.
    async fn create(&self, video: NewVideo) -> Result<Video>;

    async fn get(&self, id: Uuid) -> Result<Video>;

    /// Ready-class videos, newest first.
    async fn list_ready(&self) -> Result<Vec<Video>>;

    /// Ids of videos whose enrichment never finished, oldest first.
    async fn list_processing(&self) -> Result<Vec<Uuid>>;

    async fn update_status(&self, id: Uuid, status: VideoStatus) -> Result<()>;

    /// Writes both derived columns in one statement; `None` clears a column.
    async fn update_enrichment(
        &self,
        id: Uuid,
        thumbnail_key: Option<String>,
        duration_seconds: Option<i32>,
    ) -> Result<()>;
}

/// Derived columns written by enrichment. `None` is written as NULL.
#[derive(Debug, AsChangeset)]
#[diesel(table_name = videos, treat_none_as_null = true)]
struct EnrichmentChanges {
    thumbnail_key: Option<String>,
    duration_seconds: Option<i32>,
    updated_at: NaiveDateTime,
}

fn ready_videos() -> videos::BoxedQuery<'static, Pg> {
    videos::table
        .filter(videos::status.eq_any(VideoStatus::READY_CLASS))
        .order_by(videos::created_at.desc())
        .into_boxed()
}

fn processing_ids() -> videos::BoxedQuery<'static, Pg, diesel::sql_types::Uuid> {
    videos::table
        .filter(videos::status.eq(VideoStatus::Processing))
        .order_by(videos::created_at.asc())
        .select(videos::id)
        .into_boxed()
}

#[derive(Clone)]
pub struct PgVideoRepository {
    pool: DbPool,
}

impl PgVideoRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VideoRepository for PgVideoRepository {
    async fn create(&self, video: NewVideo) -> Result<Video> {
        let conn = &mut self.pool.get().await?;
        let now = Utc::now().naive_utc();

        let created = diesel::insert_into(videos::table)
            .values((
                videos::id.eq(video.id),
                videos::title.eq(&video.title),
                videos::storage_key.eq(&video.storage_key),
                videos::status.eq(VideoStatus::Processing),
                videos::created_at.eq(now),
                videos::updated_at.eq(now),
            ))
            .returning(Video::as_returning())
            .get_result(conn)
            .await
            .map_err(|e| {
                log::error!("Failed to insert video {}: {}", video.id, e);
                Error::from(e)
            })?;

        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Video> {
        let conn = &mut self.pool.get().await?;

        videos::table
            .find(id)
            .select(Video::as_select())
            .first(conn)
            .await
            .optional()?
            .ok_or(Error::NotFound(id))
    }

    async fn list_ready(&self) -> Result<Vec<Video>> {
        let conn = &mut self.pool.get().await?;

        let list = ready_videos()
            .select(Video::as_select())
            .load(conn)
            .await?;

        Ok(list)
    }

    async fn list_processing(&self) -> Result<Vec<Uuid>> {
        let conn = &mut self.pool.get().await?;

        let ids = processing_ids()
            .load(conn)
            .await?;

        Ok(ids)
    }

    async fn update_status(&self, id: Uuid, status: VideoStatus) -> Result<()> {
        let conn = &mut self.pool.get().await?;

        let updated = diesel::update(videos::table.find(id))
            .set((
                videos::status.eq(status),
                videos::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)
            .await?;

        if updated == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    async fn update_enrichment(
        &self,
        id: Uuid,
        thumbnail_key: Option<String>,
        duration_seconds: Option<i32>,
    ) -> Result<()> {
        let conn = &mut self.pool.get().await?;

        let changes = EnrichmentChanges {
            thumbnail_key,
            duration_seconds,
            updated_at: Utc::now().naive_utc(),
        };
        let updated = diesel::update(videos::table.find(id))
            .set(&changes)
            .execute(conn)
            .await?;

        if updated == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }
}
