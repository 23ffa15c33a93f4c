use actix_multipart::Multipart;
use actix_web::http::{header, StatusCode};
use actix_web::{web, Error, HttpResponse};
use bytes::BytesMut;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::shared::parse_error;
use crate::db::models::{Video, VideoStatus};
use crate::services::ingest::{ingest_upload, UploadedFile};
use crate::state::AppState;
use crate::storage::ObjectStore;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/videos")
            .route("", web::post().to(upload_video))
            .route("", web::get().to(list_videos))
            .route("/{id}", web::get().to(get_video))
            .route("/{id}/stream", web::get().to(stream_video)),
    );
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VideoResponse {
    pub id: Uuid,
    pub title: String,
    pub status: VideoStatus,
    pub duration_seconds: Option<i32>,
    pub thumbnail_url: Option<String>,
    pub stream_url: String,
}

impl VideoResponse {
    fn new(video: &Video, store: &dyn ObjectStore) -> Self {
        Self {
            id: video.id,
            title: video.title.clone(),
            status: video.status,
            duration_seconds: video.duration_seconds,
            thumbnail_url: video.thumbnail_key.as_deref().map(|key| store.public_url(key)),
            stream_url: store.public_url(&video.storage_key),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VideoDetail {
    #[serde(flatten)]
    pub video: Video,
    pub thumbnail_url: Option<String>,
    pub stream_url: String,
}

pub async fn upload_video(
    mut payload: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let mut upload: Option<UploadedFile> = None;

    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| parse_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.to_string()))?
    {
        let (field_name, filename) = match field.content_disposition() {
            Some(cd) => (
                cd.get_name().map(str::to_owned),
                cd.get_filename().map(str::to_owned),
            ),
            None => (None, None),
        };

        if field_name.as_deref() != Some("video") {
            // Skip unknown fields
            while field.try_next().await?.is_some() {}
            continue;
        }

        let filename = filename
            .filter(|name| !name.is_empty())
            .ok_or_else(|| parse_error(StatusCode::BAD_REQUEST, "missing_file", "No filename"))?;
        let content_type = field
            .content_type()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let mut data = BytesMut::new();
        while let Some(chunk) = field.try_next().await? {
            if data.len() + chunk.len() > state.max_file_size {
                return Err(parse_error(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "file_too_large",
                    format!("Video exceeds the {} byte limit", state.max_file_size),
                ));
            }
            data.extend_from_slice(&chunk);
        }

        upload = Some(UploadedFile {
            filename,
            content_type,
            data: data.freeze(),
        });
    }

    let upload = upload
        .filter(|file| !file.data.is_empty())
        .ok_or_else(|| {
            parse_error(StatusCode::BAD_REQUEST, "missing_file", "No video file provided")
        })?;

    let video = ingest_upload(
        state.store.as_ref(),
        state.videos.as_ref(),
        &state.queue,
        upload,
    )
    .await?;

    Ok(HttpResponse::Ok().json(VideoResponse::new(&video, state.store.as_ref())))
}

pub async fn list_videos(state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let videos = state.videos.list_ready().await?;

    let response: Vec<VideoResponse> = videos
        .iter()
        .map(|video| VideoResponse::new(video, state.store.as_ref()))
        .collect();

    Ok(HttpResponse::Ok().json(response))
}

pub async fn get_video(
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let video = state.videos.get(path.into_inner()).await?;
    let store = state.store.as_ref();

    Ok(HttpResponse::Ok().json(VideoDetail {
        thumbnail_url: video.thumbnail_key.as_deref().map(|key| store.public_url(key)),
        stream_url: store.public_url(&video.storage_key),
        video,
    }))
}

/// Redirects to a short-lived URL for the raw object.
pub async fn stream_video(
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let video = state.videos.get(path.into_inner()).await?;
    if !video.status.is_ready() {
        return Err(parse_error(
            StatusCode::NOT_FOUND,
            "not_ready",
            "Video not ready",
        ));
    }

    let url = state
        .store
        .presigned_read_url(&video.storage_key, state.playback_url_ttl)
        .await?;

    Ok(HttpResponse::Found()
        .insert_header((header::LOCATION, url))
        .finish())
}
