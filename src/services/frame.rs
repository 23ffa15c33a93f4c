use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

use super::byte_source::ByteSource;
use crate::error::{Error, Result};

#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// One still frame taken `at` into the video, streamed as JPEG bytes.
    ///
    /// Failures of the underlying tool after streaming started arrive as the
    /// last item of the returned source.
    async fn extract_frame(&self, source_url: &str, at: Duration) -> Result<ByteSource>;
}

pub struct FfmpegFrameExtractor {
    ffmpeg_path: String,
}

impl FfmpegFrameExtractor {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn extract_frame(&self, source_url: &str, at: Duration) -> Result<ByteSource> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.arg("-v")
            .arg("error")
            // Seek before -i so ffmpeg jumps straight to the nearest keyframe.
            .arg("-ss")
            .arg(format_timestamp(at))
            .arg("-i")
            .arg(source_url)
            .arg("-vframes")
            .arg("1")
            .arg("-f")
            .arg("image2pipe")
            .arg("-vcodec")
            .arg("mjpeg")
            .arg("pipe:1");

        let source = ByteSource::from_child(cmd, |msg| Error::Extraction(format!("ffmpeg: {}", msg)))?;

        Ok(source.require_non_empty(move || {
            Error::Extraction(format!("ffmpeg produced no frame at {}", format_timestamp(at)))
        }))
    }
}

/// `HH:MM:SS.mmm`, the form ffmpeg's `-ss` accepts.
pub fn format_timestamp(at: Duration) -> String {
    let total = at.as_secs();
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        total / 3600,
        (total / 60) % 60,
        total % 60,
        at.subsec_millis()
    )
}
