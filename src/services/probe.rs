use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Duration of the media at `source_url`, truncated to whole seconds.
    async fn probe_duration(&self, source_url: &str, cancel: &CancellationToken) -> Result<u32>;
}

/// Runs `ffprobe` directly against a (presigned) URL; nothing is downloaded first.
pub struct FfprobeProbe {
    ffprobe_path: String,
}

impl FfprobeProbe {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe_duration(&self, source_url: &str, cancel: &CancellationToken) -> Result<u32> {
        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(source_url)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            output = cmd.output() => output.map_err(|e| {
                Error::Probe(format!("failed to run {}: {}", self.ffprobe_path, e))
            })?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Probe(format!(
                "ffprobe exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_duration(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parses ffprobe's bare duration token, e.g. `"120.450000\n"` -> 120.
pub fn parse_duration(raw: &str) -> Result<u32> {
    let token = raw.trim();
    let seconds: f64 = token
        .parse()
        .map_err(|_| Error::Probe(format!("invalid duration output: {:?}", token)))?;

    if !seconds.is_finite() || seconds < 0.0 || seconds > u32::MAX as f64 {
        return Err(Error::Probe(format!("duration out of range: {}", token)));
    }
    Ok(seconds.trunc() as u32)
}
