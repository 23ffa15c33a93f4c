//! Sequential byte source with a terminal status.
//!
//! A `ByteSource` yields `Ok(Bytes)` chunks and, when the producer failed, one
//! final `Err`. Consumers that drain the stream therefore see producer failures
//! (such as a non-zero exit of the process writing to it) in-band, after the
//! data that was produced before the failure.

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};

/// Keep at most this much of a child's stderr for error messages.
const STDERR_TAIL: usize = 2048;

pub struct ByteSource {
    inner: BoxStream<'static, Result<Bytes>>,
}

impl ByteSource {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        if data.is_empty() {
            return Self::new(stream::empty());
        }
        Self::new(stream::iter(vec![Ok(data)]))
    }

    pub fn empty() -> Self {
        Self::new(stream::empty())
    }

    /// Spawns `command` and streams its stdout.
    ///
    /// The exit status is collected once stdout hits EOF; a non-zero exit is
    /// reported through `on_failure` as the last item of the stream. Dropping the
    /// source before EOF kills the process.
    pub fn from_child<F>(mut command: Command, on_failure: F) -> Result<Self>
    where
        F: Fn(String) -> Error + Send + Sync + 'static,
    {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| on_failure(format!("failed to spawn process: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| on_failure("process stdout was not captured".to_string()))?;
        let stderr = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                let start = buf.len().saturating_sub(STDERR_TAIL);
                String::from_utf8_lossy(&buf[start..]).trim().to_string()
            })
        });

        let state = ChildState::Reading {
            stdout: ReaderStream::new(stdout),
            child,
            stderr,
        };

        let stream = stream::unfold(
            (state, on_failure),
            |(state, on_failure)| async move {
                match state {
                    ChildState::Reading {
                        mut stdout,
                        mut child,
                        stderr,
                    } => match stdout.next().await {
                        Some(Ok(chunk)) => Some((
                            Ok(chunk),
                            (
                                ChildState::Reading {
                                    stdout,
                                    child,
                                    stderr,
                                },
                                on_failure,
                            ),
                        )),
                        Some(Err(e)) => {
                            let _ = child.kill().await;
                            Some((
                                Err(on_failure(format!("failed to read process output: {}", e))),
                                (ChildState::Done, on_failure),
                            ))
                        }
                        None => {
                            drop(stdout);
                            match finish(child, stderr).await {
                                Ok(()) => None,
                                Err(message) => {
                                    Some((Err(on_failure(message)), (ChildState::Done, on_failure)))
                                }
                            }
                        }
                    },
                    ChildState::Done => None,
                }
            },
        );

        Ok(Self::new(stream))
    }

    /// Turns a stream that ends without yielding any bytes into a failure.
    pub fn require_non_empty<F>(self, on_empty: F) -> Self
    where
        F: FnOnce() -> Error + Send + 'static,
    {
        let mut produced = 0usize;
        let mut on_empty = Some(on_empty);
        let marker = stream::once(async { None });
        let tagged = self.inner.map(Some).chain(marker);

        Self::new(tagged.filter_map(move |item| {
            let out = match item {
                Some(Ok(chunk)) => {
                    produced += chunk.len();
                    Some(Ok(chunk))
                }
                Some(Err(e)) => {
                    // The producer already failed; don't stack a second error.
                    on_empty = None;
                    Some(Err(e))
                }
                None if produced == 0 => on_empty.take().map(|f| Err(f())),
                None => None,
            };
            futures::future::ready(out)
        }))
    }

    /// Drains the whole source into memory. Meant for small payloads and tests.
    pub async fn collect_bytes(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl Stream for ByteSource {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

enum ChildState {
    Reading {
        stdout: ReaderStream<ChildStdout>,
        child: Child,
        stderr: Option<JoinHandle<String>>,
    },
    Done,
}

async fn finish(
    mut child: Child,
    stderr: Option<JoinHandle<String>>,
) -> std::result::Result<(), String> {
    let status = child
        .wait()
        .await
        .map_err(|e| format!("failed to wait for process: {}", e))?;
    if status.success() {
        return Ok(());
    }

    let stderr = match stderr {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    if stderr.is_empty() {
        Err(format!("process exited with {}", status))
    } else {
        Err(format!("process exited with {}: {}", status, stderr))
    }
}
