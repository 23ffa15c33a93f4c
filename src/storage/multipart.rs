//! Part-wise upload of a `ByteSource`.
//!
//! Holds at most one part in memory. A source that finishes before the first
//! part is full goes out as a single object; anything larger becomes a
//! multipart upload that is aborted on the first error.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::error::Result;
use crate::services::byte_source::ByteSource;

#[async_trait]
pub trait PartSink: Send {
    /// Write the whole object in one request.
    async fn put_single(&mut self, body: Bytes) -> Result<()>;

    async fn begin(&mut self) -> Result<()>;

    /// `part_number` starts at 1.
    async fn put_part(&mut self, part_number: i32, body: Bytes) -> Result<()>;

    async fn complete(&mut self) -> Result<()>;

    /// Best effort; called after `begin` succeeded and a later step failed.
    async fn abort(&mut self);
}

/// Streams `source` into `sink`, returning the number of bytes written.
pub async fn upload_parts<S: PartSink>(
    mut source: ByteSource,
    part_size: usize,
    sink: &mut S,
) -> Result<u64> {
    let part_size = part_size.max(1);
    let mut buffer = BytesMut::with_capacity(part_size.min(64 * 1024));
    let mut total: u64 = 0;
    let mut next_part: i32 = 1;
    let mut started = false;

    while let Some(chunk) = source.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                if started {
                    sink.abort().await;
                }
                return Err(e);
            }
        };
        total += chunk.len() as u64;
        buffer.extend_from_slice(&chunk);

        while buffer.len() >= part_size {
            if !started {
                sink.begin().await?;
                started = true;
            }
            let part = buffer.split_to(part_size).freeze();
            if let Err(e) = sink.put_part(next_part, part).await {
                sink.abort().await;
                return Err(e);
            }
            next_part += 1;
        }
    }

    if !started {
        sink.put_single(buffer.freeze()).await?;
        return Ok(total);
    }

    // Trailing partial part; S3 allows the last part to be short.
    if !buffer.is_empty() {
        if let Err(e) = sink.put_part(next_part, buffer.freeze()).await {
            sink.abort().await;
            return Err(e);
        }
    }
    if let Err(e) = sink.complete().await {
        sink.abort().await;
        return Err(e);
    }

    Ok(total)
}
