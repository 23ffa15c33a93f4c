use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::multipart::{upload_parts, PartSink};
use super::{namespaced_key, ObjectStore};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::services::byte_source::ByteSource;

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    region: String,
    key_prefix: String,
    public_base: Option<String>,
    part_size: usize,
}

impl S3ObjectStore {
    /// Builds the client and makes sure the bucket exists.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let store = Self::new(config);
        store.ensure_bucket_exists().await?;
        Ok(store)
    }

    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "video-ingest",
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            key_prefix: config.key_prefix.clone(),
            public_base: config
                .public_url
                .clone()
                .or_else(|| config.endpoint.clone())
                .map(|base| base.trim_end_matches('/').to_string()),
            part_size: config.part_size,
        }
    }

    pub async fn ensure_bucket_exists(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(e) if e.as_service_error().map(|se| se.is_not_found()) == Some(true) => {}
            Err(e) => {
                // Some providers answer 403 or a bare status for a missing
                // bucket; creation below settles it either way.
                log::warn!(
                    "HeadBucket {} failed, attempting create: {}",
                    self.bucket,
                    DisplayErrorContext(&e)
                );
            }
        }

        log::info!("Bucket {} does not exist, creating it", self.bucket);
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error().map(|se| {
                    se.is_bucket_already_owned_by_you() || se.is_bucket_already_exists()
                }) == Some(true) =>
            {
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to create bucket {}: {}", self.bucket, DisplayErrorContext(&e));
                Err(Error::StorageWrite(format!(
                    "failed to create bucket {}: {}",
                    self.bucket,
                    DisplayErrorContext(&e)
                )))
            }
        }
    }

    fn full_key(&self, key: &str) -> String {
        namespaced_key(&self.key_prefix, key)
    }

    fn part_sink<'a>(&'a self, key: &'a str, content_type: &'a str) -> S3PartSink<'a> {
        S3PartSink {
            client: &self.client,
            bucket: &self.bucket,
            key,
            content_type,
            upload_id: None,
            parts: Vec::new(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<String> {
        let key = self.full_key(key);
        let size = data.len();
        let start = Instant::now();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                log::error!("S3 upload of {} failed: {}", key, DisplayErrorContext(&e));
                Error::StorageWrite(format!("put {}: {}", key, DisplayErrorContext(&e)))
            })?;

        log::info!(
            "Stored {} ({} bytes) in {:.2?}",
            key,
            size,
            start.elapsed()
        );
        Ok(key)
    }

    async fn put_streamed(
        &self,
        key: &str,
        content_type: &str,
        source: ByteSource,
    ) -> Result<String> {
        let key = self.full_key(key);
        let start = Instant::now();
        let size = {
            let mut sink = self.part_sink(&key, content_type);
            upload_parts(source, self.part_size, &mut sink).await?
        };

        log::info!(
            "Streamed {} ({} bytes) in {:.2?}",
            key,
            size,
            start.elapsed()
        );
        Ok(key)
    }

    async fn presigned_read_url(&self, key: &str, ttl: Duration) -> Result<String> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => {}
            Err(e) if e.as_service_error().map(|se| se.is_not_found()) == Some(true) => {
                return Err(Error::StorageRead(format!("object {} does not exist", key)));
            }
            Err(e) => {
                return Err(Error::StorageRead(format!(
                    "head {}: {}",
                    key,
                    DisplayErrorContext(&e)
                )));
            }
        }

        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| Error::StorageRead(format!("invalid presign ttl: {}", e)))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| {
                Error::StorageRead(format!("presign {}: {}", key, DisplayErrorContext(&e)))
            })?;

        Ok(request.uri().to_string())
    }

    fn public_url(&self, key: &str) -> String {
        match &self.public_base {
            Some(base) => format!("{}/{}/{}", base, self.bucket, key),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        }
    }
}

struct S3PartSink<'a> {
    client: &'a Client,
    bucket: &'a str,
    key: &'a str,
    content_type: &'a str,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
}

impl<'a> S3PartSink<'a> {
    fn upload_id(&self) -> Result<&str> {
        self.upload_id
            .as_deref()
            .ok_or_else(|| Error::StorageWrite("multipart upload was not started".to_string()))
    }

    /// Aborts a still-open upload in the background. `None` when nothing is
    /// open or there is no runtime to run the request on.
    fn detach_abort(&mut self) -> Option<JoinHandle<()>> {
        let upload_id = self.upload_id.take()?;
        let runtime = Handle::try_current().ok()?;
        let request = self
            .client
            .abort_multipart_upload()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(upload_id);
        let key = self.key.to_string();

        Some(runtime.spawn(async move {
            if let Err(e) = request.send().await {
                log::warn!(
                    "Failed to abort abandoned multipart upload of {}: {}",
                    key,
                    DisplayErrorContext(&e)
                );
            }
        }))
    }
}

// A deadline or shutdown drops `put_streamed` mid-upload; don't leave the parts behind.
impl Drop for S3PartSink<'_> {
    fn drop(&mut self) {
        if self.detach_abort().is_some() {
            log::warn!("Multipart upload of {} abandoned, aborting", self.key);
        }
    }
}

#[async_trait]
impl<'a> PartSink for S3PartSink<'a> {
    async fn put_single(&mut self, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(self.bucket)
            .key(self.key)
            .content_type(self.content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                Error::StorageWrite(format!("put {}: {}", self.key, DisplayErrorContext(&e)))
            })?;
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket)
            .key(self.key)
            .content_type(self.content_type)
            .send()
            .await
            .map_err(|e| {
                Error::StorageWrite(format!(
                    "create multipart {}: {}",
                    self.key,
                    DisplayErrorContext(&e)
                ))
            })?;

        let upload_id = output.upload_id().ok_or_else(|| {
            Error::StorageWrite(format!("no upload id returned for {}", self.key))
        })?;
        self.upload_id = Some(upload_id.to_string());
        Ok(())
    }

    async fn put_part(&mut self, part_number: i32, body: Bytes) -> Result<()> {
        let upload_id = self.upload_id()?.to_string();
        let output = self
            .client
            .upload_part()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                Error::StorageWrite(format!(
                    "upload part {} of {}: {}",
                    part_number,
                    self.key,
                    DisplayErrorContext(&e)
                ))
            })?;

        self.parts.push(
            CompletedPart::builder()
                .set_e_tag(output.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        let upload_id = self.upload_id()?.to_string();
        let parts = std::mem::take(&mut self.parts);

        self.client
            .complete_multipart_upload()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                Error::StorageWrite(format!(
                    "complete multipart {}: {}",
                    self.key,
                    DisplayErrorContext(&e)
                ))
            })?;
        self.upload_id = None;
        Ok(())
    }

    async fn abort(&mut self) {
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(upload_id)
            .send()
            .await
        {
            log::warn!(
                "Failed to abort multipart upload of {}: {}",
                self.key,
                DisplayErrorContext(&e)
            );
        }
    }
}
