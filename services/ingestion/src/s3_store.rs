use crate::config::S3Config;
use crate::object_store::{
    ObjectBody, ObjectMeta, ObjectStore, PresignedRequest, PutOptions, PutOutcome, StorageError,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ServerSideEncryption};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use bytes::{Bytes, BytesMut};
use futures::stream::{FuturesUnordered, StreamExt, TryStreamExt};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

/// S3-backed object store with streaming multipart uploads
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            part_size_bytes = config.part_size_bytes,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Single-part upload for bodies smaller than one part
    async fn put_single(
        &self,
        key: &str,
        options: &PutOptions,
        data: Bytes,
    ) -> Result<PutOutcome, StorageError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(&options.content_type)
            .tagging(options.tagging());

        if let Some(ref key_id) = options.kms_key_id {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(key_id);
        }

        let output = request.send().await.map_err(|e| classify(e, key))?;

        Ok(PutOutcome {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            etag: output.e_tag().map(String::from),
            parts: 1,
        })
    }

    /// Multipart upload; `first` is part 1 and `rest` yields the others
    async fn put_multipart(
        &self,
        key: &str,
        options: &PutOptions,
        first: Bytes,
        rest: PartSplitter,
    ) -> Result<PutOutcome, StorageError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&options.content_type)
            .tagging(options.tagging());

        if let Some(ref key_id) = options.kms_key_id {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(key_id);
        }

        let create_response = request.send().await.map_err(|e| classify(e, key))?;
        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::Provider("No upload ID in response".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, first, rest).await {
            Ok(parts) => {
                let part_count = parts.len();
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                let output = self
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| classify(e, key))?;

                Ok(PutOutcome {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    etag: output.e_tag().map(String::from),
                    parts: part_count,
                })
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    /// Upload parts while the body is still being read, at most `queue_size`
    /// in flight. The first error stops both reading and uploading.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Bytes,
        mut rest: PartSplitter,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let queue_size = self.config.queue_size.max(1);

        let mut in_flight = FuturesUnordered::new();
        in_flight.push(self.upload_part(key, upload_id, 1, first));

        let mut completed = Vec::new();
        let mut part_number: i32 = 2;
        let mut reading = true;

        loop {
            tokio::select! {
                part = rest.next_part(), if reading && in_flight.len() < queue_size => {
                    match part? {
                        Some(part) => {
                            in_flight.push(self.upload_part(key, upload_id, part_number, part));
                            part_number += 1;
                        }
                        None => reading = false,
                    }
                }
                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    completed.push(result?);
                }
                else => break,
            }
        }

        completed.sort_by_key(|p: &CompletedPart| p.part_number());
        Ok(completed)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        debug!(key = %key, part_number, size_bytes = data.len(), "Uploading part");

        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        Ok(CompletedPart::builder()
            .part_number(part_number)
            .e_tag(response.e_tag().unwrap_or_default())
            .build())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self))]
    async fn head_object(&self, key: &str) -> Result<ObjectMeta, StorageError> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        Ok(ObjectMeta {
            content_type: output
                .content_type()
                .unwrap_or(crate::object_store::ZIP_CONTENT_TYPE)
                .to_string(),
            content_length: output.content_length().unwrap_or(0).max(0) as u64,
            etag: output.e_tag().unwrap_or_default().to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn get_object(&self, key: &str) -> Result<ObjectBody, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        let stream = ReaderStream::new(output.body.into_async_read())
            .map_err(|e| StorageError::Provider(format!("Failed to read object body: {}", e)));

        Ok(stream.boxed())
    }

    #[instrument(skip(self, options, body))]
    async fn put_stream(
        &self,
        key: &str,
        options: &PutOptions,
        body: ObjectBody,
    ) -> Result<PutOutcome, StorageError> {
        let mut parts = PartSplitter::new(body, self.config.part_size_bytes);

        let outcome = match parts.next_part().await? {
            Some(first) if !parts.is_done() => {
                self.put_multipart(key, options, first, parts).await?
            }
            first => {
                self.put_single(key, options, first.unwrap_or_default())
                    .await?
            }
        };

        info!(
            key = %key,
            parts = outcome.parts,
            "Object uploaded successfully"
        );

        Ok(outcome)
    }

    async fn presign_put(
        &self,
        key: &str,
        options: &PutOptions,
        ttl: Duration,
    ) -> Result<PresignedRequest, StorageError> {
        let presigning_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Provider(format!("Invalid presigning config: {}", e)))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&options.content_type)
            .tagging(options.tagging());

        if let Some(ref key_id) = options.kms_key_id {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(key_id);
        }

        let presigned = request
            .presigned(presigning_config)
            .await
            .map_err(|e| classify(e, key))?;

        let mut headers = options.required_headers();
        for (name, value) in presigned.headers() {
            headers.insert(name.to_string(), value.to_string());
        }

        Ok(PresignedRequest {
            url: presigned.uri().to_string(),
            headers,
            expires_in: ttl,
        })
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let presigning_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Provider(format!("Invalid presigning config: {}", e)))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| classify(e, key))?;

        Ok(presigned.uri().to_string())
    }
}

/// Cuts an object body into parts of exactly `part_size` bytes, with a
/// shorter final part. Chunk boundaries of the body do not matter.
pub(crate) struct PartSplitter {
    body: ObjectBody,
    buffer: BytesMut,
    part_size: usize,
    exhausted: bool,
}

impl PartSplitter {
    pub(crate) fn new(body: ObjectBody, part_size: usize) -> Self {
        let part_size = part_size.max(1);
        Self {
            body,
            buffer: BytesMut::with_capacity(part_size),
            part_size,
            exhausted: false,
        }
    }

    /// Next part, or `None` once the body is drained.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub(crate) async fn next_part(&mut self) -> Result<Option<Bytes>, StorageError> {
        while !self.exhausted && self.buffer.len() < self.part_size {
            match self.body.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.exhausted = true,
            }
        }

        if self.buffer.is_empty() {
            return Ok(None);
        }

        let take = self.buffer.len().min(self.part_size);
        Ok(Some(self.buffer.split_to(take).freeze()))
    }

    /// True when the body has ended and every byte has been handed out
    pub(crate) fn is_done(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }
}

/// Map an SDK error onto the provider-neutral taxonomy
fn classify<E>(err: SdkError<E, HttpResponse>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err
        .as_service_error()
        .and_then(|e| e.code())
        .map(String::from);

    match classify_code(code.as_deref(), status) {
        Some(StorageErrorKind::NotFound) => StorageError::NotFound(key.to_string()),
        Some(StorageErrorKind::Forbidden) => StorageError::Forbidden(key.to_string()),
        None => StorageError::Provider(DisplayErrorContext(&err).to_string()),
    }
}

#[derive(Debug, PartialEq)]
enum StorageErrorKind {
    NotFound,
    Forbidden,
}

fn classify_code(code: Option<&str>, status: Option<u16>) -> Option<StorageErrorKind> {
    match code {
        Some("NoSuchKey") | Some("NotFound") | Some("NoSuchBucket") => {
            return Some(StorageErrorKind::NotFound)
        }
        Some("AccessDenied") | Some("Forbidden") => return Some(StorageErrorKind::Forbidden),
        _ => {}
    }

    match status {
        Some(404) => Some(StorageErrorKind::NotFound),
        Some(403) => Some(StorageErrorKind::Forbidden),
        _ => None,
    }
}
