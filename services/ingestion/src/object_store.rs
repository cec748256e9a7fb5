//! Object storage abstraction for ingested archives.
//!
//! The service talks to storage only through [`ObjectStore`]. Production uses
//! the S3 implementation in [`crate::s3_store`]; [`MemoryObjectStore`] backs
//! tests and local runs without a bucket.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;

/// Streaming object body
pub type ObjectBody = BoxStream<'static, Result<Bytes, StorageError>>;

/// Errors raised by an object store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Source stream failed: {0}")]
    Source(String),

    #[error("Storage provider error: {0}")]
    Provider(String),
}

impl StorageError {
    /// True when the object is absent or hidden from us
    pub fn is_missing(&self) -> bool {
        matches!(self, StorageError::NotFound(_) | StorageError::Forbidden(_))
    }
}

/// Result of a HEAD request
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub content_type: String,
    pub content_length: u64,
    pub etag: String,
}

/// Options attached to every write
#[derive(Debug, Clone)]
pub struct PutOptions {
    /// MIME type stored with the object
    pub content_type: String,
    /// Owning user, written as the `userId` tag
    pub owner_id: String,
    /// KMS key for server-side encryption
    pub kms_key_id: Option<String>,
}

impl PutOptions {
    pub fn zip(owner_id: impl Into<String>, kms_key_id: Option<String>) -> Self {
        Self {
            content_type: ZIP_CONTENT_TYPE.to_string(),
            owner_id: owner_id.into(),
            kms_key_id,
        }
    }

    /// S3 tagging query string, `userId=<url-encoded id>`
    pub fn tagging(&self) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(self.owner_id.as_bytes()).collect();
        format!("userId={}", encoded)
    }

    /// Headers a client must echo when uploading through a presigned URL
    pub fn required_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), self.content_type.clone());
        if let Some(ref key_id) = self.kms_key_id {
            headers.insert(
                "x-amz-server-side-encryption".to_string(),
                "aws:kms".to_string(),
            );
            headers.insert(
                "x-amz-server-side-encryption-aws-kms-key-id".to_string(),
                key_id.clone(),
            );
        }
        headers
    }
}

/// Result of a completed write
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub bucket: String,
    pub key: String,
    pub etag: Option<String>,
    /// Number of parts used (1 for a single PUT)
    pub parts: usize,
}

/// Presigned request handed to a client
#[derive(Debug, Clone)]
pub struct PresignedRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub expires_in: Duration,
}

pub const ZIP_CONTENT_TYPE: &str = "application/zip";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket all keys live in
    fn bucket(&self) -> &str;

    async fn head_object(&self, key: &str) -> Result<ObjectMeta, StorageError>;

    async fn get_object(&self, key: &str) -> Result<ObjectBody, StorageError>;

    /// Write a streamed body without holding it in memory
    async fn put_stream(
        &self,
        key: &str,
        options: &PutOptions,
        body: ObjectBody,
    ) -> Result<PutOutcome, StorageError>;

    async fn presign_put(
        &self,
        key: &str,
        options: &PutOptions,
        ttl: Duration,
    ) -> Result<PresignedRequest, StorageError>;

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// Object key for an ingestion job's archive.
/// Format: ingestions/{user_id}/{job_id}.zip
pub fn ingestion_key(user_id: &str, job_id: &uuid::Uuid) -> String {
    format!(
        "ingestions/{}/{}.zip",
        sanitize_path_component(user_id),
        job_id
    )
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Stored object in [`MemoryObjectStore`]
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    pub tagging: String,
    pub kms_key_id: Option<String>,
    pub etag: String,
}

/// In-process object store
pub struct MemoryObjectStore {
    bucket: String,
    objects: RwLock<HashMap<String, StoredObject>>,
    denied: RwLock<HashSet<String>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
            denied: RwLock::new(HashSet::new()),
        }
    }

    /// Place an object directly, as a client holding a presigned URL would
    pub fn insert(&self, key: &str, data: impl Into<Bytes>, options: &PutOptions) {
        let data = data.into();
        let object = StoredObject {
            etag: etag_for(&data),
            data,
            content_type: options.content_type.clone(),
            tagging: options.tagging(),
            kms_key_id: options.kms_key_id.clone(),
        };
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), object);
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Make every request for `key` fail with access denied
    pub fn deny(&self, key: &str) {
        self.denied
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string());
    }

    fn check_access(&self, key: &str) -> Result<(), StorageError> {
        if self
            .denied
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
        {
            return Err(StorageError::Forbidden(key.to_string()));
        }
        Ok(())
    }

    fn require(&self, key: &str) -> Result<StoredObject, StorageError> {
        self.check_access(key)?;
        self.object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

fn etag_for(data: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(data));
    format!("\"{}\"", &digest[..32])
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta, StorageError> {
        let object = self.require(key)?;
        Ok(ObjectMeta {
            content_type: object.content_type,
            content_length: object.data.len() as u64,
            etag: object.etag,
        })
    }

    async fn get_object(&self, key: &str) -> Result<ObjectBody, StorageError> {
        let object = self.require(key)?;
        Ok(futures::stream::once(async move { Ok(object.data) }).boxed())
    }

    async fn put_stream(
        &self,
        key: &str,
        options: &PutOptions,
        mut body: ObjectBody,
    ) -> Result<PutOutcome, StorageError> {
        self.check_access(key)?;

        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        self.insert(key, buffer.freeze(), options);
        let etag = self.object(key).map(|o| o.etag);

        Ok(PutOutcome {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            etag,
            parts: 1,
        })
    }

    async fn presign_put(
        &self,
        key: &str,
        options: &PutOptions,
        ttl: Duration,
    ) -> Result<PresignedRequest, StorageError> {
        self.check_access(key)?;
        Ok(PresignedRequest {
            url: format!(
                "memory://{}/{}?X-Amz-Expires={}",
                self.bucket,
                key,
                ttl.as_secs()
            ),
            headers: options.required_headers(),
            expires_in: ttl,
        })
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.check_access(key)?;
        Ok(format!(
            "memory://{}/{}?X-Amz-Expires={}",
            self.bucket,
            key,
            ttl.as_secs()
        ))
    }
}
