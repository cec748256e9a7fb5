//! Request-level ingestion operations.
//!
//! Every call is scoped to the authenticated user: a job owned by someone
//! else is reported exactly like a missing one.

use crate::auth::AuthUser;
use crate::error::{IngestionError, Result};
use crate::job_store::{Completion, IngestionJob, JobStatus, JobStore};
use crate::object_store::{ingestion_key, ObjectBody, ObjectStore, PutOptions};
use crate::tasks::spawn_detached;
use crate::worker::{is_zip_source, IngestionWorker};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_RECENT_LIMIT: i64 = 20;
const MAX_RECENT_LIMIT: i64 = 100;
const DIRECT_UPLOAD_NAME: &str = "direct-upload";

/// Start an ingestion from a remote URL
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartIngestionRequest {
    pub source_url: String,
}

impl StartIngestionRequest {
    pub fn validate(&self) -> Result<()> {
        let source_url = self.source_url.trim();
        if source_url.is_empty() {
            return Err(IngestionError::Validation("sourceUrl is required".to_string()));
        }

        match url::Url::parse(source_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => Ok(()),
            _ => Err(IngestionError::Validation(
                "sourceUrl must be a valid URL".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadUrlRequest {
    /// Original filename, kept for display
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfirmUploadRequest {
    /// ETag the client received from storage
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlResponse {
    pub job_id: Uuid,
    pub upload_url: String,
    pub s3_key: String,
    /// Seconds until the URL expires
    pub expires_in: u64,
    /// Headers the client must send with the PUT
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentFile {
    pub job_id: Uuid,
    pub key: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: Option<i64>,
    pub sha256: Option<String>,
    /// Presigned GET URL; absent when signing failed
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub source_url: String,
    pub size_bytes: Option<i64>,
    pub sha256: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<IngestionJob> for JobView {
    fn from(job: IngestionJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            source_url: job.source_url,
            size_bytes: job.size_bytes,
            sha256: job.sha256,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// A stored archive ready to be streamed to the client
pub struct FileDownload {
    pub filename: String,
    pub content_type: String,
    pub content_length: u64,
    pub etag: String,
    pub body: ObjectBody,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub kms_key_id: Option<String>,
    pub signed_url_ttl: Duration,
    pub max_stage_mb: usize,
}

impl ServiceSettings {
    fn max_stage_bytes(&self) -> usize {
        self.max_stage_mb * 1024 * 1024
    }
}

pub struct IngestionService {
    jobs: Arc<dyn JobStore>,
    store: Arc<dyn ObjectStore>,
    worker: Arc<IngestionWorker>,
    settings: ServiceSettings,
}

impl IngestionService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        store: Arc<dyn ObjectStore>,
        worker: Arc<IngestionWorker>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            jobs,
            store,
            worker,
            settings,
        }
    }

    pub fn max_stage_bytes(&self) -> usize {
        self.settings.max_stage_bytes()
    }

    /// Readiness of the backing job store
    pub async fn ping(&self) -> Result<()> {
        self.jobs.ping().await
    }

    /// Queue a remote download. The worker runs in the background.
    #[instrument(skip(self, request), fields(user_id = %user.user_id))]
    pub async fn start_ingestion(
        &self,
        user: &AuthUser,
        request: StartIngestionRequest,
    ) -> Result<JobAccepted> {
        request.validate()?;

        let job = self
            .jobs
            .create(&user.user_id, request.source_url.trim(), JobStatus::Queued)
            .await?;

        info!(job_id = %job.id, "Ingestion job queued");

        let worker = self.worker.clone();
        let job_id = job.id;
        spawn_detached("run_job", async move { worker.run_job(job_id).await.map(|_| ()) });

        Ok(JobAccepted {
            job_id: job.id,
            status: job.status,
        })
    }

    /// Accept a small upload held in memory
    #[instrument(skip(self, data), fields(user_id = %user.user_id, size_bytes = data.len()))]
    pub async fn stage_upload(
        &self,
        user: &AuthUser,
        filename: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> Result<JobAccepted> {
        if !is_zip_source(content_type, filename) {
            return Err(IngestionError::Validation(
                "Only ZIP files are supported".to_string(),
            ));
        }

        if data.len() > self.settings.max_stage_bytes() {
            return Err(IngestionError::PayloadTooLarge {
                max_mb: self.settings.max_stage_mb,
            });
        }

        let job = self
            .jobs
            .create(&user.user_id, filename, JobStatus::Staged)
            .await?;

        let worker = self.worker.clone();
        let job_id = job.id;
        let user_id = user.user_id.clone();
        let filename = filename.to_string();
        spawn_detached("staged_upload", async move {
            worker
                .handle_staged_upload(job_id, &user_id, data, &filename)
                .await
                .map(|_| ())
        });

        Ok(JobAccepted {
            job_id,
            status: JobStatus::Staged,
        })
    }

    /// Hand the client a presigned PUT for a direct upload
    #[instrument(skip(self, request), fields(user_id = %user.user_id))]
    pub async fn generate_upload_url(
        &self,
        user: &AuthUser,
        request: UploadUrlRequest,
    ) -> Result<UploadUrlResponse> {
        let source = request
            .filename
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DIRECT_UPLOAD_NAME);

        let job = self
            .jobs
            .create(&user.user_id, source, JobStatus::AwaitingUpload)
            .await?;

        let key = ingestion_key(&user.user_id, &job.id);
        let options = PutOptions::zip(user.user_id.clone(), self.settings.kms_key_id.clone());

        let presigned = match self
            .store
            .presign_put(&key, &options, self.settings.signed_url_ttl)
            .await
        {
            Ok(presigned) => presigned,
            Err(e) => {
                let error = IngestionError::from(e);
                self.jobs.fail(job.id, &error.public_message()).await?;
                return Err(error);
            }
        };

        info!(job_id = %job.id, "Generated upload URL");

        Ok(UploadUrlResponse {
            job_id: job.id,
            upload_url: presigned.url,
            s3_key: key,
            expires_in: presigned.expires_in.as_secs(),
            fields: presigned.headers,
        })
    }

    /// Record a direct upload once the client reports it finished
    #[instrument(skip(self, request), fields(user_id = %user.user_id))]
    pub async fn confirm_upload(
        &self,
        user: &AuthUser,
        job_id: Uuid,
        request: ConfirmUploadRequest,
    ) -> Result<JobAccepted> {
        let job = self.owned_job(user, job_id).await?;

        if job.status != JobStatus::AwaitingUpload {
            return Err(IngestionError::Conflict(format!(
                "Job {} is not awaiting upload (status: {})",
                job_id, job.status
            )));
        }

        let key = ingestion_key(&user.user_id, &job_id);
        let meta = match self.store.head_object(&key).await {
            Ok(meta) => meta,
            Err(e) if e.is_missing() => {
                self.jobs
                    .fail(job_id, "File not found in S3 after upload")
                    .await?;
                return Err(IngestionError::Storage(e));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(ref etag) = request.etag {
            if etag.trim_matches('"') != meta.etag.trim_matches('"') {
                warn!(job_id = %job_id, "Client ETag does not match stored object");
            }
        }

        // No hash for direct uploads: the bytes never pass through us
        self.jobs
            .complete(
                job_id,
                &Completion {
                    bucket: self.store.bucket().to_string(),
                    key,
                    size_bytes: meta.content_length as i64,
                    sha256: None,
                },
            )
            .await?;

        info!(job_id = %job_id, size_bytes = meta.content_length, "Upload confirmed");
        metrics::counter!("ingestion.jobs.completed").increment(1);

        self.worker
            .quick_quote(user.user_id.clone(), job_id, job.source_url);

        Ok(JobAccepted {
            job_id,
            status: JobStatus::Completed,
        })
    }

    /// Newest completed files with presigned download URLs
    #[instrument(skip(self), fields(user_id = %user.user_id))]
    pub async fn recent_files(&self, user: &AuthUser, limit: Option<i64>) -> Result<Vec<RecentFile>> {
        let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT);
        if !(1..=MAX_RECENT_LIMIT).contains(&limit) {
            return Err(IngestionError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_RECENT_LIMIT
            )));
        }

        let jobs = self.jobs.recent_completed(&user.user_id, limit).await?;
        let mut files = Vec::with_capacity(jobs.len());

        for job in jobs {
            let Some(key) = job.s3_key.clone() else {
                continue;
            };

            let url = match self.store.presign_get(&key, self.settings.signed_url_ttl).await {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to presign download");
                    None
                }
            };

            files.push(RecentFile {
                job_id: job.id,
                key,
                filename: job.source_url,
                created_at: job.created_at,
                size_bytes: job.size_bytes,
                sha256: job.sha256,
                url,
            });
        }

        Ok(files)
    }

    /// A completed, owned job that has a stored object
    pub async fn file_by_id(&self, user: &AuthUser, job_id: Uuid) -> Result<IngestionJob> {
        let job = self.owned_job(user, job_id).await?;

        if job.status != JobStatus::Completed {
            return Err(IngestionError::NotFound(format!(
                "File for job {} (status: {})",
                job_id, job.status
            )));
        }
        if job.s3_key.is_none() {
            return Err(IngestionError::NotFound(format!("File for job {}", job_id)));
        }

        Ok(job)
    }

    #[instrument(skip(self), fields(user_id = %user.user_id))]
    pub async fn download(&self, user: &AuthUser, job_id: Uuid) -> Result<FileDownload> {
        let job = self.file_by_id(user, job_id).await?;
        let key = job
            .s3_key
            .ok_or_else(|| IngestionError::NotFound(format!("File for job {}", job_id)))?;

        let meta = self.store.head_object(&key).await?;
        let body = self.store.get_object(&key).await?;

        Ok(FileDownload {
            filename: format!("{}.zip", job_id),
            content_type: meta.content_type,
            content_length: meta.content_length,
            etag: meta.etag,
            body,
        })
    }

    pub async fn job_status(&self, user: &AuthUser, job_id: Uuid) -> Result<JobView> {
        self.owned_job(user, job_id).await.map(JobView::from)
    }

    async fn owned_job(&self, user: &AuthUser, job_id: Uuid) -> Result<IngestionJob> {
        self.jobs
            .get(job_id)
            .await?
            .filter(|job| job.user_id == user.user_id)
            .ok_or_else(|| IngestionError::NotFound(format!("Job {}", job_id)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::UserRole;
    use crate::job_store::MemoryJobStore;
    use crate::object_store::{MemoryObjectStore, StorageError};
    use crate::quick_quote::NoopQuickQuotes;
    use crate::worker::WorkerSettings;
    use futures::StreamExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) struct Fixture {
        pub jobs: Arc<MemoryJobStore>,
        pub store: Arc<MemoryObjectStore>,
        pub service: Arc<IngestionService>,
    }

    pub(crate) fn fixture() -> Fixture {
        let jobs = Arc::new(MemoryJobStore::new());
        let store = Arc::new(MemoryObjectStore::new("fabspace-ingestions"));
        let worker = IngestionWorker::new(
            jobs.clone(),
            store.clone(),
            Arc::new(NoopQuickQuotes),
            WorkerSettings {
                kms_key_id: None,
                partner_api_token: None,
                download_timeout: Duration::from_secs(5),
            },
        )
        .unwrap();

        let service = Arc::new(IngestionService::new(
            jobs.clone(),
            store.clone(),
            Arc::new(worker),
            ServiceSettings {
                kms_key_id: None,
                signed_url_ttl: Duration::from_secs(3600),
                max_stage_mb: 1,
            },
        ));

        Fixture {
            jobs,
            store,
            service,
        }
    }

    pub(crate) fn user(id: &str) -> AuthUser {
        AuthUser {
            user_id: id.to_string(),
            role: UserRole::Pm,
        }
    }

    pub(crate) async fn wait_for_terminal(jobs: &MemoryJobStore, id: Uuid) -> IngestionJob {
        for _ in 0..200 {
            let job = jobs.get(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached a terminal state", id);
    }

    #[test]
    fn test_start_request_validation() {
        let ok = StartIngestionRequest {
            source_url: "https://partner.example.com/files/board.zip".to_string(),
        };
        assert!(ok.validate().is_ok());

        for bad in ["", "   ", "not a url", "ftp://host/file.zip", "file:///etc/passwd"] {
            let request = StartIngestionRequest {
                source_url: bad.to_string(),
            };
            assert!(request.validate().is_err(), "{} should be rejected", bad);
        }
    }

    #[tokio::test]
    async fn test_start_ingestion_runs_in_background() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(b"PK\x03\x04zip".to_vec(), "application/zip"))
            .mount(&server)
            .await;

        let f = fixture();
        let accepted = f
            .service
            .start_ingestion(
                &user("42"),
                StartIngestionRequest {
                    source_url: format!("{}/board.zip", server.uri()),
                },
            )
            .await
            .unwrap();
        assert_eq!(accepted.status, JobStatus::Queued);

        let job = wait_for_terminal(&f.jobs, accepted.job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.size_bytes, Some(7));
    }

    #[tokio::test]
    async fn test_stage_upload_rejects_before_creating_job() {
        let f = fixture();

        let err = f
            .service
            .stage_upload(&user("1"), "notes.txt", Some("text/plain"), Bytes::from_static(b"hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Validation(_)));

        let too_big = Bytes::from(vec![0u8; 1024 * 1024 + 1]);
        let err = f
            .service
            .stage_upload(&user("1"), "big.zip", Some("application/zip"), too_big)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::PayloadTooLarge { max_mb: 1 }));

        assert!(f.jobs.recent_completed("1", 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stage_upload_completes() {
        let f = fixture();
        let accepted = f
            .service
            .stage_upload(
                &user("1"),
                "board.zip",
                Some("application/octet-stream"),
                Bytes::from_static(b"PK\x03\x04"),
            )
            .await
            .unwrap();
        assert_eq!(accepted.status, JobStatus::Staged);

        let job = wait_for_terminal(&f.jobs, accepted.job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.source_url, "board.zip");
    }

    #[tokio::test]
    async fn test_direct_upload_confirm_flow() {
        let f = fixture();
        let pm = user("1");

        let response = f
            .service
            .generate_upload_url(&pm, UploadUrlRequest { filename: Some("board.zip".into()) })
            .await
            .unwrap();
        assert_eq!(response.expires_in, 3600);
        assert_eq!(response.fields["Content-Type"], "application/zip");
        assert_eq!(response.s3_key, ingestion_key("1", &response.job_id));

        // Confirming before the object exists fails the job
        let early = f
            .service
            .generate_upload_url(&pm, UploadUrlRequest::default())
            .await
            .unwrap();
        let err = f
            .service
            .confirm_upload(&pm, early.job_id, ConfirmUploadRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Storage(StorageError::NotFound(_))));
        let failed = f.jobs.get(early.job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("File not found in S3 after upload"));
        assert_eq!(failed.source_url, DIRECT_UPLOAD_NAME);

        f.store.insert(
            &response.s3_key,
            Bytes::from_static(b"PK\x03\x04data"),
            &PutOptions::zip("1", None),
        );
        let confirmed = f
            .service
            .confirm_upload(&pm, response.job_id, ConfirmUploadRequest { etag: None })
            .await
            .unwrap();
        assert_eq!(confirmed.status, JobStatus::Completed);

        let job = f.jobs.get(response.job_id).await.unwrap().unwrap();
        assert_eq!(job.size_bytes, Some(8));
        assert!(job.sha256.is_none());

        // A second confirm is a state conflict
        let err = f
            .service
            .confirm_upload(&pm, response.job_id, ConfirmUploadRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_jobs_are_scoped_to_owner() {
        let f = fixture();
        let response = f
            .service
            .generate_upload_url(&user("1"), UploadUrlRequest::default())
            .await
            .unwrap();

        let err = f
            .service
            .confirm_upload(&user("2"), response.job_id, ConfirmUploadRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::NotFound(_)));

        assert!(f.service.job_status(&user("2"), response.job_id).await.is_err());
        let view = f.service.job_status(&user("1"), response.job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::AwaitingUpload);
    }

    #[tokio::test]
    async fn test_recent_files_and_download() {
        let f = fixture();
        let pm = user("1");

        assert!(f.service.recent_files(&pm, Some(0)).await.is_err());
        assert!(f.service.recent_files(&pm, Some(101)).await.is_err());

        let accepted = f
            .service
            .stage_upload(&pm, "board.zip", Some("application/zip"), Bytes::from_static(b"PK\x03\x04"))
            .await
            .unwrap();
        wait_for_terminal(&f.jobs, accepted.job_id).await;

        let files = f.service.recent_files(&pm, None).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "board.zip");
        assert!(files[0].url.as_deref().unwrap().starts_with("memory://"));

        let download = f.service.download(&pm, accepted.job_id).await.unwrap();
        assert_eq!(download.filename, format!("{}.zip", accepted.job_id));
        assert_eq!(download.content_length, 4);
        let chunks: Vec<_> = download.body.collect().await;
        assert_eq!(chunks.len(), 1);

        assert!(f.service.download(&user("2"), accepted.job_id).await.is_err());
    }
}
