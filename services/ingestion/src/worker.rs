//! Ingestion worker.
//!
//! Drives a job from `queued` (or `staged`) to a terminal state:
//!
//! ```text
//! queued ──▶ downloading ──▶ uploading ──▶ completed
//!    │            │               │
//!    └────────────┴───────────────┴──────▶ failed
//!
//! staged ──▶ uploading ──▶ completed | failed
//! ```
//!
//! Downloads are streamed: each chunk is hashed and forwarded to the object
//! store as it arrives, so memory use is bounded by the upload part size.

use crate::error::{IngestionError, Result};
use crate::job_store::{Completion, IngestionJob, JobStatus, JobStore};
use crate::object_store::{ingestion_key, ObjectStore, PutOptions, StorageError};
use crate::quick_quote::QuickQuoteHook;
use crate::tasks::spawn_detached;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Chunks buffered between the download and the uploader
const PIPE_DEPTH: usize = 16;

const ZIP_CONTENT_TYPES: [&str; 2] = ["application/zip", "application/x-zip-compressed"];

/// Worker settings taken from configuration
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub kms_key_id: Option<String>,
    pub partner_api_token: Option<String>,
    pub download_timeout: Duration,
}

/// Hash and length of the bytes that went through the pipe
#[derive(Debug, Clone, PartialEq)]
pub struct ContentDigest {
    pub sha256: String,
    pub size_bytes: u64,
}

enum PumpStop {
    Source(String),
    UploaderGone,
}

pub struct IngestionWorker {
    jobs: Arc<dyn JobStore>,
    store: Arc<dyn ObjectStore>,
    quotes: Arc<dyn QuickQuoteHook>,
    http: reqwest::Client,
    settings: WorkerSettings,
}

impl IngestionWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        store: Arc<dyn ObjectStore>,
        quotes: Arc<dyn QuickQuoteHook>,
        settings: WorkerSettings,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.download_timeout)
            .build()
            .map_err(|e| IngestionError::Download(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            jobs,
            store,
            quotes,
            http,
            settings,
        })
    }

    /// Download a job's source URL into storage.
    ///
    /// Returns the terminal status. An error means the job could not be
    /// loaded or its failure could not be recorded.
    #[instrument(skip(self))]
    pub async fn run_job(&self, job_id: Uuid) -> Result<JobStatus> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| IngestionError::NotFound(format!("Job {}", job_id)))?;

        if job.status.is_terminal() {
            debug!(job_id = %job.id, status = %job.status, "Job already finished");
            return Ok(job.status);
        }

        info!(job_id = %job.id, user_id = %job.user_id, "Starting ingestion job");
        let started = Instant::now();

        match self.download_and_store(&job).await {
            Ok(completion) => {
                info!(
                    job_id = %job.id,
                    size_bytes = completion.size_bytes,
                    sha256 = completion.sha256.as_deref().unwrap_or_default(),
                    "Ingestion job completed"
                );
                metrics::counter!("ingestion.jobs.completed").increment(1);
                metrics::histogram!("ingestion.job.duration_seconds")
                    .record(started.elapsed().as_secs_f64());

                self.quick_quote(job.user_id.clone(), job.id, job.source_url.clone());
                Ok(JobStatus::Completed)
            }
            Err(e) => {
                self.mark_failed(job.id, &e).await?;
                Ok(JobStatus::Failed)
            }
        }
    }

    /// Store an upload already held in memory. Size limits are enforced by the caller.
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub async fn handle_staged_upload(
        &self,
        job_id: Uuid,
        user_id: &str,
        data: Bytes,
        filename: &str,
    ) -> Result<JobStatus> {
        info!(job_id = %job_id, "Processing staged upload");

        match self.store_staged(job_id, user_id, data).await {
            Ok(completion) => {
                info!(
                    job_id = %job_id,
                    size_bytes = completion.size_bytes,
                    "Staged upload completed"
                );
                metrics::counter!("ingestion.jobs.completed").increment(1);

                self.quick_quote(user_id.to_string(), job_id, filename.to_string());
                Ok(JobStatus::Completed)
            }
            Err(e) => {
                self.mark_failed(job_id, &e).await?;
                Ok(JobStatus::Failed)
            }
        }
    }

    /// Create the dependent quick quotation in the background
    pub(crate) fn quick_quote(&self, user_id: String, job_id: Uuid, source: String) {
        let quotes = self.quotes.clone();
        spawn_detached("quick_quotation", async move {
            quotes
                .create_quick_quotation(&user_id, job_id, &source)
                .await
                .map(|_| debug!(job_id = %job_id, "Quick quotation created"))
        });
    }

    async fn download_and_store(&self, job: &IngestionJob) -> Result<Completion> {
        self.jobs.set_status(job.id, JobStatus::Downloading).await?;

        let response = self.open_download(&job.source_url).await?;

        self.jobs.set_status(job.id, JobStatus::Uploading).await?;

        let key = ingestion_key(&job.user_id, &job.id);
        let options = PutOptions::zip(job.user_id.clone(), self.settings.kms_key_id.clone());
        let (digest, outcome) = self
            .pipe_with_digest(response.bytes_stream(), &key, &options)
            .await?;

        let completion = Completion {
            bucket: outcome.bucket,
            key: outcome.key,
            size_bytes: digest.size_bytes as i64,
            sha256: Some(digest.sha256),
        };
        self.jobs.complete(job.id, &completion).await?;

        metrics::counter!("ingestion.bytes.uploaded").increment(digest.size_bytes);
        Ok(completion)
    }

    async fn store_staged(&self, job_id: Uuid, user_id: &str, data: Bytes) -> Result<Completion> {
        let sha256 = hex::encode(Sha256::digest(&data));
        let size_bytes = data.len() as i64;

        self.jobs.set_status(job_id, JobStatus::Uploading).await?;

        let key = ingestion_key(user_id, &job_id);
        let options = PutOptions::zip(user_id, self.settings.kms_key_id.clone());
        let body = futures::stream::once(async move { Ok(data) }).boxed();
        let outcome = self.store.put_stream(&key, &options, body).await?;

        let completion = Completion {
            bucket: outcome.bucket,
            key: outcome.key,
            size_bytes,
            sha256: Some(sha256),
        };
        self.jobs.complete(job_id, &completion).await?;

        Ok(completion)
    }

    /// GET the source and check it is a ZIP archive
    async fn open_download(&self, source_url: &str) -> Result<reqwest::Response> {
        let mut request = self.http.get(source_url);
        if let Some(ref token) = self.settings.partner_api_token {
            request = request.bearer_auth(token);
        }

        debug!(source_url = %source_url, "Downloading source");

        let response = request
            .send()
            .await
            .map_err(|e| IngestionError::Download(describe_transport_error(&e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(IngestionError::Validation(format!(
                "Failed to download source: HTTP {}",
                status.as_u16()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        if !is_zip_source(content_type.as_deref(), source_url) {
            return Err(IngestionError::Validation(format!(
                "Invalid content type: {}. Only ZIP files are supported.",
                content_type.as_deref().unwrap_or("none")
            )));
        }

        Ok(response)
    }

    /// Forward `source` to storage while hashing it chunk by chunk
    async fn pipe_with_digest<S>(
        &self,
        source: S,
        key: &str,
        options: &PutOptions,
    ) -> Result<(ContentDigest, crate::object_store::PutOutcome)>
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, StorageError>>(PIPE_DEPTH);
        let upload = self
            .store
            .put_stream(key, options, ReceiverStream::new(rx).boxed());

        let pump = async move {
            let mut source = Box::pin(source);
            let mut hasher = Sha256::new();
            let mut size_bytes: u64 = 0;

            while let Some(chunk) = source.next().await {
                match chunk {
                    Ok(chunk) => {
                        hasher.update(&chunk);
                        size_bytes += chunk.len() as u64;
                        if tx.send(Ok(chunk)).await.is_err() {
                            return Err(PumpStop::UploaderGone);
                        }
                    }
                    Err(e) => {
                        let message = describe_transport_error(&e);
                        let _ = tx.send(Err(StorageError::Source(message.clone()))).await;
                        return Err(PumpStop::Source(message));
                    }
                }
            }

            Ok(ContentDigest {
                sha256: hex::encode(hasher.finalize()),
                size_bytes,
            })
        };

        let (uploaded, pumped) = tokio::join!(upload, pump);

        match (uploaded, pumped) {
            (_, Err(PumpStop::Source(message))) => Err(IngestionError::Download(message)),
            (Err(e), _) => Err(e.into()),
            (Ok(_), Err(PumpStop::UploaderGone)) => Err(IngestionError::Storage(
                StorageError::Provider("Upload ended before the source was drained".to_string()),
            )),
            (Ok(outcome), Ok(digest)) => Ok((digest, outcome)),
        }
    }

    async fn mark_failed(&self, job_id: Uuid, error: &IngestionError) -> Result<()> {
        warn!(job_id = %job_id, error = %error, "Ingestion job failed");
        metrics::counter!("ingestion.jobs.failed").increment(1);

        self.jobs.fail(job_id, &error.public_message()).await
    }
}

/// A source is a ZIP when its content type says so or its path ends in `.zip`
pub fn is_zip_source(content_type: Option<&str>, source_url: &str) -> bool {
    let by_type = content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ZIP_CONTENT_TYPES.iter().any(|zip| ct.contains(zip))
        })
        .unwrap_or(false);

    let by_suffix = url::Url::parse(source_url)
        .map(|u| u.path().to_ascii_lowercase().ends_with(".zip"))
        .unwrap_or_else(|_| source_url.to_ascii_lowercase().ends_with(".zip"));

    by_type || by_suffix
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "Download timed out".to_string()
    } else if e.is_connect() {
        "Could not connect to source".to_string()
    } else {
        "Transfer from source failed".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::MemoryJobStore;
    use crate::object_store::MemoryObjectStore;
    use crate::quick_quote::MockQuickQuoteHook;
    use tokio::sync::mpsc::unbounded_channel;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        jobs: Arc<MemoryJobStore>,
        store: Arc<MemoryObjectStore>,
        worker: IngestionWorker,
    }

    fn harness(quotes: MockQuickQuoteHook, token: Option<&str>) -> Harness {
        let jobs = Arc::new(MemoryJobStore::new());
        let store = Arc::new(MemoryObjectStore::new("fabspace-ingestions"));
        let worker = IngestionWorker::new(
            jobs.clone(),
            store.clone(),
            Arc::new(quotes),
            WorkerSettings {
                kms_key_id: Some("kms-key-1".to_string()),
                partner_api_token: token.map(String::from),
                download_timeout: Duration::from_secs(5),
            },
        )
        .unwrap();

        Harness { jobs, store, worker }
    }

    fn quiet_quotes() -> MockQuickQuoteHook {
        let mut quotes = MockQuickQuoteHook::new();
        quotes.expect_create_quick_quotation().returning(|_, _, _| Ok(()));
        quotes
    }

    fn archive_bytes() -> Vec<u8> {
        let mut data = b"PK\x03\x04".to_vec();
        data.extend((0..10_000u32).map(|i| (i % 251) as u8));
        data
    }

    #[test]
    fn test_is_zip_source() {
        assert!(is_zip_source(Some("application/zip"), "https://x/download"));
        assert!(is_zip_source(
            Some("application/x-zip-compressed; charset=binary"),
            "https://x/file"
        ));
        assert!(is_zip_source(
            Some("application/octet-stream"),
            "https://x/design.ZIP?sig=abc"
        ));
        assert!(!is_zip_source(Some("text/html"), "https://x/index.html"));
        assert!(!is_zip_source(None, "https://x/file.zip.html"));
    }

    #[tokio::test]
    async fn test_run_job_streams_hash_and_completes() {
        let server = MockServer::start().await;
        let data = archive_bytes();
        Mock::given(method("GET"))
            .and(path("/exports/board.zip"))
            .and(header("authorization", "Bearer partner-token"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(data.clone(), "application/zip"))
            .mount(&server)
            .await;

        let (seen_tx, mut seen_rx) = unbounded_channel();
        let mut quotes = MockQuickQuoteHook::new();
        quotes
            .expect_create_quick_quotation()
            .times(1)
            .returning(move |user_id, job_id, _| {
                let _ = seen_tx.send((user_id.to_string(), job_id));
                Ok(())
            });

        let h = harness(quotes, Some("partner-token"));
        let source = format!("{}/exports/board.zip", server.uri());
        let job = h.jobs.create("42", &source, JobStatus::Queued).await.unwrap();

        let status = h.worker.run_job(job.id).await.unwrap();
        assert_eq!(status, JobStatus::Completed);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        let expected_hash = hex::encode(Sha256::digest(&data));
        assert_eq!(stored.size_bytes, Some(data.len() as i64));
        assert_eq!(stored.sha256.as_deref(), Some(expected_hash.as_str()));
        assert_eq!(stored.s3_bucket.as_deref(), Some("fabspace-ingestions"));

        let key = ingestion_key("42", &job.id);
        assert_eq!(stored.s3_key.as_deref(), Some(key.as_str()));

        let object = h.store.object(&key).unwrap();
        assert_eq!(hex::encode(Sha256::digest(&object.data)), expected_hash);
        assert_eq!(object.tagging, "userId=42");
        assert_eq!(object.kms_key_id.as_deref(), Some("kms-key-1"));

        assert_eq!(
            h.jobs.transitions(job.id),
            vec![
                JobStatus::Queued,
                JobStatus::Downloading,
                JobStatus::Uploading,
                JobStatus::Completed
            ]
        );

        let (user_id, quoted_job) = seen_rx.recv().await.unwrap();
        assert_eq!(user_id, "42");
        assert_eq!(quoted_job, job.id);
    }

    #[tokio::test]
    async fn test_non_zip_fails_before_uploading() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<html/>", "text/html"))
            .mount(&server)
            .await;

        let h = harness(MockQuickQuoteHook::new(), None);
        let source = format!("{}/landing", server.uri());
        let job = h.jobs.create("42", &source, JobStatus::Queued).await.unwrap();

        let status = h.worker.run_job(job.id).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert!(stored.error.unwrap().contains("Only ZIP files are supported"));
        assert!(!h.jobs.transitions(job.id).contains(&JobStatus::Uploading));
        assert!(h.store.object(&ingestion_key("42", &job.id)).is_none());
    }

    #[tokio::test]
    async fn test_http_error_fails_job() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let h = harness(MockQuickQuoteHook::new(), None);
        let source = format!("{}/missing.zip", server.uri());
        let job = h.jobs.create("42", &source, JobStatus::Queued).await.unwrap();

        assert_eq!(h.worker.run_job(job.id).await.unwrap(), JobStatus::Failed);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some("Failed to download source: HTTP 404"));
    }

    #[tokio::test]
    async fn test_storage_failure_is_sanitized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(archive_bytes(), "application/zip"))
            .mount(&server)
            .await;

        let h = harness(MockQuickQuoteHook::new(), None);
        let source = format!("{}/a.zip", server.uri());
        let job = h.jobs.create("42", &source, JobStatus::Queued).await.unwrap();
        h.store.deny(&ingestion_key("42", &job.id));

        assert_eq!(h.worker.run_job(job.id).await.unwrap(), JobStatus::Failed);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some("File not found"));
        assert!(stored.sha256.is_none());
    }

    #[tokio::test]
    async fn test_truncated_download_fails_job() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Promises more bytes than it sends, then hangs up
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await;

            let head = "HTTP/1.1 200 OK\r\n\
                        Content-Type: application/zip\r\n\
                        Content-Length: 100000\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&archive_bytes()[..1000]).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let h = harness(MockQuickQuoteHook::new(), None);
        let source = format!("http://{}/cut.zip", addr);
        let job = h.jobs.create("42", &source, JobStatus::Queued).await.unwrap();

        assert_eq!(h.worker.run_job(job.id).await.unwrap(), JobStatus::Failed);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error.as_deref(),
            Some("Download failed: Transfer from source failed")
        );
        assert!(stored.sha256.is_none());
        assert!(h.store.object(&ingestion_key("42", &job.id)).is_none());
    }

    #[tokio::test]
    async fn test_finished_job_is_not_rerun() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(archive_bytes(), "application/zip"))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(quiet_quotes(), None);
        let source = format!("{}/board.zip", server.uri());
        let job = h.jobs.create("42", &source, JobStatus::Queued).await.unwrap();

        assert_eq!(h.worker.run_job(job.id).await.unwrap(), JobStatus::Completed);
        let transitions = h.jobs.transitions(job.id);

        assert_eq!(h.worker.run_job(job.id).await.unwrap(), JobStatus::Completed);
        assert_eq!(h.jobs.transitions(job.id), transitions);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_job_is_reported_not_panicked() {
        let h = harness(MockQuickQuoteHook::new(), None);
        let result = h.worker.run_job(Uuid::new_v4()).await;
        assert!(matches!(result, Err(IngestionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_staged_upload_completes_with_buffer_hash() {
        let h = harness(quiet_quotes(), None);
        let data = Bytes::from(archive_bytes());
        let job = h.jobs.create("7", "board.zip", JobStatus::Staged).await.unwrap();

        let status = h
            .worker
            .handle_staged_upload(job.id, "7", data.clone(), "board.zip")
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Completed);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.sha256, Some(hex::encode(Sha256::digest(&data))));
        assert_eq!(stored.size_bytes, Some(data.len() as i64));
        assert_eq!(
            h.jobs.transitions(job.id),
            vec![JobStatus::Staged, JobStatus::Uploading, JobStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_quick_quote_failure_keeps_job_completed() {
        let (seen_tx, mut seen_rx) = unbounded_channel();
        let mut quotes = MockQuickQuoteHook::new();
        quotes.expect_create_quick_quotation().returning(move |_, _, _| {
            let _ = seen_tx.send(());
            Err(anyhow::anyhow!("quote service unavailable"))
        });

        let h = harness(quotes, None);
        let job = h.jobs.create("7", "board.zip", JobStatus::Staged).await.unwrap();
        let status = h
            .worker
            .handle_staged_upload(job.id, "7", Bytes::from_static(b"PK\x03\x04"), "board.zip")
            .await
            .unwrap();

        seen_rx.recv().await.unwrap();
        assert_eq!(status, JobStatus::Completed);
        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }
}
