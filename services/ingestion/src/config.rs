use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the ingestion service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Ingestion worker configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,
    /// API configuration
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for ingested archives
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// KMS key used for server-side encryption, if any
    pub kms_key_id: Option<String>,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
    /// Part size for multipart uploads in bytes (8MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Parts in flight per multipart upload
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Ingestion worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Largest file accepted by the staged (in-memory) upload path, in MB
    #[serde(default = "default_max_stage_mb")]
    pub max_stage_mb: usize,
    /// Timeout for remote downloads in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Bearer token sent to partner download endpoints
    pub partner_api_token: Option<String>,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "ingestion-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bucket() -> String {
    "fabspace-ingestions".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_signed_url_ttl_secs() -> u64 {
    3600
}

/// S3 rejects non-final multipart parts smaller than this
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

fn default_part_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_queue_size() -> usize {
    4
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_max_stage_mb() -> usize {
    50
}

fn default_download_timeout_secs() -> u64 {
    600 // 10 minutes
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "ingestion-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/ingestion").required(false))
            .add_source(config::File::with_name("/etc/fabspace/ingestion").required(false))
            // INGESTION__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("INGESTION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.s3.validate()?;
        Ok(config)
    }

    /// Get presigned URL TTL as Duration
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.s3.signed_url_ttl_secs)
    }
}

impl S3Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.part_size_bytes >= MIN_PART_SIZE,
            "s3.part_size_bytes must be at least {} bytes, got {}",
            MIN_PART_SIZE,
            self.part_size_bytes
        );
        anyhow::ensure!(self.queue_size >= 1, "s3.queue_size must be at least 1");
        Ok(())
    }
}

impl IngestionConfig {
    /// Staged upload ceiling in bytes
    pub fn max_stage_bytes(&self) -> usize {
        self.max_stage_mb * 1024 * 1024
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_stage_mb: default_max_stage_mb(),
            download_timeout_secs: default_download_timeout_secs(),
            partner_api_token: None,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}
