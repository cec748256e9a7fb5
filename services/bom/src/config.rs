use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the BOM service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// BOM checker connection
    pub checker: CheckerConfig,
    /// API configuration
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// External BOM checker (column detection and supplier lookups)
#[derive(Debug, Clone, Deserialize)]
pub struct CheckerConfig {
    /// Base URL, e.g. http://bom-checker:5000
    pub base_url: String,
    /// Path the spreadsheet upload is forwarded to
    #[serde(default = "default_upload_path")]
    pub upload_path: String,
    /// Timeout for plain request/response calls in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Idle limit between chunks of a supplier stream in seconds
    #[serde(default = "default_stream_idle_secs")]
    pub stream_idle_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Largest spreadsheet accepted by /bom/upload, in MB
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

fn default_service_name() -> String {
    "bom-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9091
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

fn default_run_migrations() -> bool {
    true
}

fn default_upload_path() -> String {
    "/api/upload".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_stream_idle_secs() -> u64 {
    300
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8081
}

fn default_true() -> bool {
    true
}

fn default_max_upload_mb() -> usize {
    20
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "bom-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9091)?
            .add_source(config::File::with_name("config/bom").required(false))
            .add_source(config::File::with_name("/etc/fabspace/bom").required(false))
            // BOM__CHECKER__BASE_URL -> checker.base_url
            .add_source(
                config::Environment::with_prefix("BOM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl CheckerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle(&self) -> Duration {
        Duration::from_secs(self.stream_idle_secs)
    }
}

impl ApiConfig {
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checker_defaults() {
        let checker: CheckerConfig =
            serde_json::from_value(serde_json::json!({ "base_url": "http://checker:5000" }))
                .unwrap();
        assert_eq!(checker.upload_path, "/api/upload");
        assert_eq!(checker.request_timeout(), Duration::from_secs(120));
        assert_eq!(checker.stream_idle(), Duration::from_secs(300));
    }

    #[test]
    fn test_upload_limit() {
        let api: ApiConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(api.port, 8081);
        assert_eq!(api.max_upload_bytes(), 20 * 1024 * 1024);
    }
}
