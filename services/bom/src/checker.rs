//! HTTP client for the BOM checker (column detection and supplier lookups).

use crate::config::CheckerConfig;
use crate::error::{BomError, Result};
use crate::store::{ColumnMapping, NewBomRow};
use crate::supplier::Supplier;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, instrument};

/// Longest upstream error body carried into a client message
const MAX_UPSTREAM_MESSAGE: usize = 300;

/// A spreadsheet row as normalised by the checker.
///
/// Fields the service does not interpret are kept in `extra` so rows can be
/// echoed back and forwarded to the supplier streams unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckerRow {
    pub row_index: i32,
    #[serde(default)]
    pub mpns: Vec<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CheckerRow {
    /// Units per board: `quantity` when numeric, else `Quantity`, else 1
    pub fn quantity(&self) -> i32 {
        if let Some(Value::Number(n)) = self.extra.get("quantity") {
            if let Some(quantity) = whole_number(n) {
                return quantity;
            }
        }

        match self.extra.get("Quantity") {
            Some(Value::Number(n)) => whole_number(n),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .unwrap_or(1)
    }

    pub fn to_new_row(&self) -> NewBomRow {
        NewBomRow {
            row_index: self.row_index,
            mpns: self.mpns.clone(),
            manufacturer: self.manufacturer.clone(),
            quantity: self.quantity(),
            reference: self.reference.clone(),
        }
    }
}

/// Integral JSON numbers that fit an `i32`; `2.0` counts, `2.5` does not
fn whole_number(n: &serde_json::Number) -> Option<i32> {
    if let Some(q) = n.as_i64() {
        return i32::try_from(q).ok();
    }

    let q = n.as_f64()?;
    if q.is_finite() && q.fract() == 0.0 && q >= i32::MIN as f64 && q <= i32::MAX as f64 {
        Some(q as i32)
    } else {
        None
    }
}

#[derive(Debug, Deserialize)]
struct ProcessResponse {
    #[serde(default)]
    rows: Vec<CheckerRow>,
}

#[derive(Clone)]
pub struct BomCheckerClient {
    http: reqwest::Client,
    base_url: String,
    upload_path: String,
    request_timeout: Duration,
}

impl BomCheckerClient {
    pub fn new(config: &CheckerConfig) -> Result<Self> {
        // No overall timeout here: supplier streams run for minutes
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BomError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            upload_path: config.upload_path.clone(),
            request_timeout: config.request_timeout(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<Value> {
        let response = self
            .http
            .get(self.url("/health"))
            .timeout(self.request_timeout)
            .send()
            .await?;

        let response = ensure_success(response).await?;
        // Plain-text health answers are fine too
        let body = response.text().await?;
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    /// Forward a spreadsheet, returning the checker's payload
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub async fn upload(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> Result<Map<String, Value>> {
        let mut part = Part::bytes(data.to_vec()).file_name(file_name.to_string());
        if let Some(content_type) = content_type {
            part = part
                .mime_str(content_type)
                .map_err(|_| BomError::Validation(format!("Invalid content type: {}", content_type)))?;
        }

        let response = self
            .http
            .post(self.url(&self.upload_path))
            .multipart(Form::new().part("file", part))
            .timeout(self.request_timeout)
            .send()
            .await?;

        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    /// Have the checker extract rows using the chosen column mapping
    #[instrument(skip(self, columns))]
    pub async fn process_bom(
        &self,
        file_name: &str,
        columns: &[ColumnMapping],
    ) -> Result<Vec<CheckerRow>> {
        let response = self
            .http
            .post(self.url("/api/process-bom"))
            .json(&json!({ "file_name": file_name, "columns": columns }))
            .timeout(self.request_timeout)
            .send()
            .await?;

        let response = ensure_success(response).await?;
        let processed: ProcessResponse = response.json().await?;

        debug!(rows = processed.rows.len(), "BOM processed by checker");
        Ok(processed.rows)
    }

    /// Start a supplier lookup stream. Only the response head has arrived
    /// when this returns.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn open_stream(&self, supplier: Supplier, rows: &[Value]) -> Result<Response> {
        let response = self
            .http
            .post(self.url(supplier.stream_path()))
            .json(&json!({ "rows": rows }))
            .send()
            .await?;

        ensure_success(response).await
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(BomError::Upstream {
        status: status.as_u16(),
        message: upstream_message(&body, status.canonical_reason()),
    })
}

/// Prefer the `detail`/`message`/`error` field of a JSON error body
fn upstream_message(body: &str, reason: Option<&str>) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        ["detail", "message", "error"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string))
    });

    let message = from_json.unwrap_or_else(|| body.trim().to_string());
    if message.is_empty() {
        return reason.unwrap_or("BOM checker request failed").to_string();
    }
    message.chars().take(MAX_UPSTREAM_MESSAGE).collect()
}
