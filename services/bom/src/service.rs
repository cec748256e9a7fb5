//! BOM operations behind the HTTP API.

use crate::auth::AuthUser;
use crate::checker::{BomCheckerClient, CheckerRow};
use crate::error::{BomError, Result};
use crate::refresher::MetricsRefresher;
use crate::store::{BomStore, BomUpload, ColumnMapping, LookupDetail, UploadSettings};
use crate::streaming::{StreamReport, SupplierStreamer};
use crate::supplier::Supplier;
use bytes::Bytes;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, instrument};

/// PATCH /bom/process body
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessBomRequest {
    pub upload_id: i64,
    /// Comma-separated board quantities, e.g. "1,5,10"
    pub build_quantities: String,
    pub columns: Vec<ColumnMapping>,
    #[serde(default)]
    pub build_date: Option<NaiveDate>,
}

impl ProcessBomRequest {
    pub fn validate(&self) -> Result<()> {
        if self.upload_id <= 0 {
            return Err(BomError::Validation("Invalid uploadId".to_string()));
        }
        if self.columns.is_empty() {
            return Err(BomError::Validation("columns must not be empty".to_string()));
        }
        Ok(())
    }
}

/// PATCH /bom/quantity body
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddQuantityRequest {
    pub upload_id: i64,
    pub quantity: i64,
}

/// Positive, unique and ascending. Anything else in the list is ignored.
pub fn parse_quantities(raw: &str) -> Vec<i32> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<i32>().ok())
        .filter(|quantity| *quantity > 0)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardRow {
    pub name: Option<String>,
    pub reference: Option<String>,
    pub quantity: i64,
    pub unit_price: Option<f64>,
    pub total_price: Option<f64>,
    pub back_order: i64,
    pub lead_time: Option<String>,
    pub moq: Option<i64>,
}

impl DashboardRow {
    /// Price `detail` for `build_quantity` boards.
    ///
    /// The unit price is the break at or below the number of boards, not
    /// the total number of parts.
    fn price(detail: &LookupDetail, build_quantity: i32) -> Self {
        let quantity = i64::from(detail.row_quantity) * i64::from(build_quantity);
        let unit_price = u64::try_from(build_quantity)
            .ok()
            .and_then(|q| detail.price_breaks.unit_price_at(q));
        let available = detail.quantity_available.unwrap_or(0);
        let response = detail.response.as_ref();

        Self {
            name: detail.mpns.first().cloned(),
            reference: detail.reference.clone(),
            quantity,
            unit_price,
            total_price: unit_price.map(|price| price * quantity as f64),
            back_order: (quantity - available).max(0),
            lead_time: response.and_then(|r| text_field(r, "lead_time_weeks")),
            moq: response.and_then(|r| integer_field(r, "minimum_order_quantity")),
        }
    }
}

fn text_field(response: &Value, key: &str) -> Option<String> {
    match response.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn integer_field(response: &Value, key: &str) -> Option<i64> {
    match response.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplierPanel {
    pub found: i64,
    pub not_found: i64,
    pub back_order: i64,
    pub obsolete: i64,
    pub rows: Vec<DashboardRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub digikey: SupplierPanel,
    pub mouser: SupplierPanel,
}

impl DashboardSummary {
    fn panel_mut(&mut self, supplier: Supplier) -> &mut SupplierPanel {
        match supplier {
            Supplier::Digikey => &mut self.digikey,
            Supplier::Mouser => &mut self.mouser,
        }
    }
}

pub struct BomService {
    store: Arc<dyn BomStore>,
    checker: BomCheckerClient,
    refresher: Arc<MetricsRefresher>,
    streamer: SupplierStreamer,
}

impl BomService {
    pub fn new(
        store: Arc<dyn BomStore>,
        checker: BomCheckerClient,
        refresher: Arc<MetricsRefresher>,
        stream_idle: Duration,
    ) -> Self {
        let streamer = SupplierStreamer::new(
            checker.clone(),
            store.clone(),
            refresher.clone(),
            stream_idle,
        );

        Self {
            store,
            checker,
            refresher,
            streamer,
        }
    }

    pub async fn health(&self) -> Result<Value> {
        self.checker.health().await
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Forward a spreadsheet to the checker and record the upload.
    /// Returns the checker payload with `uploadId` added.
    #[instrument(skip(self, data), fields(user_id = %user.user_id))]
    pub async fn upload(
        &self,
        user: &AuthUser,
        file_name: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> Result<Value> {
        let mut payload = self.checker.upload(file_name, content_type, data).await?;

        let stored_name = payload
            .get("file_name")
            .and_then(Value::as_str)
            .unwrap_or(file_name)
            .to_string();
        let row_count = payload
            .get("row_count")
            .and_then(Value::as_i64)
            .and_then(|count| i32::try_from(count).ok())
            .unwrap_or(0);

        let upload = self
            .store
            .create_upload(&user.user_id, &stored_name, row_count)
            .await?;

        info!(upload_id = upload.id, file_name = %stored_name, row_count, "BOM uploaded");
        metrics::counter!("bom.uploads").increment(1);

        payload.insert("uploadId".to_string(), Value::from(upload.id));
        Ok(Value::Object(payload))
    }

    /// Save the user's choices, have the checker extract rows and replace
    /// the upload's rows and lookups with them.
    #[instrument(skip(self, request), fields(upload_id = request.upload_id))]
    pub async fn process(&self, request: ProcessBomRequest) -> Result<Vec<CheckerRow>> {
        request.validate()?;
        let upload = self.require_upload(request.upload_id).await?;

        let settings = UploadSettings {
            build_quantities: parse_quantities(&request.build_quantities),
            column_mapping: request.columns,
            build_date: request.build_date,
        };
        self.store.update_settings(upload.id, &settings).await?;

        let rows = self
            .checker
            .process_bom(&upload.file_name, &settings.column_mapping)
            .await?;

        let new_rows: Vec<_> = rows.iter().map(CheckerRow::to_new_row).collect();
        let lookups = self.store.replace_rows(upload.id, &new_rows).await?;

        info!(
            upload_id = upload.id,
            rows = rows.len(),
            lookups,
            quantities = ?settings.build_quantities,
            "BOM processed"
        );
        self.refresher.request();

        Ok(rows)
    }

    /// Add one build quantity. Returns the new list.
    #[instrument(skip(self))]
    pub async fn add_quantity(&self, request: AddQuantityRequest) -> Result<Vec<i32>> {
        let quantity = i32::try_from(request.quantity)
            .ok()
            .filter(|q| *q > 0)
            .ok_or_else(|| {
                BomError::Validation("Quantity must be a positive integer".to_string())
            })?;

        let upload = self.require_upload(request.upload_id).await?;

        let mut quantities = upload.build_quantities;
        let Err(position) = quantities.binary_search(&quantity) else {
            return Err(BomError::Validation("Quantity already exists".to_string()));
        };
        quantities.insert(position, quantity);

        self.store.set_build_quantities(upload.id, &quantities).await?;
        self.refresher.request();

        Ok(quantities)
    }

    pub async fn stream_supplier(
        &self,
        supplier: Supplier,
        upload_id: i64,
        rows: Vec<Value>,
    ) -> Result<ReceiverStream<Bytes>> {
        self.require_upload(upload_id).await?;
        self.streamer.stream_supplier(supplier, upload_id, rows).await
    }

    pub async fn stream_all(&self, upload_id: i64, rows: Vec<Value>) -> Result<Vec<StreamReport>> {
        self.require_upload(upload_id).await?;
        Ok(self.streamer.stream_all(upload_id, rows).await)
    }

    /// Both supplier panels for `quantity` boards. Counts reflect the last
    /// completed metrics refresh.
    #[instrument(skip(self))]
    pub async fn dashboard_summary(&self, upload_id: i64, quantity: i64) -> Result<DashboardSummary> {
        let quantity = i32::try_from(quantity)
            .ok()
            .filter(|q| *q >= 1)
            .ok_or_else(|| BomError::Validation("qty must be a positive integer".to_string()))?;

        let upload = self
            .store
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| BomError::NotFound(format!("Upload {}", upload_id)))?;

        let mut summary = DashboardSummary::default();

        for (supplier, counts) in self.store.supplier_metrics(upload.id, quantity).await? {
            let panel = summary.panel_mut(supplier);
            panel.found = counts.found;
            panel.not_found = counts.not_found;
            panel.back_order = counts.back_order;
            panel.obsolete = counts.obsolete;
        }

        for detail in self.store.lookup_details(upload.id).await? {
            summary
                .panel_mut(detail.supplier)
                .rows
                .push(DashboardRow::price(&detail, quantity));
        }

        Ok(summary)
    }

    async fn require_upload(&self, upload_id: i64) -> Result<BomUpload> {
        self.store
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| BomError::Validation("Invalid uploadId".to_string()))
    }
}
