//! BOM persistence: uploads, rows, per-supplier lookups and the supplier
//! metrics view.

use crate::config::DatabaseConfig;
use crate::error::{BomError, Result};
use crate::price_breaks::PriceBreaks;
use crate::supplier::{LookupStatus, Supplier};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Spreadsheet column and the field it was mapped to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub name: String,
    pub mapping: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BomUpload {
    pub id: i64,
    pub user_id: String,
    pub file_name: String,
    pub row_count: i32,
    /// Ascending, unique, positive
    pub build_quantities: Vec<i32>,
    pub column_mapping: Vec<ColumnMapping>,
    pub build_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// Processing choices made by the user
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub build_quantities: Vec<i32>,
    pub column_mapping: Vec<ColumnMapping>,
    /// Left unchanged when `None`
    pub build_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBomRow {
    pub row_index: i32,
    pub mpns: Vec<String>,
    pub manufacturer: Option<String>,
    pub quantity: i32,
    pub reference: Option<String>,
}

/// Result of one supplier event for a part
#[derive(Debug, Clone, PartialEq)]
pub struct LookupUpdate {
    pub mpn: String,
    pub status: LookupStatus,
    pub response: Value,
    pub quantity_available: Option<i64>,
    pub price_breaks: PriceBreaks,
}

/// A lookup joined with its row
#[derive(Debug, Clone, PartialEq)]
pub struct LookupDetail {
    pub supplier: Supplier,
    pub row_index: i32,
    pub mpns: Vec<String>,
    pub reference: Option<String>,
    pub row_quantity: i32,
    pub mpn: String,
    pub status: Option<LookupStatus>,
    pub quantity_available: Option<i64>,
    pub price_breaks: PriceBreaks,
    pub response: Option<Value>,
}

/// Counts for one (upload, supplier, build quantity)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupplierMetrics {
    pub found: i64,
    pub not_found: i64,
    pub back_order: i64,
    pub obsolete: i64,
}

#[async_trait]
pub trait BomStore: Send + Sync {
    async fn create_upload(&self, user_id: &str, file_name: &str, row_count: i32)
        -> Result<BomUpload>;

    async fn get_upload(&self, id: i64) -> Result<Option<BomUpload>>;

    async fn update_settings(&self, id: i64, settings: &UploadSettings) -> Result<()>;

    async fn set_build_quantities(&self, id: i64, quantities: &[i32]) -> Result<()>;

    /// Delete the upload's rows and recreate them, each with one unset
    /// lookup per (part number, supplier). Returns the number of lookups.
    async fn replace_rows(&self, upload_id: i64, rows: &[NewBomRow]) -> Result<usize>;

    /// Overwrite every lookup of `update.mpn` at `supplier` within the upload.
    /// Returns the number of lookups touched.
    async fn apply_lookup(
        &self,
        upload_id: i64,
        supplier: Supplier,
        update: &LookupUpdate,
    ) -> Result<u64>;

    async fn lookup_details(&self, upload_id: i64) -> Result<Vec<LookupDetail>>;

    /// Recompute the supplier metrics view
    async fn refresh_metrics(&self) -> Result<()>;

    /// Counts as of the last refresh
    async fn supplier_metrics(
        &self,
        upload_id: i64,
        quantity: i32,
    ) -> Result<HashMap<Supplier, SupplierMetrics>>;

    async fn ping(&self) -> Result<()>;
}

fn request_json(mpn: &str, manufacturer: Option<&str>) -> Value {
    json!({ "mpn": mpn, "manufacturer": manufacturer })
}

#[derive(Debug, FromRow)]
struct UploadRow {
    id: i64,
    user_id: String,
    file_name: String,
    row_count: i32,
    build_quantities: Vec<i32>,
    column_mapping: Json<Vec<ColumnMapping>>,
    build_date: Option<NaiveDate>,
    created_at: DateTime<Utc>,
}

impl From<UploadRow> for BomUpload {
    fn from(row: UploadRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            file_name: row.file_name,
            row_count: row.row_count,
            build_quantities: row.build_quantities,
            column_mapping: row.column_mapping.0,
            build_date: row.build_date,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DetailRow {
    source: String,
    row_index: i32,
    mpns: Vec<String>,
    reference: Option<String>,
    quantity: i32,
    mpn: String,
    status: Option<String>,
    quantity_available: Option<i64>,
    scaled_price_bands: Json<PriceBreaks>,
    response_json: Option<Json<Value>>,
}

impl TryFrom<DetailRow> for LookupDetail {
    type Error = BomError;

    fn try_from(row: DetailRow) -> Result<Self> {
        Ok(Self {
            supplier: row.source.parse()?,
            row_index: row.row_index,
            mpns: row.mpns,
            reference: row.reference,
            row_quantity: row.quantity,
            mpn: row.mpn,
            status: row
                .status
                .as_deref()
                .map(str::parse::<LookupStatus>)
                .transpose()?,
            quantity_available: row.quantity_available,
            price_breaks: row.scaled_price_bands.0,
            response: row.response_json.map(|j| j.0),
        })
    }
}

#[derive(Debug, FromRow)]
struct MetricsRow {
    supplier: String,
    found: i64,
    not_found: i64,
    back_order: i64,
    obsolete: i64,
}

const UPLOAD_COLUMNS: &str = "id, user_id, file_name, row_count, build_quantities, \
                              column_mapping, build_date, created_at";

/// BOM store backed by PostgreSQL
pub struct PgBomStore {
    pool: PgPool,
}

impl PgBomStore {
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl BomStore for PgBomStore {
    #[instrument(skip(self))]
    async fn create_upload(
        &self,
        user_id: &str,
        file_name: &str,
        row_count: i32,
    ) -> Result<BomUpload> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            r#"
            INSERT INTO bom_uploads (user_id, file_name, row_count)
            VALUES ($1, $2, $3)
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        ))
        .bind(user_id)
        .bind(file_name)
        .bind(row_count)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_upload(&self, id: i64) -> Result<Option<BomUpload>> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {} FROM bom_uploads WHERE id = $1",
            UPLOAD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BomUpload::from))
    }

    #[instrument(skip(self, settings))]
    async fn update_settings(&self, id: i64, settings: &UploadSettings) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE bom_uploads
            SET build_quantities = $2,
                column_mapping = $3,
                build_date = COALESCE($4, build_date)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&settings.build_quantities)
        .bind(Json(&settings.column_mapping))
        .bind(settings.build_date)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_build_quantities(&self, id: i64, quantities: &[i32]) -> Result<()> {
        sqlx::query("UPDATE bom_uploads SET build_quantities = $2 WHERE id = $1")
            .bind(id)
            .bind(quantities)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn replace_rows(&self, upload_id: i64, rows: &[NewBomRow]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        // Lookups go with their rows (ON DELETE CASCADE)
        sqlx::query("DELETE FROM bom_rows WHERE upload_id = $1")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        let mut lookups = 0;
        for row in rows {
            let row_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO bom_rows (upload_id, row_index, mpns, manufacturer, quantity, reference)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id
                "#,
            )
            .bind(upload_id)
            .bind(row.row_index)
            .bind(&row.mpns)
            .bind(&row.manufacturer)
            .bind(row.quantity)
            .bind(&row.reference)
            .fetch_one(&mut *tx)
            .await?;

            for mpn in &row.mpns {
                for supplier in Supplier::ALL {
                    sqlx::query(
                        r#"
                        INSERT INTO bom_lookups (row_id, source, mpn, request_json)
                        VALUES ($1, $2, $3, $4)
                        "#,
                    )
                    .bind(row_id)
                    .bind(supplier.as_str())
                    .bind(mpn)
                    .bind(Json(request_json(mpn, row.manufacturer.as_deref())))
                    .execute(&mut *tx)
                    .await?;
                    lookups += 1;
                }
            }
        }

        tx.commit().await?;

        debug!(upload_id, lookups, "Replaced BOM rows");
        Ok(lookups)
    }

    async fn apply_lookup(
        &self,
        upload_id: i64,
        supplier: Supplier,
        update: &LookupUpdate,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE bom_lookups l
            SET status = $4,
                response_json = $5,
                quantity_available = $6,
                scaled_price_bands = $7,
                updated_at = NOW()
            FROM bom_rows r
            WHERE l.row_id = r.id
              AND r.upload_id = $1
              AND l.source = $2
              AND l.mpn = $3
            "#,
        )
        .bind(upload_id)
        .bind(supplier.as_str())
        .bind(&update.mpn)
        .bind(update.status.as_str())
        .bind(Json(&update.response))
        .bind(update.quantity_available)
        .bind(Json(&update.price_breaks))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn lookup_details(&self, upload_id: i64) -> Result<Vec<LookupDetail>> {
        let rows = sqlx::query_as::<_, DetailRow>(
            r#"
            SELECT l.source, r.row_index, r.mpns, r.reference, r.quantity,
                   l.mpn, l.status, l.quantity_available,
                   l.scaled_price_bands, l.response_json
            FROM bom_rows r
            JOIN bom_lookups l ON l.row_id = r.id
            WHERE r.upload_id = $1
            ORDER BY r.row_index, l.id
            "#,
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LookupDetail::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn refresh_metrics(&self) -> Result<()> {
        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY vw_bom_supplier_metrics")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn supplier_metrics(
        &self,
        upload_id: i64,
        quantity: i32,
    ) -> Result<HashMap<Supplier, SupplierMetrics>> {
        let rows = sqlx::query_as::<_, MetricsRow>(
            r#"
            SELECT supplier, found, not_found, back_order, obsolete
            FROM vw_bom_supplier_metrics
            WHERE upload_id = $1 AND qty = $2
            "#,
        )
        .bind(upload_id)
        .bind(quantity)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<(Supplier, SupplierMetrics)> {
                Ok((
                    row.supplier.parse()?,
                    SupplierMetrics {
                        found: row.found,
                        not_found: row.not_found,
                        back_order: row.back_order,
                        obsolete: row.obsolete,
                    },
                ))
            })
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Tally lookups the way `vw_bom_supplier_metrics` does
pub fn tally(details: &[LookupDetail], quantity: i32) -> HashMap<Supplier, SupplierMetrics> {
    let mut metrics: HashMap<Supplier, SupplierMetrics> = HashMap::new();

    for detail in details {
        let counts = metrics.entry(detail.supplier).or_default();
        let needed = i64::from(detail.row_quantity) * i64::from(quantity);
        let in_stock = detail.quantity_available.unwrap_or(0) >= needed;

        match detail.status {
            Some(LookupStatus::Found) if in_stock => counts.found += 1,
            Some(LookupStatus::Found) | Some(LookupStatus::Backorder) => counts.back_order += 1,
            Some(LookupStatus::NotFound) => counts.not_found += 1,
            Some(LookupStatus::Obsolete) => counts.obsolete += 1,
            None => {}
        }
    }

    metrics
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    uploads: HashMap<i64, BomUpload>,
    rows: Vec<(i64, i64, NewBomRow)>,
    lookups: Vec<MemoryLookup>,
    view: HashMap<(i64, i32), HashMap<Supplier, SupplierMetrics>>,
}

struct MemoryLookup {
    row_id: i64,
    supplier: Supplier,
    mpn: String,
    status: Option<LookupStatus>,
    response: Option<Value>,
    quantity_available: Option<i64>,
    price_breaks: PriceBreaks,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn details(&self, upload_id: i64) -> Vec<LookupDetail> {
        let mut details = Vec::new();
        for (row_id, _, row) in self.rows.iter().filter(|(_, u, _)| *u == upload_id) {
            for lookup in self.lookups.iter().filter(|l| l.row_id == *row_id) {
                details.push(LookupDetail {
                    supplier: lookup.supplier,
                    row_index: row.row_index,
                    mpns: row.mpns.clone(),
                    reference: row.reference.clone(),
                    row_quantity: row.quantity,
                    mpn: lookup.mpn.clone(),
                    status: lookup.status,
                    quantity_available: lookup.quantity_available,
                    price_breaks: lookup.price_breaks.clone(),
                    response: lookup.response.clone(),
                });
            }
        }
        details.sort_by_key(|d| d.row_index);
        details
    }
}

/// In-process BOM store. Metrics only change on `refresh_metrics`, like the view.
#[derive(Default)]
pub struct MemoryBomStore {
    state: Mutex<MemoryState>,
    refreshes: AtomicUsize,
}

impl MemoryBomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed metric refreshes
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BomStore for MemoryBomStore {
    async fn create_upload(
        &self,
        user_id: &str,
        file_name: &str,
        row_count: i32,
    ) -> Result<BomUpload> {
        let mut state = self.state();
        let upload = BomUpload {
            id: state.next_id(),
            user_id: user_id.to_string(),
            file_name: file_name.to_string(),
            row_count,
            build_quantities: Vec::new(),
            column_mapping: Vec::new(),
            build_date: None,
            created_at: Utc::now(),
        };
        state.uploads.insert(upload.id, upload.clone());
        Ok(upload)
    }

    async fn get_upload(&self, id: i64) -> Result<Option<BomUpload>> {
        Ok(self.state().uploads.get(&id).cloned())
    }

    async fn update_settings(&self, id: i64, settings: &UploadSettings) -> Result<()> {
        if let Some(upload) = self.state().uploads.get_mut(&id) {
            upload.build_quantities = settings.build_quantities.clone();
            upload.column_mapping = settings.column_mapping.clone();
            if settings.build_date.is_some() {
                upload.build_date = settings.build_date;
            }
        }
        Ok(())
    }

    async fn set_build_quantities(&self, id: i64, quantities: &[i32]) -> Result<()> {
        if let Some(upload) = self.state().uploads.get_mut(&id) {
            upload.build_quantities = quantities.to_vec();
        }
        Ok(())
    }

    async fn replace_rows(&self, upload_id: i64, rows: &[NewBomRow]) -> Result<usize> {
        let mut state = self.state();

        let stale: Vec<i64> = state
            .rows
            .iter()
            .filter(|(_, u, _)| *u == upload_id)
            .map(|(id, _, _)| *id)
            .collect();
        state.rows.retain(|(_, u, _)| *u != upload_id);
        state.lookups.retain(|l| !stale.contains(&l.row_id));

        let mut lookups = 0;
        for row in rows {
            let row_id = state.next_id();
            state.rows.push((row_id, upload_id, row.clone()));
            for mpn in &row.mpns {
                for supplier in Supplier::ALL {
                    state.lookups.push(MemoryLookup {
                        row_id,
                        supplier,
                        mpn: mpn.clone(),
                        status: None,
                        response: None,
                        quantity_available: None,
                        price_breaks: PriceBreaks::new(),
                    });
                    lookups += 1;
                }
            }
        }
        Ok(lookups)
    }

    async fn apply_lookup(
        &self,
        upload_id: i64,
        supplier: Supplier,
        update: &LookupUpdate,
    ) -> Result<u64> {
        let mut state = self.state();
        let row_ids: Vec<i64> = state
            .rows
            .iter()
            .filter(|(_, u, _)| *u == upload_id)
            .map(|(id, _, _)| *id)
            .collect();

        let mut touched = 0;
        for lookup in state.lookups.iter_mut().filter(|l| {
            row_ids.contains(&l.row_id) && l.supplier == supplier && l.mpn == update.mpn
        }) {
            lookup.status = Some(update.status);
            lookup.response = Some(update.response.clone());
            lookup.quantity_available = update.quantity_available;
            lookup.price_breaks = update.price_breaks.clone();
            touched += 1;
        }
        Ok(touched)
    }

    async fn lookup_details(&self, upload_id: i64) -> Result<Vec<LookupDetail>> {
        Ok(self.state().details(upload_id))
    }

    async fn refresh_metrics(&self) -> Result<()> {
        let mut state = self.state();
        let mut view = HashMap::new();
        for upload in state.uploads.values() {
            let details = state.details(upload.id);
            for &quantity in &upload.build_quantities {
                view.insert((upload.id, quantity), tally(&details, quantity));
            }
        }
        state.view = view;
        drop(state);

        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn supplier_metrics(
        &self,
        upload_id: i64,
        quantity: i32,
    ) -> Result<HashMap<Supplier, SupplierMetrics>> {
        Ok(self
            .state()
            .view
            .get(&(upload_id, quantity))
            .cloned()
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(index: i32, mpns: &[&str], quantity: i32) -> NewBomRow {
        NewBomRow {
            row_index: index,
            mpns: mpns.iter().map(|m| m.to_string()).collect(),
            manufacturer: Some("TI".to_string()),
            quantity,
            reference: Some(format!("U{}", index)),
        }
    }

    fn found(mpn: &str, available: i64) -> LookupUpdate {
        LookupUpdate {
            mpn: mpn.to_string(),
            status: LookupStatus::Found,
            response: json!({ "mpn": mpn }),
            quantity_available: Some(available),
            price_breaks: PriceBreaks::from_iter([(1, 2.0)]),
        }
    }

    #[tokio::test]
    async fn test_replace_rows_creates_lookup_per_supplier() {
        let store = MemoryBomStore::new();
        let upload = store.create_upload("7", "board.xlsx", 3).await.unwrap();

        let rows = [row(1, &["A"], 1), row(2, &["B"], 2), row(3, &["C"], 4)];
        assert_eq!(store.replace_rows(upload.id, &rows).await.unwrap(), 6);

        let details = store.lookup_details(upload.id).await.unwrap();
        assert_eq!(details.len(), 6);
        assert!(details.iter().all(|d| d.status.is_none()));

        // Reprocessing replaces rather than appends
        let rows = [row(1, &["A", "A-ALT"], 1)];
        assert_eq!(store.replace_rows(upload.id, &rows).await.unwrap(), 4);
        assert_eq!(store.lookup_details(upload.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_apply_lookup_is_scoped_and_idempotent() {
        let store = MemoryBomStore::new();
        let first = store.create_upload("7", "a.xlsx", 1).await.unwrap();
        let second = store.create_upload("7", "b.xlsx", 1).await.unwrap();
        store.replace_rows(first.id, &[row(1, &["A"], 1)]).await.unwrap();
        store.replace_rows(second.id, &[row(1, &["A"], 1)]).await.unwrap();

        let update = found("A", 500);
        assert_eq!(store.apply_lookup(first.id, Supplier::Mouser, &update).await.unwrap(), 1);
        let once = store.lookup_details(first.id).await.unwrap();
        assert_eq!(store.apply_lookup(first.id, Supplier::Mouser, &update).await.unwrap(), 1);
        assert_eq!(store.lookup_details(first.id).await.unwrap(), once);

        let digikey = once.iter().find(|d| d.supplier == Supplier::Digikey).unwrap();
        assert!(digikey.status.is_none());
        let untouched = store.lookup_details(second.id).await.unwrap();
        assert!(untouched.iter().all(|d| d.status.is_none()));

        let missing = found("NOPE", 1);
        assert_eq!(store.apply_lookup(first.id, Supplier::Mouser, &missing).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_metrics_follow_refresh() {
        let store = MemoryBomStore::new();
        let upload = store.create_upload("7", "a.xlsx", 2).await.unwrap();
        store
            .set_build_quantities(upload.id, &[1, 100])
            .await
            .unwrap();
        store
            .replace_rows(upload.id, &[row(1, &["A"], 2), row(2, &["B"], 1)])
            .await
            .unwrap();
        store.apply_lookup(upload.id, Supplier::Digikey, &found("A", 50)).await.unwrap();
        let mut obsolete = found("B", 0);
        obsolete.status = LookupStatus::Obsolete;
        store.apply_lookup(upload.id, Supplier::Digikey, &obsolete).await.unwrap();

        assert!(store.supplier_metrics(upload.id, 1).await.unwrap().is_empty());
        store.refresh_metrics().await.unwrap();

        let small = store.supplier_metrics(upload.id, 1).await.unwrap();
        assert_eq!(
            small[&Supplier::Digikey],
            SupplierMetrics { found: 1, not_found: 0, back_order: 0, obsolete: 1 }
        );
        assert_eq!(small[&Supplier::Mouser], SupplierMetrics::default());

        // 2 per board x 100 boards exceeds the 50 in stock
        let large = store.supplier_metrics(upload.id, 100).await.unwrap();
        assert_eq!(large[&Supplier::Digikey].found, 0);
        assert_eq!(large[&Supplier::Digikey].back_order, 1);

        // Quantities that were never selected have no metrics
        assert!(store.supplier_metrics(upload.id, 5).await.unwrap().is_empty());
    }
}
