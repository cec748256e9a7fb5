//! Hook into the quoting side of the marketplace.
//!
//! Every completed ingestion gets a draft "quick quotation" so the PM can
//! price the uploaded design straight away. Creation is best-effort.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuickQuoteHook: Send + Sync {
    async fn create_quick_quotation(
        &self,
        user_id: &str,
        job_id: Uuid,
        source: &str,
    ) -> anyhow::Result<()>;
}

/// Writes quick quotations to the shared PostgreSQL database
pub struct PgQuickQuotes {
    pool: PgPool,
}

impl PgQuickQuotes {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuickQuoteHook for PgQuickQuotes {
    #[instrument(skip(self))]
    async fn create_quick_quotation(
        &self,
        user_id: &str,
        job_id: Uuid,
        source: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quick_quotations (id, user_id, ingestion_job_id, source, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (ingestion_job_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(job_id)
        .bind(source)
        .execute(&self.pool)
        .await?;

        metrics::counter!("ingestion.quick_quotes.created").increment(1);
        Ok(())
    }
}

/// Hook that does nothing, for deployments without the quote tables
pub struct NoopQuickQuotes;

#[async_trait]
impl QuickQuoteHook for NoopQuickQuotes {
    async fn create_quick_quotation(&self, _: &str, _: Uuid, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
