//! Retry policy + catalog persistence for pricewatch.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{CatalogRecord, CommitRecord};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "pricewatch-storage";

const CATALOG_COLUMNS: &str = "id, commercial_name_en, commercial_name_ar, active_ingredients, \
     manufacturer, current_price, previous_price, last_price_update_date, units, barcode, \
     dosage_form, uses_ar, image_url, scraped_at";

const BINDS_PER_ROW: usize = 14;

/// Largest commit batch that stays under the Postgres bind-parameter limit.
pub const MAX_COMMIT_BATCH_ROWS: usize = u16::MAX as usize / BINDS_PER_ROW;

/// Exponential backoff over any fallible async operation.
///
/// `max_attempts` counts every try, including the first. The wait before
/// attempt `n + 1` is `base_delay * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryExhausted<E> {
    pub attempts: usize,
    pub last: E,
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempt ceiling is reached.
    /// `op` receives the zero-based attempt index.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= attempts => {
                    return Err(RetryExhausted {
                        attempts,
                        last: err,
                    });
                }
                Err(err) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        label,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Narrow read/write surface of the persistent catalog.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Latest committed record for each of `ids` that has one.
    async fn fetch_baseline(&self, ids: &[String]) -> Result<Vec<CatalogRecord>, StoreError>;

    /// Upsert current state and append history for one batch, stamped `committed_at`.
    async fn commit(
        &self,
        records: &[CommitRecord],
        committed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CatalogRow {
    id: String,
    commercial_name_en: Option<String>,
    commercial_name_ar: Option<String>,
    active_ingredients: Option<String>,
    manufacturer: Option<String>,
    current_price: Option<Decimal>,
    last_price_update_date: Option<DateTime<Utc>>,
    units: Option<String>,
    barcode: Option<String>,
    dosage_form: Option<String>,
    uses_ar: Option<String>,
    image_url: Option<String>,
}

impl From<CatalogRow> for CatalogRecord {
    fn from(row: CatalogRow) -> Self {
        CatalogRecord {
            id: row.id,
            name_en: row.commercial_name_en,
            name_ar: row.commercial_name_ar,
            active_ingredients: row.active_ingredients,
            manufacturer: row.manufacturer,
            price: row.current_price,
            last_price_update: row.last_price_update_date,
            units: row.units,
            barcode: row.barcode,
            dosage_form: row.dosage_form,
            uses_ar: row.uses_ar,
            image_url: row.image_url,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .context("connecting to catalog database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn fetch_baseline(&self, ids: &[String]) -> Result<Vec<CatalogRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<CatalogRow> = sqlx::query_as(
            "SELECT id, commercial_name_en, commercial_name_ar, active_ingredients, \
             manufacturer, current_price, last_price_update_date, units, barcode, dosage_form, \
             uses_ar, image_url FROM catalog_items WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CatalogRecord::from).collect())
    }

    async fn commit(
        &self,
        records: &[CommitRecord],
        committed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        build_upsert(records, committed_at)
            .build()
            .execute(&mut *tx)
            .await?;
        build_history_insert(records, committed_at)
            .build()
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn push_catalog_values<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    records: &[CommitRecord],
    committed_at: DateTime<Utc>,
) {
    builder.push_values(records, |mut b, row| {
        let r = &row.record;
        b.push_bind(r.id.clone())
            .push_bind(r.name_en.clone())
            .push_bind(r.name_ar.clone())
            .push_bind(r.active_ingredients.clone())
            .push_bind(r.manufacturer.clone())
            .push_bind(r.price)
            .push_bind(row.previous_price)
            .push_bind(r.last_price_update)
            .push_bind(r.units.clone())
            .push_bind(r.barcode.clone())
            .push_bind(r.dosage_form.clone())
            .push_bind(r.uses_ar.clone())
            .push_bind(r.image_url.clone())
            .push_bind(committed_at);
    });
}

fn build_upsert(
    records: &[CommitRecord],
    committed_at: DateTime<Utc>,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!("INSERT INTO catalog_items ({CATALOG_COLUMNS}) "));
    push_catalog_values(&mut builder, records, committed_at);
    builder.push(
        " ON CONFLICT (id) DO UPDATE SET \
            commercial_name_en = EXCLUDED.commercial_name_en, \
            commercial_name_ar = EXCLUDED.commercial_name_ar, \
            active_ingredients = EXCLUDED.active_ingredients, \
            manufacturer = EXCLUDED.manufacturer, \
            current_price = EXCLUDED.current_price, \
            previous_price = EXCLUDED.previous_price, \
            last_price_update_date = EXCLUDED.last_price_update_date, \
            units = EXCLUDED.units, \
            barcode = EXCLUDED.barcode, \
            dosage_form = EXCLUDED.dosage_form, \
            uses_ar = EXCLUDED.uses_ar, \
            image_url = EXCLUDED.image_url, \
            scraped_at = EXCLUDED.scraped_at",
    );
    builder
}

fn build_history_insert(
    records: &[CommitRecord],
    committed_at: DateTime<Utc>,
) -> QueryBuilder<'static, Postgres> {
    let mut builder =
        QueryBuilder::new(format!("INSERT INTO catalog_history ({CATALOG_COLUMNS}) "));
    push_catalog_values(&mut builder, records, committed_at);
    builder
}
