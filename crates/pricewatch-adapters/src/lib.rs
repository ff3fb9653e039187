//! Price-source adapter: sharded search fetching + record normalization.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use pricewatch_core::{decimal_from_json, json_text, timestamp_from_json, CatalogRecord, RawRecord};
use pricewatch_storage::RetryPolicy;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, REFERER, USER_AGENT};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "pricewatch-adapters";

const SHARD_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";

/// Every two-letter lowercase prefix, `aa` through `zz`.
pub fn two_letter_shards() -> Vec<String> {
    SHARD_ALPHABET
        .chars()
        .flat_map(|first| SHARD_ALPHABET.chars().map(move |second| format!("{first}{second}")))
        .collect()
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for shard {shard}")]
    HttpStatus { status: u16, shard: String },
    #[error("malformed response body for shard {shard}: {source}")]
    MalformedBody {
        shard: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("concurrency limiter closed")]
    LimiterClosed,
}

/// One query against the paginated search endpoint.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, shard: &str) -> Result<Vec<RawRecord>, FetchError>;
}

#[async_trait]
impl<C: SearchClient + ?Sized> SearchClient for Arc<C> {
    async fn search(&self, shard: &str) -> Result<Vec<RawRecord>, FetchError> {
        (**self).search(shard).await
    }
}

#[derive(Debug, Clone)]
pub struct SearchEndpoint {
    pub url: String,
    pub user_agent: String,
    pub requested_with: String,
    pub referer: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct SearchForm<'a> {
    search: &'static str,
    searchq: &'a str,
    order_by: &'static str,
    page: &'static str,
}

impl<'a> SearchForm<'a> {
    fn first_page(shard: &'a str) -> Self {
        Self {
            search: "1",
            searchq: shard,
            order_by: "name ASC",
            page: "1",
        }
    }
}

#[derive(Debug)]
pub struct HttpSearchClient {
    client: reqwest::Client,
    url: String,
}

impl HttpSearchClient {
    pub fn new(endpoint: SearchEndpoint) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&endpoint.user_agent).context("invalid user agent header")?,
        );
        headers.insert(
            HeaderName::from_static("x-requested-with"),
            HeaderValue::from_str(&endpoint.requested_with)
                .context("invalid x-requested-with header")?,
        );
        headers.insert(
            REFERER,
            HeaderValue::from_str(&endpoint.referer).context("invalid referer header")?,
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(endpoint.timeout)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            url: endpoint.url,
        })
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(&self, shard: &str) -> Result<Vec<RawRecord>, FetchError> {
        let resp = self
            .client
            .post(&self.url)
            .form(&SearchForm::first_page(shard))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                shard: shard.to_string(),
            });
        }

        let body = resp.bytes().await?;
        parse_search_body(shard, &body)
    }
}

/// Extract the `data` array. A body that is not JSON is an error (retried);
/// a missing or non-list `data` field is an anomaly and yields no records.
pub fn parse_search_body(shard: &str, body: &[u8]) -> Result<Vec<RawRecord>, FetchError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|source| FetchError::MalformedBody {
            shard: shard.to_string(),
            source,
        })?;

    match value.get("data") {
        Some(JsonValue::Array(items)) => Ok(items
            .iter()
            .filter(|item| item.as_object().is_some_and(|obj| !obj.is_empty()))
            .filter_map(|item| serde_json::from_value::<RawRecord>(item.clone()).ok())
            .collect()),
        None if value.is_object() => {
            warn!(shard, "response carries no data field; treating shard as empty");
            Ok(Vec::new())
        }
        _ => {
            warn!(shard, "response data payload is not a list; treating shard as empty");
            Ok(Vec::new())
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShardResult {
    pub shard: String,
    pub records: Vec<RawRecord>,
    pub exhausted: bool,
}

/// Issues one search per shard with a global in-flight cap and per-shard retry.
pub struct ShardFetcher<C> {
    client: C,
    limit: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl<C: SearchClient> ShardFetcher<C> {
    pub fn new(client: C, max_concurrent: usize, retry: RetryPolicy) -> Self {
        Self {
            client,
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry,
        }
    }

    /// Fetch one shard. Exhausted retries degrade to an empty result.
    pub async fn fetch_shard(&self, shard: &str) -> ShardResult {
        let client = &self.client;
        let limit = &self.limit;
        let outcome = self
            .retry
            .run(shard, move |_attempt| async move {
                // Held per attempt only; backoff sleeps do not occupy a slot.
                let _permit = limit.acquire().await.map_err(|_| FetchError::LimiterClosed)?;
                client.search(shard).await
            })
            .instrument(info_span!("shard_fetch", shard))
            .await;

        match outcome {
            Ok(records) => ShardResult {
                shard: shard.to_string(),
                records,
                exhausted: false,
            },
            Err(exhausted) => {
                error!(
                    shard,
                    attempts = exhausted.attempts,
                    error = %exhausted.last,
                    "all retries failed; shard yields no records"
                );
                ShardResult {
                    shard: shard.to_string(),
                    records: Vec::new(),
                    exhausted: true,
                }
            }
        }
    }

    /// Launch every shard at once; results come back in `shards` order.
    pub async fn fetch_all(&self, shards: &[String]) -> Vec<ShardResult> {
        info!(shards = shards.len(), "launching shard fetches");
        join_all(shards.iter().map(|shard| self.fetch_shard(shard))).await
    }
}

fn identifier(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

fn text(field: &Option<JsonValue>) -> Option<String> {
    field.as_ref().and_then(json_text)
}

/// Map a raw search record to the canonical schema; records without an id are dropped.
pub fn normalize(raw: &RawRecord) -> Option<CatalogRecord> {
    let id = raw.id.as_ref().and_then(identifier)?;
    Some(CatalogRecord {
        id,
        name_en: text(&raw.name),
        name_ar: text(&raw.arabic),
        active_ingredients: text(&raw.active),
        manufacturer: text(&raw.company),
        price: raw.price.as_ref().and_then(decimal_from_json),
        last_price_update: raw.date_updated.as_ref().and_then(timestamp_from_json),
        units: text(&raw.units),
        barcode: text(&raw.barcode),
        dosage_form: text(&raw.dosage_form),
        uses_ar: text(&raw.uses),
        image_url: text(&raw.img),
    })
}

pub fn normalize_all<'a>(raws: impl IntoIterator<Item = &'a RawRecord>) -> Vec<CatalogRecord> {
    raws.into_iter().filter_map(normalize).collect()
}
