//! Sync pipeline: fetch, normalize, dedupe, diff against baseline, notify-gated commit.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use pricewatch_adapters::{
    normalize_all, two_letter_shards, HttpSearchClient, SearchClient, SearchEndpoint, ShardFetcher,
};
use pricewatch_core::{
    prices_match, CatalogRecord, ChangeSet, Classification, CommitRecord, NotificationOutcome,
};
use pricewatch_notify::{
    HtmlTextRenderer, Notifier, Payload, Renderer, TelegramConfig, TelegramNotifier,
};
use pricewatch_storage::{CatalogStore, PgCatalogStore, RetryPolicy, MAX_COMMIT_BATCH_ROWS};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-sync";

/// Environment-sourced process configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_url: String,
    pub user_agent: String,
    pub requested_with: String,
    pub referer: String,
    pub request_timeout_secs: u64,
    pub max_retries: usize,
    pub retry_delay_secs: u64,
    pub max_concurrent_requests: usize,
    pub baseline_batch_size: usize,
    pub commit_batch_size: usize,
    pub database_url: String,
    pub bot_token: Option<String>,
    pub target_channel: Option<String>,
    pub telegram_api_base: String,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let Some(api_url) = env_string("API_URL") else {
            bail!("API_URL is not set");
        };
        let Some(database_url) = env_string("DATABASE_URL") else {
            bail!("DATABASE_URL is not set");
        };
        Ok(Self {
            api_url,
            user_agent: env_string("USER_AGENT").unwrap_or_else(|| "Mozilla/5.0".to_string()),
            requested_with: env_string("X_REQUESTED_WITH")
                .unwrap_or_else(|| "XMLHttpRequest".to_string()),
            referer: env_string("REFERER").unwrap_or_else(|| "https://yourapp.com".to_string()),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECONDS", 30),
            max_retries: env_or("MAX_RETRIES", 5),
            retry_delay_secs: env_or("RETRY_DELAY_SECONDS", 2),
            max_concurrent_requests: env_or("MAX_CONCURRENT_REQUESTS", 10),
            baseline_batch_size: env_or("BASELINE_BATCH_SIZE", 1000),
            commit_batch_size: env_or("COMMIT_BATCH_SIZE", 500),
            database_url,
            bot_token: env_string("BOT_TOKEN"),
            target_channel: env_string("TARGET_CHANNEL"),
            telegram_api_base: env_string("TELEGRAM_API_BASE")
                .unwrap_or_else(|| "https://api.telegram.org".to_string()),
        })
    }

    pub fn search_endpoint(&self) -> SearchEndpoint {
        SearchEndpoint {
            url: self.api_url.clone(),
            user_agent: self.user_agent.clone(),
            requested_with: self.requested_with.clone(),
            referer: self.referer.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    /// `None` when either credential is missing; the run then has no notifier.
    pub fn telegram(&self) -> Option<TelegramConfig> {
        Some(TelegramConfig {
            api_base: self.telegram_api_base.clone(),
            bot_token: self.bot_token.clone()?,
            chat_id: self.target_channel.clone()?,
            timeout: Duration::from_secs(self.request_timeout_secs),
        })
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            shards: two_letter_shards(),
            max_concurrent_requests: self.max_concurrent_requests.max(1),
            retry: RetryPolicy {
                max_attempts: self.max_retries.max(1),
                base_delay: Duration::from_secs(self.retry_delay_secs),
                ..RetryPolicy::default()
            },
            baseline_batch_size: self.baseline_batch_size.max(1),
            commit_batch_size: self.commit_batch_size.clamp(1, MAX_COMMIT_BATCH_ROWS),
        }
    }
}

/// Tuning knobs for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub shards: Vec<String>,
    pub max_concurrent_requests: usize,
    pub retry: RetryPolicy,
    pub baseline_batch_size: usize,
    pub commit_batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            shards: two_letter_shards(),
            max_concurrent_requests: 10,
            retry: RetryPolicy::default(),
            baseline_batch_size: 1000,
            commit_batch_size: 500,
        }
    }
}

/// Collapse records sharing an id. The most populated record wins; ties go to
/// the one seen last. Output keeps first-seen order.
pub fn dedupe(records: Vec<CatalogRecord>) -> Vec<CatalogRecord> {
    let mut order = Vec::new();
    let mut by_id: HashMap<String, CatalogRecord> = HashMap::new();
    for record in records {
        match by_id.entry(record.id.clone()) {
            Entry::Vacant(slot) => {
                order.push(record.id.clone());
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if record.populated_fields() >= slot.get().populated_fields() {
                    slot.insert(record);
                }
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

#[derive(Debug, Default)]
pub struct BaselineLoad {
    pub baselines: HashMap<String, CatalogRecord>,
    pub batches: usize,
    pub failed_batches: usize,
}

/// Look up baselines in batches of at most `batch_size` ids. A failed batch
/// leaves its ids without a baseline.
pub async fn load_baselines(
    store: &dyn CatalogStore,
    ids: &[String],
    batch_size: usize,
) -> BaselineLoad {
    let mut load = BaselineLoad::default();
    for (index, batch) in ids.chunks(batch_size.max(1)).enumerate() {
        load.batches += 1;
        match store.fetch_baseline(batch).await {
            Ok(rows) => {
                for row in rows {
                    load.baselines.insert(row.id.clone(), row);
                }
            }
            Err(err) => {
                load.failed_batches += 1;
                error!(
                    batch = index,
                    ids = batch.len(),
                    error = %err,
                    "baseline batch failed; its ids will be treated as new"
                );
            }
        }
    }
    load
}

/// Only the price drives classification.
pub fn classify(candidate: CatalogRecord, baseline: Option<CatalogRecord>) -> ChangeSet {
    match baseline {
        None => ChangeSet::New { candidate },
        Some(baseline) => {
            if prices_match(candidate.price, baseline.price) {
                ChangeSet::Unchanged {
                    candidate,
                    baseline,
                }
            } else {
                ChangeSet::Changed {
                    candidate,
                    baseline,
                }
            }
        }
    }
}

pub fn diff_all(
    candidates: Vec<CatalogRecord>,
    baselines: &mut HashMap<String, CatalogRecord>,
) -> Vec<ChangeSet> {
    candidates
        .into_iter()
        .map(|candidate| {
            let baseline = baselines.remove(&candidate.id);
            classify(candidate, baseline)
        })
        .collect()
}

/// Per-record notification gate state.
///
/// ```text
/// NEW       -> CommitQueued
/// CHANGED   -> PendingNotify -(delivered)-> CommitQueued
///                            -(failed)----> Skipped
/// UNCHANGED -> Ignored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateState {
    PendingNotify,
    CommitQueued,
    Skipped,
    Ignored,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no transition from {from:?} on notification outcome")]
pub struct InvalidTransition {
    pub from: GateState,
}

impl GateState {
    pub fn initial(classification: Classification) -> Self {
        match classification {
            Classification::New => Self::CommitQueued,
            Classification::Changed => Self::PendingNotify,
            Classification::Unchanged => Self::Ignored,
        }
    }

    pub fn on_outcome(self, outcome: NotificationOutcome) -> Result<Self, InvalidTransition> {
        match self {
            Self::PendingNotify if outcome.delivered => Ok(Self::CommitQueued),
            Self::PendingNotify => Ok(Self::Skipped),
            from => Err(InvalidTransition { from }),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::PendingNotify)
    }
}

#[derive(Debug, Clone)]
pub struct GateEntry {
    pub change: ChangeSet,
    pub state: GateState,
    pub outcome: Option<NotificationOutcome>,
}

impl GateEntry {
    pub fn admit(change: ChangeSet) -> Self {
        let state = GateState::initial(change.classification());
        Self {
            change,
            state,
            outcome: None,
        }
    }

    pub fn record_outcome(
        &mut self,
        outcome: NotificationOutcome,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.on_outcome(outcome)?;
        self.outcome = Some(outcome);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct GateReport {
    pub entries: Vec<GateEntry>,
}

impl GateReport {
    pub fn count(&self, state: GateState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }

    pub fn notified(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome.is_some_and(|o| o.delivered))
            .count()
    }

    /// Records accepted for commit, in processing order.
    pub fn into_commit_queue(self) -> Vec<CommitRecord> {
        self.entries
            .into_iter()
            .filter(|e| e.state == GateState::CommitQueued)
            .map(|e| e.change.into_commit_record())
            .collect()
    }
}

/// Drives changed records through notify-then-commit, one at a time.
pub struct NotificationGate<'a> {
    renderer: &'a dyn Renderer,
    notifier: Option<&'a dyn Notifier>,
}

impl<'a> NotificationGate<'a> {
    pub fn new(renderer: &'a dyn Renderer, notifier: Option<&'a dyn Notifier>) -> Self {
        Self { renderer, notifier }
    }

    pub async fn process(&self, changes: Vec<ChangeSet>) -> GateReport {
        let mut report = GateReport::default();
        for change in changes {
            let mut entry = GateEntry::admit(change);
            if entry.state == GateState::PendingNotify {
                let outcome = self.deliver(&entry.change).await;
                if let Err(err) = entry.record_outcome(outcome) {
                    error!(id = entry.change.id(), error = %err, "gate transition rejected");
                }
                if entry.state == GateState::Skipped {
                    warn!(
                        id = entry.change.id(),
                        "notification failed; record left uncommitted for this run"
                    );
                }
            }
            report.entries.push(entry);
        }
        report
    }

    async fn deliver(&self, change: &ChangeSet) -> NotificationOutcome {
        let id = change.id();
        info!(
            id,
            previous_price = ?change.previous_price(),
            current_price = ?change.current_price(),
            "price change detected"
        );

        let Some(notifier) = self.notifier else {
            warn!(id, "notifier unavailable");
            return NotificationOutcome::failed();
        };

        let payload: Payload =
            match std::panic::catch_unwind(AssertUnwindSafe(|| self.renderer.render(change))) {
                Ok(Ok(payload)) => payload,
                Ok(Err(err)) => {
                    error!(id, error = %err, "rendering notification failed");
                    return NotificationOutcome::failed();
                }
                Err(_) => {
                    error!(id, "renderer panicked");
                    return NotificationOutcome::failed();
                }
            };

        match AssertUnwindSafe(notifier.notify(&payload)).catch_unwind().await {
            Ok(true) => NotificationOutcome::delivered(),
            Ok(false) => NotificationOutcome::failed(),
            Err(_) => {
                error!(id, "notifier panicked");
                NotificationOutcome::failed()
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub batches: usize,
    pub committed: usize,
    pub failed_batches: usize,
}

/// Write accepted records in independent batches; a failed batch does not
/// stop or roll back the others.
pub async fn commit_in_batches(
    store: &dyn CatalogStore,
    records: &[CommitRecord],
    batch_size: usize,
) -> CommitReport {
    let mut report = CommitReport::default();
    for (index, batch) in records.chunks(batch_size.max(1)).enumerate() {
        report.batches += 1;
        let committed_at = Utc::now();
        let written = AssertUnwindSafe(store.commit(batch, committed_at))
            .catch_unwind()
            .await;
        match written {
            Ok(Ok(())) => {
                report.committed += batch.len();
                info!(batch = index, rows = batch.len(), "commit batch written");
            }
            Ok(Err(err)) => {
                report.failed_batches += 1;
                error!(
                    critical = true,
                    batch = index,
                    rows = batch.len(),
                    error = %err,
                    "commit batch failed"
                );
            }
            Err(_) => {
                report.failed_batches += 1;
                error!(
                    critical = true,
                    batch = index,
                    rows = batch.len(),
                    "commit batch panicked"
                );
            }
        }
    }
    report
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub shards: usize,
    pub exhausted_shards: usize,
    pub raw_records: usize,
    pub normalized_records: usize,
    pub unique_records: usize,
    pub baseline_batches: usize,
    pub failed_baseline_batches: usize,
    pub new_records: usize,
    pub changed_records: usize,
    pub unchanged_records: usize,
    pub notified: usize,
    pub skipped: usize,
    pub committed: usize,
    pub failed_commit_batches: usize,
}

/// One batch run. Shared client handles are injected, never global.
pub struct Pipeline {
    settings: PipelineSettings,
    fetcher: ShardFetcher<Arc<dyn SearchClient>>,
    store: Arc<dyn CatalogStore>,
    renderer: Box<dyn Renderer>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        client: Arc<dyn SearchClient>,
        store: Arc<dyn CatalogStore>,
    ) -> Self {
        let fetcher = ShardFetcher::new(client, settings.max_concurrent_requests, settings.retry);
        Self {
            settings,
            fetcher,
            store,
            renderer: Box::<HtmlTextRenderer>::default(),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_renderer(mut self, renderer: Box<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub async fn run_once(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        self.run_stages(run_id)
            .instrument(info_span!("pipeline_run", %run_id))
            .await
    }

    async fn run_stages(&self, run_id: Uuid) -> RunSummary {
        let started_at = Utc::now();
        let clock = Instant::now();

        let shard_results = self.fetcher.fetch_all(&self.settings.shards).await;
        let exhausted_shards = shard_results.iter().filter(|r| r.exhausted).count();
        let raw_records: usize = shard_results.iter().map(|r| r.records.len()).sum();
        info!(raw_records, exhausted_shards, "fetched raw records");

        let normalized = normalize_all(shard_results.iter().flat_map(|r| r.records.iter()));
        let normalized_records = normalized.len();
        let unique = dedupe(normalized);
        let unique_records = unique.len();
        info!(normalized_records, unique_records, "normalized and deduplicated");

        let ids: Vec<String> = unique.iter().map(|r| r.id.clone()).collect();
        let mut load =
            load_baselines(self.store.as_ref(), &ids, self.settings.baseline_batch_size).await;
        info!(
            baselines = load.baselines.len(),
            batches = load.batches,
            failed_batches = load.failed_batches,
            "baselines loaded"
        );

        let changes = diff_all(unique, &mut load.baselines);
        let count = |c: Classification| changes.iter().filter(|x| x.classification() == c).count();
        let (new_records, changed_records, unchanged_records) = (
            count(Classification::New),
            count(Classification::Changed),
            count(Classification::Unchanged),
        );
        info!(new_records, changed_records, unchanged_records, "diff complete");

        let gate = NotificationGate::new(self.renderer.as_ref(), self.notifier.as_deref());
        let report = gate.process(changes).await;
        let notified = report.notified();
        let skipped = report.count(GateState::Skipped);
        let queue = report.into_commit_queue();

        let commit = if queue.is_empty() {
            info!("nothing to commit");
            CommitReport::default()
        } else {
            commit_in_batches(self.store.as_ref(), &queue, self.settings.commit_batch_size).await
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: clock.elapsed().as_millis() as u64,
            shards: self.settings.shards.len(),
            exhausted_shards,
            raw_records,
            normalized_records,
            unique_records,
            baseline_batches: load.batches,
            failed_baseline_batches: load.failed_batches,
            new_records,
            changed_records,
            unchanged_records,
            notified,
            skipped,
            committed: commit.committed,
            failed_commit_batches: commit.failed_batches,
        };
        info!(
            elapsed_ms = summary.elapsed_ms,
            committed = summary.committed,
            skipped = summary.skipped,
            "pipeline run finished"
        );
        summary
    }
}

pub async fn connect_store(config: &PipelineConfig) -> Result<PgCatalogStore> {
    PgCatalogStore::connect(&config.database_url, 5).await
}

pub async fn migrate_from_env() -> Result<()> {
    let config = PipelineConfig::from_env()?;
    let store = connect_store(&config).await?;
    store.migrate().await.context("applying catalog migrations")?;
    Ok(())
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env()?;
    let client = HttpSearchClient::new(config.search_endpoint())?;
    let store = connect_store(&config).await?;

    let mut pipeline = Pipeline::new(config.settings(), Arc::new(client), Arc::new(store))
        .with_renderer(Box::new(HtmlTextRenderer::new(true)));
    match config.telegram() {
        Some(telegram) => match TelegramNotifier::new(telegram) {
            Ok(notifier) => pipeline = pipeline.with_notifier(Arc::new(notifier)),
            Err(err) => {
                error!(error = %err, "telegram notifier unavailable; changes will be skipped")
            }
        },
        None => warn!("telegram credentials not set; changed records will be skipped"),
    }

    Ok(pipeline.run_once().await)
}
