use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_adapters::{FetchError, SearchClient};
use pricewatch_core::{CatalogRecord, ChangeSet, CommitRecord, RawRecord};
use pricewatch_notify::{Notifier, Payload, RenderError, Renderer};
use pricewatch_storage::{CatalogStore, RetryPolicy, StoreError};
use pricewatch_sync::{Pipeline, PipelineSettings};
use rust_decimal::Decimal;
use serde_json::json;

#[derive(Default)]
struct CannedSearch {
    by_shard: HashMap<String, Vec<RawRecord>>,
}

impl CannedSearch {
    fn with(mut self, shard: &str, records: Vec<serde_json::Value>) -> Self {
        let parsed = records
            .into_iter()
            .map(|v| serde_json::from_value(v).expect("raw record"))
            .collect();
        self.by_shard.insert(shard.to_string(), parsed);
        self
    }
}

#[async_trait]
impl SearchClient for CannedSearch {
    async fn search(&self, shard: &str) -> Result<Vec<RawRecord>, FetchError> {
        Ok(self.by_shard.get(shard).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
struct MemoryStore {
    current: Mutex<HashMap<String, CatalogRecord>>,
    history: Mutex<Vec<CommitRecord>>,
    baseline_calls: Mutex<Vec<usize>>,
}

impl MemoryStore {
    fn seeded(records: Vec<CatalogRecord>) -> Self {
        let store = Self::default();
        {
            let mut current = store.current.lock().unwrap();
            for record in records {
                current.insert(record.id.clone(), record);
            }
        }
        store
    }

    fn price_of(&self, id: &str) -> Option<Decimal> {
        self.current.lock().unwrap().get(id).and_then(|r| r.price)
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn fetch_baseline(&self, ids: &[String]) -> Result<Vec<CatalogRecord>, StoreError> {
        self.baseline_calls.lock().unwrap().push(ids.len());
        let current = self.current.lock().unwrap();
        Ok(ids.iter().filter_map(|id| current.get(id).cloned()).collect())
    }

    async fn commit(
        &self,
        records: &[CommitRecord],
        _committed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut current = self.current.lock().unwrap();
        for row in records {
            current.insert(row.record.id.clone(), row.record.clone());
        }
        self.history.lock().unwrap().extend_from_slice(records);
        Ok(())
    }
}

struct RecordingNotifier {
    result: bool,
    sent: Mutex<Vec<Payload>>,
}

impl RecordingNotifier {
    fn answering(result: bool) -> Arc<Self> {
        Arc::new(Self {
            result,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, payload: &Payload) -> bool {
        self.sent.lock().unwrap().push(payload.clone());
        self.result
    }
}

/// Captures the prices each rendered change carried.
#[derive(Default)]
struct PriceCapture {
    seen: Arc<Mutex<Vec<(Option<Decimal>, Option<Decimal>)>>>,
}

impl Renderer for PriceCapture {
    fn render(&self, change: &ChangeSet) -> Result<Payload, RenderError> {
        self.seen
            .lock()
            .unwrap()
            .push((change.previous_price(), change.current_price()));
        Ok(Payload::Text {
            body: change.id().to_string(),
        })
    }
}

fn settings(shards: &[&str]) -> PipelineSettings {
    PipelineSettings {
        shards: shards.iter().map(|s| s.to_string()).collect(),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        ..PipelineSettings::default()
    }
}

fn stored(id: &str, price: &str) -> CatalogRecord {
    CatalogRecord::new(id).with_price(price.parse().unwrap())
}

fn dec(raw: &str) -> Decimal {
    raw.parse().unwrap()
}

#[tokio::test]
async fn equal_price_is_neither_notified_nor_committed() {
    let search = CannedSearch::default().with("pa", vec![json!({"id": "42", "price": "10.00"})]);
    let store = Arc::new(MemoryStore::seeded(vec![stored("42", "10")]));
    let notifier = RecordingNotifier::answering(true);

    let summary = Pipeline::new(settings(&["pa"]), Arc::new(search), store.clone())
        .with_notifier(notifier.clone())
        .run_once()
        .await;

    assert_eq!(summary.unchanged_records, 1);
    assert_eq!(notifier.sent(), 0);
    assert_eq!(summary.committed, 0);
    assert!(store.history.lock().unwrap().is_empty());
}

#[tokio::test]
async fn delivered_change_is_committed_with_previous_price() {
    let search = CannedSearch::default().with("pa", vec![json!({"id": "42", "price": "12.50"})]);
    let store = Arc::new(MemoryStore::seeded(vec![stored("42", "10.00")]));
    let notifier = RecordingNotifier::answering(true);
    let renderer = PriceCapture::default();
    let seen = renderer.seen.clone();

    let summary = Pipeline::new(settings(&["pa"]), Arc::new(search), store.clone())
        .with_notifier(notifier.clone())
        .with_renderer(Box::new(renderer))
        .run_once()
        .await;

    assert_eq!(summary.changed_records, 1);
    assert_eq!(summary.notified, 1);
    assert_eq!(summary.committed, 1);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(Some(dec("10.00")), Some(dec("12.50")))]
    );
    assert_eq!(store.price_of("42"), Some(dec("12.50")));
    let history = store.history.lock().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].previous_price, Some(dec("10.00")));
}

#[tokio::test]
async fn failed_notification_leaves_baseline_untouched() {
    let search = CannedSearch::default().with("pa", vec![json!({"id": "42", "price": "12.50"})]);
    let store = Arc::new(MemoryStore::seeded(vec![stored("42", "10.00")]));
    let notifier = RecordingNotifier::answering(false);

    let summary = Pipeline::new(settings(&["pa"]), Arc::new(search), store.clone())
        .with_notifier(notifier.clone())
        .run_once()
        .await;

    assert_eq!(notifier.sent(), 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.committed, 0);
    assert_eq!(store.price_of("42"), Some(dec("10.00")));
}

#[tokio::test]
async fn new_record_is_committed_without_notification() {
    let search = CannedSearch::default().with("pa", vec![json!({"id": "99", "price": 5})]);
    let store = Arc::new(MemoryStore::default());
    let notifier = RecordingNotifier::answering(true);

    let summary = Pipeline::new(settings(&["pa"]), Arc::new(search), store.clone())
        .with_notifier(notifier.clone())
        .run_once()
        .await;

    assert_eq!(summary.new_records, 1);
    assert_eq!(notifier.sent(), 0);
    assert_eq!(summary.committed, 1);
    assert_eq!(store.price_of("99"), Some(dec("5")));
    assert_eq!(store.history.lock().unwrap()[0].previous_price, None);
}

#[tokio::test]
async fn changes_are_skipped_without_a_notifier() {
    let search = CannedSearch::default().with(
        "pa",
        vec![
            json!({"id": "42", "price": "12.50"}),
            json!({"id": "99", "price": "3"}),
        ],
    );
    let store = Arc::new(MemoryStore::seeded(vec![stored("42", "10.00")]));

    let summary = Pipeline::new(settings(&["pa"]), Arc::new(search), store.clone())
        .run_once()
        .await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.committed, 1);
    assert_eq!(store.price_of("42"), Some(dec("10.00")));
    assert_eq!(store.price_of("99"), Some(dec("3")));
}

#[tokio::test]
async fn second_run_over_same_data_is_quiet() {
    let search = Arc::new(CannedSearch::default().with(
        "pa",
        vec![
            json!({"id": "42", "price": "12.50"}),
            json!({"id": "99", "price": "3"}),
        ],
    ));
    let store = Arc::new(MemoryStore::seeded(vec![stored("42", "10.00")]));
    let notifier = RecordingNotifier::answering(true);
    let pipeline = Pipeline::new(settings(&["pa"]), search, store.clone())
        .with_notifier(notifier.clone());

    let first = pipeline.run_once().await;
    let second = pipeline.run_once().await;

    assert_eq!(first.committed, 2);
    assert_eq!(notifier.sent(), 1);
    assert_eq!(second.unchanged_records, 2);
    assert_eq!(second.notified, 0);
    assert_eq!(second.committed, 0);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn record_returned_by_two_shards_is_processed_once() {
    let search = CannedSearch::default()
        .with("pa", vec![json!({"id": 7, "price": "1.00"})])
        .with("an", vec![json!({"id": "7", "name": "Panadol", "price": "1.00"})]);
    let store = Arc::new(MemoryStore::default());

    let summary = Pipeline::new(settings(&["pa", "an"]), Arc::new(search), store.clone())
        .run_once()
        .await;

    assert_eq!(summary.raw_records, 2);
    assert_eq!(summary.unique_records, 1);
    assert_eq!(summary.committed, 1);
    let current = store.current.lock().unwrap();
    assert_eq!(current["7"].name_en.as_deref(), Some("Panadol"));
}

#[tokio::test]
async fn records_without_id_never_reach_the_store() {
    let search = CannedSearch::default().with(
        "pa",
        vec![
            json!({"name": "orphan", "price": "1"}),
            json!({"id": "", "price": "1"}),
            json!({"id": "5", "price": "1"}),
        ],
    );
    let store = Arc::new(MemoryStore::default());

    let summary = Pipeline::new(settings(&["pa"]), Arc::new(search), store.clone())
        .run_once()
        .await;

    assert_eq!(summary.raw_records, 3);
    assert_eq!(summary.normalized_records, 1);
    assert_eq!(*store.baseline_calls.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn full_shard_space_is_covered() {
    let store = Arc::new(MemoryStore::default());
    let summary = Pipeline::new(
        PipelineSettings::default(),
        Arc::new(CannedSearch::default()),
        store.clone(),
    )
    .run_once()
    .await;

    assert_eq!(summary.shards, 676);
    assert_eq!(summary.exhausted_shards, 0);
    assert_eq!(summary.unique_records, 0);
    assert!(store.baseline_calls.lock().unwrap().is_empty());
}
