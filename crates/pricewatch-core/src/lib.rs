//! Core catalog model and change-detection types for pricewatch.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "pricewatch-core";

/// One record as returned by the price source's search endpoint.
///
/// Every field is kept as loose JSON because upstream mixes strings and
/// numbers for the same key across records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub id: Option<JsonValue>,
    #[serde(default)]
    pub name: Option<JsonValue>,
    #[serde(default)]
    pub arabic: Option<JsonValue>,
    #[serde(default)]
    pub active: Option<JsonValue>,
    #[serde(default)]
    pub company: Option<JsonValue>,
    #[serde(default)]
    pub price: Option<JsonValue>,
    #[serde(default, rename = "Date_updated")]
    pub date_updated: Option<JsonValue>,
    #[serde(default)]
    pub units: Option<JsonValue>,
    #[serde(default)]
    pub barcode: Option<JsonValue>,
    #[serde(default)]
    pub dosage_form: Option<JsonValue>,
    #[serde(default)]
    pub uses: Option<JsonValue>,
    #[serde(default)]
    pub img: Option<JsonValue>,
}

/// Canonical tracked catalog item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: String,
    pub name_en: Option<String>,
    pub name_ar: Option<String>,
    pub active_ingredients: Option<String>,
    pub manufacturer: Option<String>,
    pub price: Option<Decimal>,
    pub last_price_update: Option<DateTime<Utc>>,
    pub units: Option<String>,
    pub barcode: Option<String>,
    pub dosage_form: Option<String>,
    pub uses_ar: Option<String>,
    pub image_url: Option<String>,
}

impl CatalogRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name_en: None,
            name_ar: None,
            active_ingredients: None,
            manufacturer: None,
            price: None,
            last_price_update: None,
            units: None,
            barcode: None,
            dosage_form: None,
            uses_ar: None,
            image_url: None,
        }
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    /// Number of optional attributes carrying a value.
    pub fn populated_fields(&self) -> usize {
        let texts = [
            &self.name_en,
            &self.name_ar,
            &self.active_ingredients,
            &self.manufacturer,
            &self.units,
            &self.barcode,
            &self.dosage_form,
            &self.uses_ar,
            &self.image_url,
        ];
        texts.iter().filter(|v| v.is_some()).count()
            + usize::from(self.price.is_some())
            + usize::from(self.last_price_update.is_some())
    }
}

/// Outcome of comparing a candidate against its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    New,
    Changed,
    Unchanged,
}

/// A candidate paired with its baseline. A changed record always carries one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSet {
    New {
        candidate: CatalogRecord,
    },
    Changed {
        candidate: CatalogRecord,
        baseline: CatalogRecord,
    },
    Unchanged {
        candidate: CatalogRecord,
        baseline: CatalogRecord,
    },
}

impl ChangeSet {
    pub fn classification(&self) -> Classification {
        match self {
            Self::New { .. } => Classification::New,
            Self::Changed { .. } => Classification::Changed,
            Self::Unchanged { .. } => Classification::Unchanged,
        }
    }

    pub fn candidate(&self) -> &CatalogRecord {
        match self {
            Self::New { candidate }
            | Self::Changed { candidate, .. }
            | Self::Unchanged { candidate, .. } => candidate,
        }
    }

    pub fn baseline(&self) -> Option<&CatalogRecord> {
        match self {
            Self::New { .. } => None,
            Self::Changed { baseline, .. } | Self::Unchanged { baseline, .. } => Some(baseline),
        }
    }

    pub fn id(&self) -> &str {
        &self.candidate().id
    }

    pub fn previous_price(&self) -> Option<Decimal> {
        self.baseline().and_then(|b| b.price)
    }

    pub fn current_price(&self) -> Option<Decimal> {
        self.candidate().price
    }

    /// Row to persist if this change is accepted for commit.
    pub fn into_commit_record(self) -> CommitRecord {
        let previous_price = self.previous_price();
        let record = match self {
            Self::New { candidate }
            | Self::Changed { candidate, .. }
            | Self::Unchanged { candidate, .. } => candidate,
        };
        CommitRecord {
            record,
            previous_price,
        }
    }
}

/// Boolean result of one delivery attempt for a change's rendered payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOutcome {
    pub delivered: bool,
}

impl NotificationOutcome {
    pub fn delivered() -> Self {
        Self { delivered: true }
    }

    pub fn failed() -> Self {
        Self { delivered: false }
    }
}

/// Accepted record queued for the current-state upsert and history append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub record: CatalogRecord,
    pub previous_price: Option<Decimal>,
}

/// Exact decimal equality, so `10.00` matches `10`. A price present on only
/// one side is always a difference.
pub fn prices_match(current: Option<Decimal>, previous: Option<Decimal>) -> bool {
    current == previous
}

pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
}

/// Exact decimal from a JSON string or number. Numbers go through their
/// textual form so no binary float rounding leaks in.
pub fn decimal_from_json(value: &JsonValue) -> Option<Decimal> {
    match value {
        JsonValue::String(s) => parse_decimal(s),
        JsonValue::Number(n) => parse_decimal(&n.to_string()),
        _ => None,
    }
}

/// Epoch-millisecond text to an instant. Empty, non-digit and zero map to `None`.
pub fn timestamp_from_epoch_millis(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let millis: i64 = raw.parse().ok()?;
    if millis == 0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis)
}

pub fn timestamp_from_json(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => timestamp_from_epoch_millis(s),
        JsonValue::Number(n) => n
            .as_u64()
            .and_then(|ms| timestamp_from_epoch_millis(&ms.to_string())),
        _ => None,
    }
}

/// Scalar JSON rendered as text; null and compound values map to `None`.
pub fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn dec(raw: &str) -> Option<Decimal> {
        parse_decimal(raw)
    }

    #[test]
    fn decimal_equality_ignores_scale() {
        assert!(prices_match(dec("10.00"), dec("10")));
        assert!(!prices_match(dec("10.00"), dec("12.50")));
        assert!(!prices_match(dec("0.1"), dec("0.10000001")));
    }

    #[test]
    fn null_and_non_null_always_differ() {
        assert!(!prices_match(None, dec("10")));
        assert!(!prices_match(dec("10"), None));
        assert!(!prices_match(dec("0"), None));
        assert!(prices_match(None, None));
    }

    #[test]
    fn exponent_and_padded_prices_parse() {
        assert_eq!(parse_decimal(" 12.5 "), dec("12.50"));
        assert_eq!(parse_decimal("1.25e1"), dec("12.5"));
        assert_eq!(parse_decimal("12,50"), None);
        assert_eq!(parse_decimal("   "), None);
    }

    #[test]
    fn json_prices_parse_exactly() {
        assert_eq!(decimal_from_json(&json!("12.50")), Decimal::from_str("12.5").ok());
        assert_eq!(decimal_from_json(&json!(0.1)), Decimal::from_str("0.1").ok());
        assert_eq!(decimal_from_json(&json!("n/a")), None);
        assert_eq!(decimal_from_json(&json!("")), None);
        assert_eq!(decimal_from_json(&JsonValue::Null), None);
    }

    #[test]
    fn epoch_millis_edge_cases() {
        assert_eq!(timestamp_from_epoch_millis(""), None);
        assert_eq!(timestamp_from_epoch_millis("0"), None);
        assert_eq!(timestamp_from_epoch_millis("17x"), None);
        assert_eq!(timestamp_from_epoch_millis("-5"), None);
        assert_eq!(
            timestamp_from_epoch_millis("1700000000000"),
            Utc.timestamp_millis_opt(1_700_000_000_000).single()
        );
        assert_eq!(
            timestamp_from_json(&json!(1_700_000_000_000u64)),
            Utc.timestamp_millis_opt(1_700_000_000_000).single()
        );
    }

    #[test]
    fn changed_set_exposes_previous_price() {
        let candidate = CatalogRecord::new("42").with_price(Decimal::new(1250, 2));
        let baseline = CatalogRecord::new("42").with_price(Decimal::new(1000, 2));
        let change = ChangeSet::Changed {
            candidate,
            baseline,
        };
        assert_eq!(change.classification(), Classification::Changed);
        assert_eq!(change.previous_price(), Some(Decimal::new(1000, 2)));

        let commit = change.into_commit_record();
        assert_eq!(commit.record.price, Some(Decimal::new(1250, 2)));
        assert_eq!(commit.previous_price, Some(Decimal::new(1000, 2)));
    }

    #[test]
    fn populated_fields_counts_values() {
        let mut record = CatalogRecord::new("1");
        assert_eq!(record.populated_fields(), 0);
        record.name_en = Some("Panadol".into());
        record.price = Some(Decimal::ONE);
        assert_eq!(record.populated_fields(), 2);
    }
}
