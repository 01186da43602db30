//! Persistence seam for the dispatch engine.
//!
//! Every method is blocking; the engine calls them from
//! `tokio::task::spawn_blocking`. Uniqueness of delivery records and the
//! atomicity of counter increments are the store's responsibility, not the
//! caller's.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use schoolbell_core::error::Result;
use schoolbell_core::types::{Channel, DomainEvent, Recipient, RunMode};
use serde::{Deserialize, Serialize};

/// Which candidate events a run pulls.
#[derive(Debug, Clone, PartialEq)]
pub struct EventQuery {
    /// Date window; ignored when `reference_ids` is non-empty.
    pub day: NaiveDate,
    pub institution_id: Option<String>,
    /// Targeted re-run.
    pub reference_ids: Vec<String>,
    /// Restrict to these event types; empty means all.
    pub event_types: Vec<String>,
}

/// One saved override row. `None` fields fall back to the category default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstitutionSetting {
    pub institution_id: String,
    pub category_id: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,
    #[serde(default, with = "opt_hhmm")]
    pub schedule_time: Option<NaiveTime>,
    #[serde(default)]
    pub schedule_days: Option<Vec<Weekday>>,
    #[serde(default)]
    pub template: Option<String>,
}

mod opt_hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_some(&t.format("%H:%M").to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| schoolbell_core::types::hhmm::parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// A guardian's channel opt-in choice for one institution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preference {
    pub recipient_id: String,
    pub institution_id: String,
    pub channel: Channel,
    pub opted_in: bool,
}

/// Status of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Every attempted channel succeeded.
    Sent,
    /// At least one channel succeeded and at least one failed.
    Partial,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Partial => "partial",
        }
    }
}

/// Idempotency ledger row, keyed by (event type, reference id, recipient id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub event_type: String,
    pub reference_id: String,
    pub recipient_id: String,
    pub institution_id: String,
    pub channels: Vec<Channel>,
    pub message: String,
    pub status: DeliveryStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Result of an insert into a uniquely keyed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The key already existed; nothing was written.
    Duplicate,
}

/// Rate-limit counter key. A new day is a new key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub institution_id: String,
    pub recipient_id: String,
    pub channel: Channel,
    pub day: NaiveDate,
}

/// Audit row for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub mode: RunMode,
    pub institution_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: serde_json::Value,
}

/// Everything the engine reads and writes.
pub trait NotifyStore: Send + Sync {
    /// Candidate events for a run. An error here aborts the run.
    fn fetch_events(&self, query: &EventQuery) -> Result<Vec<DomainEvent>>;

    fn institution_setting(&self, institution_id: &str, category_id: &str) -> Result<Option<InstitutionSetting>>;

    /// Insert or replace the override row for (institution, category).
    fn upsert_setting(&self, setting: &InstitutionSetting) -> Result<()>;

    /// Guardians of a subject, best-ranked first. Opt-outs are not filled in.
    fn guardians(&self, institution_id: &str, subject_id: &str) -> Result<Vec<Recipient>>;

    fn opted_out_channels(&self, recipient_id: &str, institution_id: &str) -> Result<Vec<Channel>>;

    fn set_preference(&self, preference: &Preference) -> Result<()>;

    fn delivery_exists(&self, event_type: &str, reference_id: &str, recipient_id: &str) -> Result<bool>;

    /// Must fail closed on a duplicate key: report [`InsertOutcome::Duplicate`].
    fn insert_delivery(&self, record: &DeliveryRecord) -> Result<InsertOutcome>;

    fn rate_count(&self, key: &RateKey) -> Result<u32>;

    /// Atomic increment-or-insert, never past `ceiling`. Returns the new count.
    fn increment_rate(&self, key: &RateKey, ceiling: Option<u32>) -> Result<u32>;

    fn record_run(&self, run: &RunRecord) -> Result<()>;
}
