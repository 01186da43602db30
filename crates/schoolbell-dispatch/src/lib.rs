//! # Schoolbell Dispatch
//!
//! Turns school domain events (absences, invoices, payments) into guardian
//! notifications, at most once per event per guardian.
//!
//! ## Design Principles
//! - Stateless runs: every invocation reads its window of events and exits
//! - SQLite persistence, WAL mode, shared safely by overlapping runs
//! - The ledger's unique key is the dedup mechanism, not a pre-check
//! - One slow provider never stalls the batch (per-send timeout)
//!
//! ## Architecture
//! ```text
//! TriggerEvaluator::run(RunRequest)
//!   ├── NotifyStore::fetch_events (day window or targeted ids)
//!   ├── SettingsResolver  : saved override ▸ catalog default, per field
//!   ├── RecipientResolver : guardians + per-channel opt-outs
//!   ├── DedupLedger       : (event type, reference, recipient) unique
//!   ├── RateLimiter       : daily ceiling per recipient and channel
//!   └── ChannelDispatcher : in_app / sms / email senders
//! ```

pub mod catalog;
pub mod engine;
pub mod ledger;
pub mod persistence;
pub mod rate_limit;
pub mod recipients;
pub mod settings;
pub mod store;
pub mod template;

pub use catalog::Catalog;
pub use engine::{EventOutcome, EventResult, RunRequest, RunSummary, TriggerEvaluator};
pub use ledger::{DedupLedger, RecordOutcome};
pub use persistence::NotifyDb;
pub use rate_limit::RateLimiter;
pub use recipients::RecipientResolver;
pub use settings::{EffectiveSetting, SettingsResolver, override_or};
pub use store::{DeliveryRecord, DeliveryStatus, EventQuery, InstitutionSetting, NotifyStore, Preference};
