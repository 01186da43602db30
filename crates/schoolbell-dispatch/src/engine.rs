//! Trigger evaluator: turns a window of domain events into guardian
//! notifications.
//!
//! ```text
//! fetch events ──► per event (bounded pool)
//!                    ├─ resolve setting (memoised per run)
//!                    ├─ resolve guardians
//!                    └─ per guardian (concurrent)
//!                         ledger check → channels in preference order
//!                           (available? opted in? address? under ceiling?)
//!                         → render → send → count → ledger write
//! ```
//!
//! Overlapping runs are safe: the ledger's unique key decides who records a
//! delivery, and the counter upsert never passes its ceiling. Within one
//! process, a recipient that is already being handled by another task is
//! skipped, and sends on a rate-limited key are serialised.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use schoolbell_channels::ChannelDispatcher;
use schoolbell_core::config::SchoolbellConfig;
use schoolbell_core::error::{Result, SchoolbellError};
use schoolbell_core::types::{Channel, DomainEvent, Recipient, RenderedMessage, RunMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::Catalog;
use crate::ledger::{DedupLedger, RecordOutcome};
use crate::persistence::NotifyDb;
use crate::rate_limit::RateLimiter;
use crate::recipients::RecipientResolver;
use crate::settings::{EffectiveSetting, SettingsResolver};
use crate::store::{DeliveryRecord, DeliveryStatus, EventQuery, NotifyStore, RateKey, RunRecord};
use crate::template;

/// One invocation of the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub institution_id: Option<String>,
    /// Targeted re-run; when set the date window is ignored.
    #[serde(default)]
    pub reference_ids: Vec<String>,
    /// Restrict to these event types; empty means every type.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Recorded for audit only.
    #[serde(default)]
    pub mode: RunMode,
    /// Defaults to today (UTC). Also the day rate-limit counters are kept for.
    #[serde(default)]
    pub day: Option<NaiveDate>,
}

/// Terminal state of one event within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Sent,
    PartiallySent,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    pub event_type: String,
    pub reference_id: String,
    pub outcome: EventOutcome,
}

/// JSON summary returned by every run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: RunMode,
    pub events_considered: u32,
    pub sent: u32,
    pub partially_sent: u32,
    pub failed: u32,
    pub skipped: u32,
    pub sent_per_channel: BTreeMap<String, u32>,
    pub failed_per_channel: BTreeMap<String, u32>,
    /// Non-fatal errors, one per failed send or failed lookup.
    pub errors: Vec<String>,
    pub events: Vec<EventResult>,
}

impl RunSummary {
    fn absorb(&mut self, report: EventReport) {
        match report.outcome {
            EventOutcome::Sent => self.sent += 1,
            EventOutcome::PartiallySent => self.partially_sent += 1,
            EventOutcome::Failed => self.failed += 1,
            EventOutcome::Skipped => self.skipped += 1,
        }
        for channel in report.sent {
            *self.sent_per_channel.entry(channel.to_string()).or_insert(0) += 1;
        }
        for channel in report.failed {
            *self.failed_per_channel.entry(channel.to_string()).or_insert(0) += 1;
        }
        self.errors.extend(report.errors);
        self.events.push(EventResult {
            event_type: report.event_type,
            reference_id: report.reference_id,
            outcome: report.outcome,
        });
    }
}

// ─── Internal reports ───────────────────────────────────────

#[derive(Default)]
struct RecipientReport {
    attempts: u32,
    sent: Vec<Channel>,
    failed: Vec<Channel>,
    errors: Vec<String>,
}

struct EventReport {
    index: usize,
    event_type: String,
    reference_id: String,
    outcome: EventOutcome,
    sent: Vec<Channel>,
    failed: Vec<Channel>,
    errors: Vec<String>,
}

impl EventReport {
    fn new(index: usize, event: &DomainEvent, outcome: EventOutcome) -> Self {
        Self {
            index,
            event_type: event.event_type.clone(),
            reference_id: event.reference_id.clone(),
            outcome,
            sent: Vec::new(),
            failed: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn failed_with(index: usize, event: &DomainEvent, error: String) -> Self {
        let mut report = Self::new(index, event, EventOutcome::Failed);
        report.errors.push(error);
        report
    }
}

fn outcome_of(attempts: u32, successes: u32) -> EventOutcome {
    if attempts == 0 {
        EventOutcome::Skipped
    } else if successes == attempts {
        EventOutcome::Sent
    } else if successes == 0 {
        EventOutcome::Failed
    } else {
        EventOutcome::PartiallySent
    }
}

/// Per-run state shared by the event tasks.
struct RunContext {
    day: NaiveDate,
    settings: Mutex<HashMap<(String, String), EffectiveSetting>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run blocking store work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SchoolbellError::Other(format!("Blocking task failed: {e}")))?
}

// ─── In-process claims ──────────────────────────────────────

type Triple = (String, String, String);

/// Recipients currently being handled by some task in this process.
#[derive(Clone, Default)]
struct InFlight {
    set: Arc<Mutex<HashSet<Triple>>>,
}

struct Claim {
    set: Arc<Mutex<HashSet<Triple>>>,
    key: Triple,
}

impl InFlight {
    fn try_claim(&self, key: Triple) -> Option<Claim> {
        if lock(&self.set).insert(key.clone()) {
            Some(Claim {
                set: self.set.clone(),
                key,
            })
        } else {
            None
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.key);
    }
}

type SendLocks = Arc<Mutex<HashMap<RateKey, Arc<tokio::sync::Mutex<()>>>>>;

// ─── Evaluator ──────────────────────────────────────────────

/// The dispatch engine.
#[derive(Clone)]
pub struct TriggerEvaluator {
    store: Arc<dyn NotifyStore>,
    dispatcher: Arc<ChannelDispatcher>,
    settings: SettingsResolver,
    recipients: RecipientResolver,
    ledger: DedupLedger,
    rate_limiter: RateLimiter,
    workers: usize,
    in_flight: InFlight,
    send_locks: SendLocks,
}

impl TriggerEvaluator {
    pub fn new(
        store: Arc<dyn NotifyStore>,
        catalog: Arc<Catalog>,
        dispatcher: Arc<ChannelDispatcher>,
        ceilings: BTreeMap<Channel, u32>,
        workers: usize,
    ) -> Self {
        Self {
            settings: SettingsResolver::new(catalog, store.clone()),
            recipients: RecipientResolver::new(store.clone()),
            ledger: DedupLedger::new(store.clone()),
            rate_limiter: RateLimiter::new(ceilings, store.clone()),
            store,
            dispatcher,
            workers: workers.max(1),
            in_flight: InFlight::default(),
            send_locks: Arc::default(),
        }
    }

    /// Wire the engine from configuration: catalog overrides, channel
    /// senders, ceilings and pool size. The database doubles as the in-app inbox.
    pub fn from_config(config: &SchoolbellConfig, db: Arc<NotifyDb>) -> Result<Self> {
        let catalog = Arc::new(Catalog::with_overrides(&config.categories));
        let dispatcher = Arc::new(ChannelDispatcher::from_config(config, db.clone()));
        let ceilings = config.dispatch.ceilings()?;
        tracing::info!(
            "Dispatch engine ready: {} categories, channels {:?}, {} workers",
            catalog.len(),
            dispatcher.available_channels(),
            config.dispatch.workers
        );
        Ok(Self::new(db, catalog, dispatcher, ceilings, config.dispatch.workers))
    }

    pub fn catalog(&self) -> &Catalog {
        self.settings.catalog()
    }

    pub fn settings(&self) -> &SettingsResolver {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn NotifyStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &ChannelDispatcher {
        &self.dispatcher
    }

    /// Evaluate one window of events. Only a failed event fetch is an `Err`;
    /// everything else is reported in the summary.
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let day = request.day.unwrap_or_else(|| started_at.date_naive());

        let query = EventQuery {
            day,
            institution_id: request.institution_id.clone(),
            reference_ids: request.reference_ids.clone(),
            event_types: request.event_types.clone(),
        };
        let store = self.store.clone();
        let events = blocking(move || store.fetch_events(&query)).await.map_err(|e| {
            tracing::error!("Run {run_id} aborted: could not fetch events: {e}");
            e
        })?;
        tracing::info!("🔔 Run {run_id} ({}): {} candidate events for {day}", request.mode, events.len());

        let ctx = RunContext {
            day,
            settings: Mutex::new(HashMap::new()),
        };
        let mut reports: Vec<EventReport> = stream::iter(events.into_iter().enumerate())
            .map(|(index, event)| self.process_event(&ctx, index, event))
            .buffer_unordered(self.workers)
            .collect()
            .await;
        reports.sort_by_key(|r| r.index);

        lock(&self.send_locks).retain(|_, l| Arc::strong_count(l) > 1);

        let mut summary = RunSummary {
            run_id: run_id.clone(),
            mode: request.mode,
            events_considered: reports.len() as u32,
            ..Default::default()
        };
        for report in reports {
            summary.absorb(report);
        }

        let record = RunRecord {
            id: run_id.clone(),
            mode: request.mode,
            institution_id: request.institution_id,
            started_at,
            finished_at: Utc::now(),
            summary: serde_json::to_value(&summary)?,
        };
        let store = self.store.clone();
        if let Err(e) = blocking(move || store.record_run(&record)).await {
            tracing::warn!("Run {run_id}: could not record audit row: {e}");
        }

        tracing::info!(
            "✅ Run {run_id} done: {} sent, {} partial, {} failed, {} skipped",
            summary.sent,
            summary.partially_sent,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    async fn effective_setting(&self, ctx: &RunContext, event: &DomainEvent) -> Result<EffectiveSetting> {
        let memo_key = (event.institution_id.clone(), event.event_type.clone());
        if let Some(hit) = lock(&ctx.settings).get(&memo_key) {
            return Ok(hit.clone());
        }
        let resolver = self.settings.clone();
        let (inst, cat) = memo_key.clone();
        let setting = blocking(move || resolver.resolve(&inst, &cat)).await?;
        lock(&ctx.settings).insert(memo_key, setting.clone());
        Ok(setting)
    }

    async fn process_event(&self, ctx: &RunContext, index: usize, event: DomainEvent) -> EventReport {
        let tag = format!("{}/{}", event.event_type, event.reference_id);

        let setting = match self.effective_setting(ctx, &event).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Event {tag} failed: {e}");
                return EventReport::failed_with(index, &event, format!("{tag}: {e}"));
            }
        };
        if !setting.enabled {
            tracing::info!("Event {tag} skipped: {} disabled for {}", setting.category_id, event.institution_id);
            return EventReport::new(index, &event, EventOutcome::Skipped);
        }

        let resolver = self.recipients.clone();
        let (inst, subject) = (event.institution_id.clone(), event.subject_id.clone());
        let guardians = match blocking(move || resolver.resolve_guardians(&inst, &subject)).await {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!("Event {tag} failed: recipients: {e}");
                return EventReport::failed_with(index, &event, format!("{tag}: recipients: {e}"));
            }
        };
        if guardians.is_empty() {
            tracing::info!("Event {tag} skipped: no guardians for {}", event.subject_id);
            return EventReport::new(index, &event, EventOutcome::Skipped);
        }

        let per_recipient = join_all(
            guardians
                .iter()
                .map(|g| self.process_recipient(ctx, &event, &setting, g)),
        )
        .await;

        let mut report = EventReport::new(index, &event, EventOutcome::Skipped);
        let mut attempts = 0;
        for r in per_recipient {
            attempts += r.attempts;
            report.sent.extend(r.sent);
            report.failed.extend(r.failed);
            report.errors.extend(r.errors);
        }
        report.outcome = outcome_of(attempts, report.sent.len() as u32);
        tracing::info!("Event {tag}: {:?} ({} sends, {} failures)", report.outcome, report.sent.len(), report.failed.len());
        report
    }

    async fn process_recipient(
        &self,
        ctx: &RunContext,
        event: &DomainEvent,
        setting: &EffectiveSetting,
        recipient: &Recipient,
    ) -> RecipientReport {
        let mut report = RecipientReport::default();
        let tag = format!("{}/{} → {}", event.event_type, event.reference_id, recipient.id);

        let triple = (event.event_type.clone(), event.reference_id.clone(), recipient.id.clone());
        let Some(_claim) = self.in_flight.try_claim(triple.clone()) else {
            tracing::debug!("{tag}: already being handled by a concurrent run");
            return report;
        };

        let ledger = self.ledger.clone();
        let (event_type, reference_id, recipient_id) = triple;
        match blocking(move || ledger.has_been_sent(&event_type, &reference_id, &recipient_id)).await {
            Ok(false) => {}
            Ok(true) => {
                tracing::debug!("{tag}: already notified");
                return report;
            }
            Err(e) => {
                report.attempts += 1;
                report.errors.push(format!("{tag}: ledger: {e}"));
                return report;
            }
        }

        let mut fields = event.payload.clone();
        fields
            .entry("guardian_name")
            .or_insert_with(|| Value::String(recipient.name.clone()));
        let message = RenderedMessage {
            subject: setting.label.clone(),
            body: template::render(&setting.template, &fields),
        };

        for channel in self.dispatcher.preference_order(&setting.channels) {
            if !self.dispatcher.is_available(channel) {
                tracing::debug!("{tag}: {channel} not configured");
                continue;
            }
            if !recipient.is_opted_in(channel) {
                tracing::debug!("{tag}: opted out of {channel}");
                continue;
            }
            let Some(address) = recipient.address(channel) else {
                tracing::debug!("{tag}: no {channel} address");
                continue;
            };
            self.attempt(ctx, event, recipient, channel, address, &message, &tag, &mut report)
                .await;
        }

        if !report.sent.is_empty() {
            let record = DeliveryRecord {
                event_type: event.event_type.clone(),
                reference_id: event.reference_id.clone(),
                recipient_id: recipient.id.clone(),
                institution_id: event.institution_id.clone(),
                channels: report.sent.clone(),
                message: message.body.clone(),
                status: if report.failed.is_empty() {
                    DeliveryStatus::Sent
                } else {
                    DeliveryStatus::Partial
                },
                recorded_at: Utc::now(),
            };
            let ledger = self.ledger.clone();
            match blocking(move || ledger.record(&record)).await {
                Ok(RecordOutcome::Recorded | RecordOutcome::AlreadyRecorded) => {}
                Err(e) => {
                    tracing::warn!("{tag}: delivered but not recorded: {e}");
                    report.errors.push(format!("{tag}: ledger: {e}"));
                }
            }
        }
        report
    }

    /// One channel for one recipient: ceiling check, send, count.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        ctx: &RunContext,
        event: &DomainEvent,
        recipient: &Recipient,
        channel: Channel,
        address: &str,
        message: &RenderedMessage,
        tag: &str,
        report: &mut RecipientReport,
    ) {
        let key = RateLimiter::key(&event.institution_id, &recipient.id, channel, ctx.day);

        // Serialise admit → send → increment for limited keys.
        let _guard = match self.rate_limiter.ceiling(channel) {
            Some(_) => Some(self.send_lock(&key).lock_owned().await),
            None => None,
        };

        let limiter = self.rate_limiter.clone();
        let admit_key = key.clone();
        match blocking(move || limiter.admit(&admit_key)).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("{tag}: RateLimitExceeded on {channel} for {}", ctx.day);
                return;
            }
            Err(e) => {
                report.attempts += 1;
                report.failed.push(channel);
                report.errors.push(format!("{tag}: {channel}: rate limit: {e}"));
                return;
            }
        }

        report.attempts += 1;
        match self.dispatcher.send(channel, address, message).await {
            Ok(receipt) => {
                tracing::debug!("{tag}: {channel} delivered ({:?})", receipt.provider_id);
                let limiter = self.rate_limiter.clone();
                if let Err(e) = blocking(move || limiter.increment(&key)).await {
                    tracing::warn!("{tag}: {channel} sent but counter not updated: {e}");
                }
                report.sent.push(channel);
            }
            Err(e) => {
                tracing::warn!("{tag}: {channel} failed: {e}");
                report.failed.push(channel);
                report.errors.push(format!("{tag}: {channel}: {e}"));
            }
        }
    }

    fn send_lock(&self, key: &RateKey) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.send_locks)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use schoolbell_channels::InAppSender;
    use schoolbell_core::error::SendError;
    use schoolbell_core::traits::ChannelSender;
    use schoolbell_core::types::DeliveryReceipt;
    use std::time::Duration;

    // ─── Fixtures ───────────────────────────────────────

    struct FakeSender {
        channel: Channel,
        calls: Mutex<Vec<(String, String)>>,
        fail_for: Vec<String>,
        hang_for: Vec<String>,
    }

    impl FakeSender {
        fn new(channel: Channel) -> Self {
            Self {
                channel,
                calls: Mutex::new(Vec::new()),
                fail_for: Vec::new(),
                hang_for: Vec::new(),
            }
        }

        fn failing_for(mut self, address: &str) -> Self {
            self.fail_for.push(address.to_string());
            self
        }

        fn hanging_for(mut self, address: &str) -> Self {
            self.hang_for.push(address.to_string());
            self
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelSender for FakeSender {
        fn channel(&self) -> Channel {
            self.channel
        }
        fn name(&self) -> &str {
            "fake"
        }
        async fn send(&self, address: &str, message: &RenderedMessage) -> std::result::Result<DeliveryReceipt, SendError> {
            self.calls
                .lock()
                .unwrap()
                .push((address.to_string(), message.body.clone()));
            if self.hang_for.iter().any(|a| a == address) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.fail_for.iter().any(|a| a == address) {
                return Err(SendError::Provider("503 upstream unavailable".into()));
            }
            Ok(DeliveryReceipt::now(self.channel, Some("msg-1".into())))
        }
    }

    struct Harness {
        db: Arc<NotifyDb>,
        sms: Arc<FakeSender>,
        email: Arc<FakeSender>,
        evaluator: TriggerEvaluator,
    }

    fn harness_with(sms: FakeSender, email: FakeSender) -> Harness {
        let db = Arc::new(NotifyDb::open_in_memory().unwrap());
        let sms = Arc::new(sms);
        let email = Arc::new(email);
        let mut dispatcher = ChannelDispatcher::new(Duration::from_millis(200));
        dispatcher.register(Arc::new(InAppSender::new(db.clone())), 0);
        dispatcher.register(sms.clone(), 1);
        dispatcher.register(email.clone(), 2);
        let evaluator = TriggerEvaluator::new(
            db.clone(),
            Arc::new(Catalog::builtin()),
            Arc::new(dispatcher),
            BTreeMap::from([(Channel::Sms, 3)]),
            8,
        );
        Harness {
            db,
            sms,
            email,
            evaluator,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeSender::new(Channel::Sms), FakeSender::new(Channel::Email))
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn event(event_type: &str, reference_id: &str, institution_id: &str, subject_id: &str, payload: Value) -> DomainEvent {
        DomainEvent {
            event_type: event_type.into(),
            reference_id: reference_id.into(),
            institution_id: institution_id.into(),
            subject_id: subject_id.into(),
            occurred_on: day(),
            payload: payload.as_object().cloned().unwrap(),
        }
    }

    fn absent(reference_id: &str) -> DomainEvent {
        event(
            "attendance_absent",
            reference_id,
            "I1",
            "S1",
            serde_json::json!({"student_name": "Amina", "attendance_date": "2024-05-01"}),
        )
    }

    fn guardian(id: &str, contacts: &[(Channel, &str)]) -> Recipient {
        Recipient {
            id: id.into(),
            name: format!("Parent {id}"),
            relationship: Some("mother".into()),
            contacts: contacts.iter().map(|(c, a)| (*c, a.to_string())).collect(),
            opted_out: Default::default(),
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            day: Some(day()),
            ..Default::default()
        }
    }

    fn sms_key(recipient: &str) -> RateKey {
        RateLimiter::key("I1", recipient, Channel::Sms, day())
    }

    // ─── End-to-end scenarios ───────────────────────────

    #[tokio::test]
    async fn test_absence_alert_goes_out_by_sms() {
        let h = harness();
        h.db.upsert_guardian("I1", "S1", &guardian("G1", &[(Channel::Sms, "+254700000001")]), true)
            .unwrap();
        h.db.insert_event(&absent("att-001")).unwrap();

        let summary = h.evaluator.run(request()).await.unwrap();
        assert_eq!(summary.events_considered, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.sent_per_channel.get("sms"), Some(&1));
        assert!(summary.errors.is_empty());

        let records = h.db.deliveries_for("attendance_absent", "att-001").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].recipient_id, "G1");
        assert_eq!(records[0].channels, vec![Channel::Sms]);
        assert_eq!(records[0].status, DeliveryStatus::Sent);
        assert_eq!(h.db.rate_count(&sms_key("G1")).unwrap(), 1);

        let calls = h.sms.calls();
        assert_eq!(calls[0].0, "+254700000001");
        assert!(calls[0].1.starts_with("Dear Parent G1, Amina was marked absent on 2024-05-01."));
    }

    #[tokio::test]
    async fn test_replayed_event_sends_nothing() {
        let h = harness();
        h.db.upsert_guardian("I1", "S1", &guardian("G1", &[(Channel::Sms, "+254700000001")]), true)
            .unwrap();
        h.db.insert_event(&absent("att-001")).unwrap();

        h.evaluator.run(request()).await.unwrap();
        let again = h.evaluator.run(request()).await.unwrap();

        assert_eq!(again.sent, 0);
        assert_eq!(again.skipped, 1);
        assert_eq!(h.sms.calls().len(), 1);
        assert_eq!(h.db.deliveries_for("attendance_absent", "att-001").unwrap().len(), 1);
        assert_eq!(h.db.rate_count(&sms_key("G1")).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sms_ceiling_does_not_block_in_app() {
        let h = harness();
        h.db.upsert_guardian(
            "I1",
            "S1",
            &guardian("G1", &[(Channel::Sms, "+254700000001"), (Channel::InApp, "acct-G1")]),
            true,
        )
        .unwrap();
        for _ in 0..3 {
            h.db.increment_rate(&sms_key("G1"), Some(3)).unwrap();
        }
        h.db.insert_event(&absent("att-002")).unwrap();

        let summary = h.evaluator.run(request()).await.unwrap();
        assert!(h.sms.calls().is_empty());
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.sent_per_channel.get("in_app"), Some(&1));
        assert_eq!(h.db.inbox("acct-G1").unwrap().len(), 1);
        let records = h.db.deliveries_for("attendance_absent", "att-002").unwrap();
        assert_eq!(records[0].channels, vec![Channel::InApp]);
        assert_eq!(h.db.rate_count(&sms_key("G1")).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_disabled_category_is_skipped() {
        let h = harness();
        h.db.upsert_setting(&crate::store::InstitutionSetting {
            institution_id: "I2".into(),
            category_id: "fee_reminder".into(),
            enabled: Some(false),
            ..Default::default()
        })
        .unwrap();
        h.db.upsert_guardian(
            "I2",
            "S2",
            &guardian("G2", &[(Channel::Sms, "+254700000002"), (Channel::Email, "g2@example.com")]),
            true,
        )
        .unwrap();
        h.db.insert_event(&event(
            "fee_reminder",
            "inv-9",
            "I2",
            "S2",
            serde_json::json!({"amount": "KES 12,000", "student_name": "Baraka", "due_date": "2024-05-10"}),
        ))
        .unwrap();

        let summary = h
            .evaluator
            .run(RunRequest {
                institution_id: Some("I2".into()),
                ..request()
            })
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.events[0].outcome, EventOutcome::Skipped);
        assert!(h.sms.calls().is_empty());
        assert!(h.email.calls().is_empty());
        assert!(h.db.deliveries_for("fee_reminder", "inv-9").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_template_field_renders_empty_and_sends() {
        let h = harness();
        h.db.upsert_guardian(
            "I1",
            "S1",
            &guardian("G1", &[(Channel::Sms, "+254700000001"), (Channel::Email, "g1@example.com")]),
            true,
        )
        .unwrap();
        h.db.insert_event(&event(
            "payment_confirmation",
            "pay-77",
            "I1",
            "S1",
            serde_json::json!({"amount": "KES 5,000", "student_name": "Amina"}),
        ))
        .unwrap();

        let summary = h.evaluator.run(request()).await.unwrap();
        assert_eq!(summary.sent, 1);
        let body = &h.sms.calls()[0].1;
        assert!(body.contains("Receipt: ."), "{body}");
        assert_eq!(h.email.calls()[0].1, *body);
        let records = h.db.deliveries_for("payment_confirmation", "pay-77").unwrap();
        assert_eq!(records[0].channels, vec![Channel::Sms, Channel::Email]);
    }

    // ─── Properties ─────────────────────────────────────

    #[tokio::test]
    async fn test_concurrent_runs_record_once() {
        let h = harness();
        h.db.upsert_guardian("I1", "S1", &guardian("G1", &[(Channel::Sms, "+254700000001")]), true)
            .unwrap();
        h.db.insert_event(&absent("att-001")).unwrap();

        let (a, b) = tokio::join!(h.evaluator.run(request()), h.evaluator.run(request()));
        assert_eq!(a.unwrap().sent + b.unwrap().sent, 1);
        assert_eq!(h.sms.calls().len(), 1);
        assert_eq!(h.db.deliveries_for("attendance_absent", "att-001").unwrap().len(), 1);
    }

    fn second_engine(h: &Harness) -> TriggerEvaluator {
        // Its own in-process state; only the store and the SMS provider are shared.
        let mut dispatcher = ChannelDispatcher::new(Duration::from_millis(200));
        dispatcher.register(h.sms.clone(), 1);
        TriggerEvaluator::new(
            h.db.clone(),
            Arc::new(Catalog::builtin()),
            Arc::new(dispatcher),
            BTreeMap::from([(Channel::Sms, 3)]),
            8,
        )
    }

    #[tokio::test]
    async fn test_separate_engines_on_one_store_record_once() {
        let h = harness();
        h.db.upsert_guardian("I1", "S1", &guardian("G1", &[(Channel::Sms, "+254700000001")]), true)
            .unwrap();
        h.db.insert_event(&absent("att-001")).unwrap();
        let other = second_engine(&h);

        let (a, b) = tokio::join!(h.evaluator.run(request()), other.run(request()));
        a.unwrap();
        b.unwrap();
        assert_eq!(h.db.deliveries_for("attendance_absent", "att-001").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_separate_engines_share_the_daily_ceiling() {
        let h = harness();
        h.db.upsert_guardian("I1", "S1", &guardian("G1", &[(Channel::Sms, "+254700000001")]), true)
            .unwrap();
        for i in 0..6 {
            h.db.insert_event(&absent(&format!("att-20{i}"))).unwrap();
        }
        let other = second_engine(&h);

        let (a, b) = tokio::join!(h.evaluator.run(request()), other.run(request()));
        let (a, b) = (a.unwrap(), b.unwrap());
        // The counter stops at the ceiling. Without a shared lock the two
        // engines may each pass admit before the other increments, so the
        // provider can see more sends than the counter, but never one per event.
        assert_eq!(h.db.rate_count(&sms_key("G1")).unwrap(), 3);
        let sends = h.sms.calls().len();
        assert!((3..6).contains(&sends), "{sends} sends");
        assert_eq!((a.sent + b.sent) as usize, sends);

        // A later run on either engine is denied.
        h.db.insert_event(&absent("att-299")).unwrap();
        let later = other.run(request()).await.unwrap();
        assert_eq!(later.sent, 0);
        assert_eq!(h.sms.calls().len(), sends);
    }

    #[tokio::test]
    async fn test_failed_send_does_not_consume_budget() {
        let h = harness_with(
            FakeSender::new(Channel::Sms).failing_for("+254700000001"),
            FakeSender::new(Channel::Email),
        );
        h.db.upsert_guardian("I1", "S1", &guardian("G1", &[(Channel::Sms, "+254700000001")]), true)
            .unwrap();
        h.db.increment_rate(&sms_key("G1"), Some(3)).unwrap();
        h.db.insert_event(&absent("att-001")).unwrap();

        let summary = h.evaluator.run(request()).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(h.db.rate_count(&sms_key("G1")).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ceiling_holds_under_concurrent_events() {
        let h = harness();
        h.db.upsert_guardian("I1", "S1", &guardian("G1", &[(Channel::Sms, "+254700000001")]), true)
            .unwrap();
        for i in 0..6 {
            h.db.insert_event(&absent(&format!("att-10{i}"))).unwrap();
        }

        let summary = h.evaluator.run(request()).await.unwrap();
        assert_eq!(summary.events_considered, 6);
        assert_eq!(summary.sent, 3);
        assert_eq!(summary.skipped, 3);
        assert_eq!(h.sms.calls().len(), 3);
        assert_eq!(h.db.rate_count(&sms_key("G1")).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_hung_sms_does_not_affect_other_channels_or_recipients() {
        let h = harness_with(
            FakeSender::new(Channel::Sms).hanging_for("+254700000001"),
            FakeSender::new(Channel::Email),
        );
        h.db.upsert_guardian(
            "I1",
            "S1",
            &guardian("GA", &[(Channel::Sms, "+254700000001"), (Channel::Email, "a@example.com")]),
            true,
        )
        .unwrap();
        h.db.upsert_guardian(
            "I1",
            "S1",
            &guardian("GB", &[(Channel::Sms, "+254700000002"), (Channel::Email, "b@example.com")]),
            false,
        )
        .unwrap();
        h.db.insert_event(&event(
            "payment_confirmation",
            "pay-1",
            "I1",
            "S1",
            serde_json::json!({"amount": "KES 5,000", "student_name": "Amina", "receipt_number": "R-1"}),
        ))
        .unwrap();

        let summary = h.evaluator.run(request()).await.unwrap();
        assert_eq!(summary.partially_sent, 1);
        assert_eq!(summary.sent_per_channel.get("email"), Some(&2));
        assert_eq!(summary.sent_per_channel.get("sms"), Some(&1));
        assert_eq!(summary.failed_per_channel.get("sms"), Some(&1));
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].starts_with("payment_confirmation/pay-1 → GA: sms:"));
        assert!(summary.errors[0].contains("timed out"));

        let records = h.db.deliveries_for("payment_confirmation", "pay-1").unwrap();
        let ga = records.iter().find(|r| r.recipient_id == "GA").unwrap();
        assert_eq!(ga.channels, vec![Channel::Email]);
        assert_eq!(ga.status, DeliveryStatus::Partial);
        let gb = records.iter().find(|r| r.recipient_id == "GB").unwrap();
        assert_eq!(gb.status, DeliveryStatus::Sent);

        // A timed-out send is not counted.
        assert_eq!(h.db.rate_count(&sms_key("GA")).unwrap(), 0);
        assert_eq!(h.db.rate_count(&sms_key("GB")).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_all_channels_failing_leaves_no_record_and_retries() {
        let h = harness_with(
            FakeSender::new(Channel::Sms).failing_for("+254700000001"),
            FakeSender::new(Channel::Email),
        );
        h.db.upsert_guardian("I1", "S1", &guardian("G1", &[(Channel::Sms, "+254700000001")]), true)
            .unwrap();
        h.db.insert_event(&absent("att-001")).unwrap();

        let summary = h.evaluator.run(request()).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].contains("503 upstream unavailable"));
        assert!(h.db.deliveries_for("attendance_absent", "att-001").unwrap().is_empty());

        h.evaluator.run(request()).await.unwrap();
        assert_eq!(h.sms.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_email_opt_out_keeps_sms() {
        let h = harness();
        h.db.upsert_guardian(
            "I1",
            "S1",
            &guardian("G1", &[(Channel::Sms, "+254700000001"), (Channel::Email, "g1@example.com")]),
            true,
        )
        .unwrap();
        h.db.set_preference(&crate::store::Preference {
            recipient_id: "G1".into(),
            institution_id: "I1".into(),
            channel: Channel::Email,
            opted_in: false,
        })
        .unwrap();
        h.db.insert_event(&event(
            "payment_confirmation",
            "pay-2",
            "I1",
            "S1",
            serde_json::json!({"amount": "KES 100", "student_name": "Amina", "receipt_number": "R-2"}),
        ))
        .unwrap();

        h.evaluator.run(request()).await.unwrap();
        assert!(h.email.calls().is_empty());
        assert_eq!(h.sms.calls().len(), 1);
        let records = h.db.deliveries_for("payment_confirmation", "pay-2").unwrap();
        assert_eq!(records[0].channels, vec![Channel::Sms]);
    }

    #[tokio::test]
    async fn test_unknown_category_fails_event_but_not_run() {
        let h = harness();
        h.db.upsert_guardian("I1", "S1", &guardian("G1", &[(Channel::Sms, "+254700000001")]), true)
            .unwrap();
        h.db.insert_event(&event("parent_teacher_meeting", "ptm-1", "I1", "S1", serde_json::json!({})))
            .unwrap();
        h.db.insert_event(&absent("att-001")).unwrap();

        let summary = h.evaluator.run(request()).await.unwrap();
        assert_eq!(summary.events_considered, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.sent, 1);
        assert!(summary.errors.iter().any(|e| e.contains("parent_teacher_meeting")));
    }

    #[tokio::test]
    async fn test_no_guardians_is_skipped() {
        let h = harness();
        h.db.insert_event(&absent("att-001")).unwrap();
        let summary = h.evaluator.run(request()).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(summary.errors.is_empty());
    }

    #[tokio::test]
    async fn test_targeted_rerun_ignores_date_window() {
        let h = harness();
        h.db.upsert_guardian("I1", "S1", &guardian("G1", &[(Channel::Sms, "+254700000001")]), true)
            .unwrap();
        h.db.insert_event(&absent("att-001")).unwrap();

        let next_week = RunRequest {
            day: day().checked_add_days(chrono::Days::new(7)),
            ..Default::default()
        };
        assert_eq!(h.evaluator.run(next_week.clone()).await.unwrap().events_considered, 0);

        let targeted = RunRequest {
            reference_ids: vec!["att-001".into()],
            mode: RunMode::Realtime,
            ..next_week
        };
        let summary = h.evaluator.run(targeted).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.mode, RunMode::Realtime);

        let runs = h.db.recent_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
    }

    struct BrokenStore;

    impl NotifyStore for BrokenStore {
        fn fetch_events(&self, _query: &EventQuery) -> Result<Vec<DomainEvent>> {
            Err(SchoolbellError::Database("disk I/O error".into()))
        }
        fn institution_setting(&self, _: &str, _: &str) -> Result<Option<crate::store::InstitutionSetting>> {
            Ok(None)
        }
        fn upsert_setting(&self, _: &crate::store::InstitutionSetting) -> Result<()> {
            Ok(())
        }
        fn guardians(&self, _: &str, _: &str) -> Result<Vec<Recipient>> {
            Ok(vec![])
        }
        fn opted_out_channels(&self, _: &str, _: &str) -> Result<Vec<Channel>> {
            Ok(vec![])
        }
        fn set_preference(&self, _: &crate::store::Preference) -> Result<()> {
            Ok(())
        }
        fn delivery_exists(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
        fn insert_delivery(&self, _: &DeliveryRecord) -> Result<crate::store::InsertOutcome> {
            Ok(crate::store::InsertOutcome::Inserted)
        }
        fn rate_count(&self, _: &RateKey) -> Result<u32> {
            Ok(0)
        }
        fn increment_rate(&self, _: &RateKey, _: Option<u32>) -> Result<u32> {
            Ok(1)
        }
        fn record_run(&self, _: &RunRecord) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_run() {
        let evaluator = TriggerEvaluator::new(
            Arc::new(BrokenStore),
            Arc::new(Catalog::builtin()),
            Arc::new(ChannelDispatcher::new(Duration::from_secs(1))),
            BTreeMap::new(),
            4,
        );
        let err = evaluator.run(request()).await.unwrap_err();
        assert!(matches!(err, SchoolbellError::Database(_)));
    }

    #[test]
    fn test_outcome_rules() {
        assert_eq!(outcome_of(0, 0), EventOutcome::Skipped);
        assert_eq!(outcome_of(2, 2), EventOutcome::Sent);
        assert_eq!(outcome_of(2, 0), EventOutcome::Failed);
        assert_eq!(outcome_of(3, 1), EventOutcome::PartiallySent);
    }

    #[test]
    fn test_run_request_defaults_from_json() {
        let req: RunRequest = serde_json::from_str(r#"{"institution_id": "I1"}"#).unwrap();
        assert_eq!(req.mode, RunMode::Batch);
        assert!(req.reference_ids.is_empty());
        assert!(req.day.is_none());
    }
}
