//! SQLite-backed store for notification settings, the delivery ledger,
//! rate-limit counters, the in-app inbox and run audit rows.
//!
//! Opened in WAL mode with a busy timeout so several engine processes can
//! share one file. The `UNIQUE` constraints on `communication_events` and
//! `notification_rate_limits` are what keep overlapping runs correct.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use schoolbell_core::error::{Result, SchoolbellError};
use schoolbell_core::traits::Inbox;
use schoolbell_core::types::{Channel, DomainEvent, Recipient, RenderedMessage};

use crate::store::{
    DeliveryRecord, DeliveryStatus, EventQuery, InsertOutcome, InstitutionSetting, NotifyStore,
    Preference, RateKey, RunRecord,
};

/// Only guardians are notified today; the column leaves room for staff.
const RECIPIENT_TYPE: &str = "guardian";

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> SchoolbellError + '_ {
    move |e| SchoolbellError::Database(format!("{context}: {e}"))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

/// SQLite notification store.
pub struct NotifyDb {
    conn: Mutex<Connection>,
}

impl NotifyDb {
    /// Open or create the database file.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.busy_timeout(busy_timeout).map_err(db_err("Busy timeout"))?;
        // WAL lets a running batch and a realtime trigger share the file.
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .ok();
        Self::with_connection(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SchoolbellError::Database(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Written by attendance/finance/student screens; read-only here.
            CREATE TABLE IF NOT EXISTS domain_events (
                event_type TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                institution_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                occurred_on TEXT NOT NULL,            -- YYYY-MM-DD
                payload TEXT NOT NULL DEFAULT '{}',   -- JSON object
                created_at TEXT NOT NULL,
                PRIMARY KEY (event_type, reference_id)
            );
            CREATE INDEX IF NOT EXISTS idx_domain_events_day
                ON domain_events (occurred_on, institution_id);

            -- Written by the student records screens; read-only here.
            CREATE TABLE IF NOT EXISTS guardians (
                id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                institution_id TEXT NOT NULL,
                name TEXT NOT NULL,
                relationship TEXT,
                phone TEXT,
                email TEXT,
                portal_account_id TEXT,
                is_primary INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (id, subject_id)
            );

            CREATE TABLE IF NOT EXISTS institution_notification_settings (
                institution_id TEXT NOT NULL,
                category_id TEXT NOT NULL,
                is_enabled INTEGER,                   -- NULL = category default
                channels TEXT,                        -- JSON array or NULL
                schedule_time TEXT,                   -- HH:MM or NULL
                schedule_days TEXT,                   -- JSON array or NULL
                custom_template TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (institution_id, category_id)
            );

            CREATE TABLE IF NOT EXISTS notification_preferences (
                recipient_id TEXT NOT NULL,
                institution_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                opted_in INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (recipient_id, institution_id, channel)
            );

            -- Delivery ledger: one row per recipient per event, ever.
            CREATE TABLE IF NOT EXISTS communication_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                institution_id TEXT NOT NULL,
                channels TEXT NOT NULL,               -- JSON array
                message TEXT NOT NULL,
                status TEXT NOT NULL,                 -- sent, partial
                created_at TEXT NOT NULL,
                UNIQUE (event_type, reference_id, recipient_id)
            );

            CREATE TABLE IF NOT EXISTS notification_rate_limits (
                institution_id TEXT NOT NULL,
                recipient_type TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                day TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE (institution_id, recipient_type, recipient_id, channel, day)
            );

            CREATE TABLE IF NOT EXISTS in_app_notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notification_runs (
                id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                institution_id TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                summary TEXT NOT NULL
            );
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Collaborator tables ──────────────────────────────────

    /// Insert a domain event (used by producers and fixtures).
    pub fn insert_event(&self, event: &DomainEvent) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO domain_events
                 (event_type, reference_id, institution_id, subject_id, occurred_on, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.event_type,
                    event.reference_id,
                    event.institution_id,
                    event.subject_id,
                    event.occurred_on.to_string(),
                    serde_json::Value::Object(event.payload.clone()).to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err("Insert event"))?;
        Ok(())
    }

    /// Insert or replace a guardian link (used by student records and fixtures).
    pub fn upsert_guardian(
        &self,
        institution_id: &str,
        subject_id: &str,
        guardian: &Recipient,
        is_primary: bool,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO guardians
                 (id, subject_id, institution_id, name, relationship, phone, email, portal_account_id, is_primary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    guardian.id,
                    subject_id,
                    institution_id,
                    guardian.name,
                    guardian.relationship,
                    guardian.contacts.get(&Channel::Sms),
                    guardian.contacts.get(&Channel::Email),
                    guardian.contacts.get(&Channel::InApp),
                    is_primary as i32,
                ],
            )
            .map_err(db_err("Upsert guardian"))?;
        Ok(())
    }

    // ─── Reporting ──────────────────────────────────────

    /// Ledger rows for one event.
    pub fn deliveries_for(&self, event_type: &str, reference_id: &str) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT event_type, reference_id, recipient_id, institution_id, channels, message, status, created_at
                 FROM communication_events WHERE event_type = ?1 AND reference_id = ?2 ORDER BY id",
            )
            .map_err(db_err("Query deliveries"))?;
        let rows = stmt
            .query_map(params![event_type, reference_id], |row| {
                let channels: String = row.get(4)?;
                let status: String = row.get(6)?;
                let created_at: String = row.get(7)?;
                Ok(DeliveryRecord {
                    event_type: row.get(0)?,
                    reference_id: row.get(1)?,
                    recipient_id: row.get(2)?,
                    institution_id: row.get(3)?,
                    channels: serde_json::from_str(&channels).unwrap_or_default(),
                    message: row.get(5)?,
                    status: if status == "partial" {
                        DeliveryStatus::Partial
                    } else {
                        DeliveryStatus::Sent
                    },
                    recorded_at: parse_ts(&created_at),
                })
            })
            .map_err(db_err("Query deliveries"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read deliveries"))
    }

    /// Unread in-app messages for a portal account, newest first.
    pub fn inbox(&self, account_id: &str) -> Result<Vec<(i64, String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, title, body FROM in_app_notifications
                 WHERE account_id = ?1 AND is_read = 0 ORDER BY id DESC",
            )
            .map_err(db_err("Query inbox"))?;
        let rows = stmt
            .query_map([account_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(db_err("Query inbox"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read inbox"))
    }

    /// Most recent run audit rows.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<serde_json::Value>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, mode, institution_id, started_at, finished_at, summary
                 FROM notification_runs ORDER BY started_at DESC LIMIT ?1",
            )
            .map_err(db_err("Query runs"))?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                let summary: String = row.get(5)?;
                Ok(serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "mode": row.get::<_, String>(1)?,
                    "institution_id": row.get::<_, Option<String>>(2)?,
                    "started_at": row.get::<_, String>(3)?,
                    "finished_at": row.get::<_, String>(4)?,
                    "summary": serde_json::from_str::<serde_json::Value>(&summary).unwrap_or_default(),
                }))
            })
            .map_err(db_err("Query runs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read runs"))
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl NotifyStore for NotifyDb {
    fn fetch_events(&self, query: &EventQuery) -> Result<Vec<DomainEvent>> {
        let mut sql = String::from(
            "SELECT event_type, reference_id, institution_id, subject_id, occurred_on, payload
             FROM domain_events WHERE 1 = 1",
        );
        let mut args: Vec<String> = Vec::new();

        if query.reference_ids.is_empty() {
            sql.push_str(" AND occurred_on = ?");
            args.push(query.day.to_string());
        } else {
            sql.push_str(&format!(" AND reference_id IN ({})", placeholders(query.reference_ids.len())));
            args.extend(query.reference_ids.iter().cloned());
        }
        if let Some(institution_id) = &query.institution_id {
            sql.push_str(" AND institution_id = ?");
            args.push(institution_id.clone());
        }
        if !query.event_types.is_empty() {
            sql.push_str(&format!(" AND event_type IN ({})", placeholders(query.event_types.len())));
            args.extend(query.event_types.iter().cloned());
        }
        sql.push_str(" ORDER BY created_at, reference_id");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err("Fetch events"))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(db_err("Fetch events"))?;

        let mut events = Vec::new();
        for row in rows {
            let (event_type, reference_id, institution_id, subject_id, occurred_on, payload) =
                row.map_err(db_err("Read event"))?;
            let occurred_on = match NaiveDate::parse_from_str(&occurred_on, "%Y-%m-%d") {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("Event {event_type}/{reference_id} skipped: bad occurred_on '{occurred_on}': {e}");
                    continue;
                }
            };
            let payload = match serde_json::from_str::<serde_json::Value>(&payload) {
                Ok(serde_json::Value::Object(map)) => map,
                _ => {
                    tracing::warn!("Event {event_type}/{reference_id} has a malformed payload; using empty");
                    serde_json::Map::new()
                }
            };
            events.push(DomainEvent {
                event_type,
                reference_id,
                institution_id,
                subject_id,
                occurred_on,
                payload,
            });
        }
        Ok(events)
    }

    fn institution_setting(&self, institution_id: &str, category_id: &str) -> Result<Option<InstitutionSetting>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT is_enabled, channels, schedule_time, schedule_days, custom_template
                 FROM institution_notification_settings
                 WHERE institution_id = ?1 AND category_id = ?2",
                params![institution_id, category_id],
                |row| {
                    Ok((
                        row.get::<_, Option<i32>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err("Load setting"))?;

        let Some((enabled, channels, time, days, template)) = row else {
            return Ok(None);
        };

        let channels = channels
            .map(|s| serde_json::from_str::<Vec<Channel>>(&s))
            .transpose()?;
        let schedule_days = days
            .map(|s| serde_json::from_str::<Vec<Weekday>>(&s))
            .transpose()?;
        let schedule_time = time
            .map(|s| schoolbell_core::types::hhmm::parse(&s))
            .transpose()
            .map_err(|e| SchoolbellError::Database(format!("Bad schedule_time: {e}")))?;

        Ok(Some(InstitutionSetting {
            institution_id: institution_id.to_string(),
            category_id: category_id.to_string(),
            enabled: enabled.map(|v| v != 0),
            channels,
            schedule_time,
            schedule_days,
            template,
        }))
    }

    fn upsert_setting(&self, setting: &InstitutionSetting) -> Result<()> {
        let channels = setting.channels.as_ref().map(serde_json::to_string).transpose()?;
        let days = setting.schedule_days.as_ref().map(serde_json::to_string).transpose()?;
        self.conn()?
            .execute(
                "INSERT INTO institution_notification_settings
                 (institution_id, category_id, is_enabled, channels, schedule_time, schedule_days, custom_template, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (institution_id, category_id) DO UPDATE SET
                    is_enabled = excluded.is_enabled,
                    channels = excluded.channels,
                    schedule_time = excluded.schedule_time,
                    schedule_days = excluded.schedule_days,
                    custom_template = excluded.custom_template,
                    updated_at = excluded.updated_at",
                params![
                    setting.institution_id,
                    setting.category_id,
                    setting.enabled.map(|b| b as i32),
                    channels,
                    setting.schedule_time.map(|t| t.format("%H:%M").to_string()),
                    days,
                    setting.template,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err("Save setting"))?;
        Ok(())
    }

    fn guardians(&self, institution_id: &str, subject_id: &str) -> Result<Vec<Recipient>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, relationship, phone, email, portal_account_id
                 FROM guardians WHERE institution_id = ?1 AND subject_id = ?2
                 ORDER BY is_primary DESC, name",
            )
            .map_err(db_err("Query guardians"))?;
        let rows = stmt
            .query_map(params![institution_id, subject_id], |row| {
                let mut contacts = std::collections::BTreeMap::new();
                for (idx, channel) in [(3usize, Channel::Sms), (4, Channel::Email), (5, Channel::InApp)] {
                    if let Some(addr) = row.get::<_, Option<String>>(idx)? {
                        contacts.insert(channel, addr);
                    }
                }
                Ok(Recipient {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    relationship: row.get(2)?,
                    contacts,
                    opted_out: Default::default(),
                })
            })
            .map_err(db_err("Query guardians"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read guardians"))
    }

    fn opted_out_channels(&self, recipient_id: &str, institution_id: &str) -> Result<Vec<Channel>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT channel FROM notification_preferences
                 WHERE recipient_id = ?1 AND institution_id = ?2 AND opted_in = 0",
            )
            .map_err(db_err("Query preferences"))?;
        let names = stmt
            .query_map(params![recipient_id, institution_id], |row| row.get::<_, String>(0))
            .map_err(db_err("Query preferences"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read preferences"))?;

        Ok(names
            .iter()
            .filter_map(|n| match n.parse::<Channel>() {
                Ok(c) => Some(c),
                Err(_) => {
                    tracing::warn!("Ignoring preference for unknown channel '{n}'");
                    None
                }
            })
            .collect())
    }

    fn set_preference(&self, preference: &Preference) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO notification_preferences (recipient_id, institution_id, channel, opted_in, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (recipient_id, institution_id, channel) DO UPDATE SET
                    opted_in = excluded.opted_in, updated_at = excluded.updated_at",
                params![
                    preference.recipient_id,
                    preference.institution_id,
                    preference.channel.as_str(),
                    preference.opted_in as i32,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err("Save preference"))?;
        Ok(())
    }

    fn delivery_exists(&self, event_type: &str, reference_id: &str, recipient_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM communication_events
                 WHERE event_type = ?1 AND reference_id = ?2 AND recipient_id = ?3",
                params![event_type, reference_id, recipient_id],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err("Check ledger"))?;
        Ok(found.is_some())
    }

    fn insert_delivery(&self, record: &DeliveryRecord) -> Result<InsertOutcome> {
        let channels = serde_json::to_string(&record.channels)?;
        let result = self.conn()?.execute(
            "INSERT INTO communication_events
             (event_type, reference_id, recipient_id, institution_id, channels, message, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.event_type,
                record.reference_id,
                record.recipient_id,
                record.institution_id,
                channels,
                record.message,
                record.status.as_str(),
                record.recorded_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(db_err("Insert delivery")(e)),
        }
    }

    fn rate_count(&self, key: &RateKey) -> Result<u32> {
        let conn = self.conn()?;
        let count = conn
            .query_row(
                "SELECT count FROM notification_rate_limits
                 WHERE institution_id = ?1 AND recipient_type = ?2 AND recipient_id = ?3
                   AND channel = ?4 AND day = ?5",
                params![
                    key.institution_id,
                    RECIPIENT_TYPE,
                    key.recipient_id,
                    key.channel.as_str(),
                    key.day.to_string(),
                ],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(db_err("Read rate limit"))?;
        Ok(count.unwrap_or(0).max(0) as u32)
    }

    fn increment_rate(&self, key: &RateKey, ceiling: Option<u32>) -> Result<u32> {
        if ceiling == Some(0) {
            return Ok(0);
        }
        let conn = self.conn()?;
        // Single statement: safe against other processes on the same file.
        conn.execute(
            "INSERT INTO notification_rate_limits
             (institution_id, recipient_type, recipient_id, channel, day, count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
             ON CONFLICT (institution_id, recipient_type, recipient_id, channel, day)
             DO UPDATE SET count = count + 1, updated_at = excluded.updated_at
             WHERE ?7 IS NULL OR count < ?7",
            params![
                key.institution_id,
                RECIPIENT_TYPE,
                key.recipient_id,
                key.channel.as_str(),
                key.day.to_string(),
                Utc::now().to_rfc3339(),
                ceiling.map(i64::from),
            ],
        )
        .map_err(db_err("Increment rate limit"))?;

        let count: i64 = conn
            .query_row(
                "SELECT count FROM notification_rate_limits
                 WHERE institution_id = ?1 AND recipient_type = ?2 AND recipient_id = ?3
                   AND channel = ?4 AND day = ?5",
                params![
                    key.institution_id,
                    RECIPIENT_TYPE,
                    key.recipient_id,
                    key.channel.as_str(),
                    key.day.to_string(),
                ],
                |row| row.get(0),
            )
            .map_err(db_err("Read rate limit"))?;
        Ok(count.max(0) as u32)
    }

    fn record_run(&self, run: &RunRecord) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO notification_runs
                 (id, mode, institution_id, started_at, finished_at, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.id,
                    run.mode.to_string(),
                    run.institution_id,
                    run.started_at.to_rfc3339(),
                    run.finished_at.to_rfc3339(),
                    run.summary.to_string(),
                ],
            )
            .map_err(db_err("Record run"))?;
        Ok(())
    }
}

impl Inbox for NotifyDb {
    fn deliver(&self, account_id: &str, message: &RenderedMessage) -> Result<String> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO in_app_notifications (account_id, title, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![account_id, message.subject, message.body, Utc::now().to_rfc3339()],
        )
        .map_err(db_err("Inbox insert"))?;
        Ok(conn.last_insert_rowid().to_string())
    }
}
