//! Shared domain types: channels, categories, events, recipients.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::SchoolbellError;

/// A delivery medium with its own provider, opt-in state and rate ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
    InApp,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Sms, Channel::Email, Channel::InApp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::InApp => "in_app",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = SchoolbellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sms" => Ok(Channel::Sms),
            "email" => Ok(Channel::Email),
            "in_app" | "inapp" | "app" => Ok(Channel::InApp),
            other => Err(SchoolbellError::InvalidInput(format!("unknown channel '{other}'"))),
        }
    }
}

/// How often a category is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Realtime,
    Daily,
    Weekly,
}

/// Invocation mode. Recorded for audit only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Realtime,
    #[default]
    Batch,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Realtime => f.write_str("realtime"),
            RunMode::Batch => f.write_str("batch"),
        }
    }
}

impl FromStr for RunMode {
    type Err = SchoolbellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "realtime" => Ok(RunMode::Realtime),
            "batch" => Ok(RunMode::Batch),
            other => Err(SchoolbellError::InvalidInput(format!("unknown mode '{other}'"))),
        }
    }
}

/// Time of day plus days of week for daily/weekly categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(with = "hhmm")]
    pub time_of_day: NaiveTime,
    #[serde(default)]
    pub days: Vec<Weekday>,
}

impl Schedule {
    pub fn new(time_of_day: NaiveTime, days: Vec<Weekday>) -> Self {
        Self { time_of_day, days }
    }
}

/// `HH:MM` (seconds accepted on input).
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(d)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse(s: &str) -> Result<NaiveTime, chrono::ParseError> {
        NaiveTime::parse_from_str(s, "%H:%M").or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
    }
}

/// Behavior-only definition of a kind of notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationCategory {
    pub id: String,
    pub label: String,
    pub channels: Vec<Channel>,
    pub cadence: Cadence,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    pub template: String,
}

/// A fact produced elsewhere in the system that may warrant a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Category id this event maps to.
    pub event_type: String,
    /// Stable id, unique within the source table.
    pub reference_id: String,
    pub institution_id: String,
    /// Usually a student id.
    pub subject_id: String,
    pub occurred_on: NaiveDate,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// A guardian entitled to notifications about a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub relationship: Option<String>,
    /// Phone for sms, email address for email, portal account id for in_app.
    #[serde(default)]
    pub contacts: BTreeMap<Channel, String>,
    #[serde(default)]
    pub opted_out: BTreeSet<Channel>,
}

impl Recipient {
    pub fn address(&self, channel: Channel) -> Option<&str> {
        self.contacts
            .get(&channel)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    /// Channels default to opted-in.
    pub fn is_opted_in(&self, channel: Channel) -> bool {
        !self.opted_out.contains(&channel)
    }
}

/// Message handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    /// Used as the email subject; ignored by sms.
    pub subject: String,
    pub body: String,
}

/// Proof of a successful provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub channel: Channel,
    /// Provider-side message id, when the provider returns one.
    pub provider_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryReceipt {
    pub fn now(channel: Channel, provider_id: Option<String>) -> Self {
        Self {
            channel,
            provider_id,
            delivered_at: Utc::now(),
        }
    }
}
