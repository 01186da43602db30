//! Per-recipient daily send ceilings, one counter per
//! (institution, recipient, channel, day).
//!
//! `admit` only reads and `increment` runs after a successful send, so a failed
//! send never consumes budget. Within one process the engine holds a per-key
//! lock across admit, send and increment. Across processes the capped upsert
//! keeps the counter at the ceiling, but two processes can both pass `admit`
//! before either increments, so the provider may see a send more than the
//! counter records.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use schoolbell_core::error::Result;
use schoolbell_core::types::Channel;

use crate::store::{NotifyStore, RateKey};

#[derive(Clone)]
pub struct RateLimiter {
    ceilings: BTreeMap<Channel, u32>,
    store: Arc<dyn NotifyStore>,
}

impl RateLimiter {
    pub fn new(ceilings: BTreeMap<Channel, u32>, store: Arc<dyn NotifyStore>) -> Self {
        Self { ceilings, store }
    }

    /// Ceiling for a channel; `None` means unlimited.
    pub fn ceiling(&self, channel: Channel) -> Option<u32> {
        self.ceilings.get(&channel).copied()
    }

    pub fn key(institution_id: &str, recipient_id: &str, channel: Channel, day: NaiveDate) -> RateKey {
        RateKey {
            institution_id: institution_id.to_string(),
            recipient_id: recipient_id.to_string(),
            channel,
            day,
        }
    }

    /// Whether one more send fits under today's ceiling.
    pub fn admit(&self, key: &RateKey) -> Result<bool> {
        match self.ceiling(key.channel) {
            None => Ok(true),
            Some(0) => Ok(false),
            Some(ceiling) => Ok(self.store.rate_count(key)? < ceiling),
        }
    }

    /// Count a successful send. Returns the new count.
    pub fn increment(&self, key: &RateKey) -> Result<u32> {
        self.store.increment_rate(key, self.ceiling(key.channel))
    }

    pub fn count(&self, key: &RateKey) -> Result<u32> {
        self.store.rate_count(key)
    }
}
