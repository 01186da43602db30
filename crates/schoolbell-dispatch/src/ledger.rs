//! Delivery ledger: at most one record per (event type, reference, recipient).

use std::sync::Arc;

use schoolbell_core::error::Result;

use crate::store::{DeliveryRecord, InsertOutcome, NotifyStore};

/// What happened when a delivery was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// Another run got there first. Not an error.
    AlreadyRecorded,
}

#[derive(Clone)]
pub struct DedupLedger {
    store: Arc<dyn NotifyStore>,
}

impl DedupLedger {
    pub fn new(store: Arc<dyn NotifyStore>) -> Self {
        Self { store }
    }

    pub fn has_been_sent(&self, event_type: &str, reference_id: &str, recipient_id: &str) -> Result<bool> {
        self.store.delivery_exists(event_type, reference_id, recipient_id)
    }

    pub fn record(&self, record: &DeliveryRecord) -> Result<RecordOutcome> {
        match self.store.insert_delivery(record)? {
            InsertOutcome::Inserted => Ok(RecordOutcome::Recorded),
            InsertOutcome::Duplicate => {
                tracing::debug!(
                    "Delivery {}/{} → {} already recorded by another run",
                    record.event_type,
                    record.reference_id,
                    record.recipient_id
                );
                Ok(RecordOutcome::AlreadyRecorded)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::NotifyDb;
    use crate::store::DeliveryStatus;
    use chrono::Utc;
    use schoolbell_core::types::Channel;

    fn record(reference_id: &str, recipient_id: &str) -> DeliveryRecord {
        DeliveryRecord {
            event_type: "payment_confirmation".into(),
            reference_id: reference_id.into(),
            recipient_id: recipient_id.into(),
            institution_id: "I1".into(),
            channels: vec![Channel::Email],
            message: "Payment received".into(),
            status: DeliveryStatus::Sent,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_once() {
        let ledger = DedupLedger::new(Arc::new(NotifyDb::open_in_memory().unwrap()));
        assert!(!ledger.has_been_sent("payment_confirmation", "pay-77", "G1").unwrap());
        assert_eq!(ledger.record(&record("pay-77", "G1")).unwrap(), RecordOutcome::Recorded);
        assert!(ledger.has_been_sent("payment_confirmation", "pay-77", "G1").unwrap());
        assert_eq!(
            ledger.record(&record("pay-77", "G1")).unwrap(),
            RecordOutcome::AlreadyRecorded
        );
    }

    #[test]
    fn test_key_includes_every_part() {
        let ledger = DedupLedger::new(Arc::new(NotifyDb::open_in_memory().unwrap()));
        ledger.record(&record("pay-77", "G1")).unwrap();
        assert!(!ledger.has_been_sent("payment_confirmation", "pay-77", "G2").unwrap());
        assert!(!ledger.has_been_sent("payment_confirmation", "pay-78", "G1").unwrap());
        assert!(!ledger.has_been_sent("fee_reminder", "pay-77", "G1").unwrap());
    }
}
