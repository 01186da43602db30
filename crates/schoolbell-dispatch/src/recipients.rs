//! Who gets told about an event: the guardians linked to its subject,
//! with their per-channel opt-outs for the event's institution.

use std::sync::Arc;

use schoolbell_core::error::Result;
use schoolbell_core::types::Recipient;

use crate::store::NotifyStore;

#[derive(Clone)]
pub struct RecipientResolver {
    store: Arc<dyn NotifyStore>,
}

impl RecipientResolver {
    pub fn new(store: Arc<dyn NotifyStore>) -> Self {
        Self { store }
    }

    /// Guardians of `subject_id`, best-ranked first. An empty list is not
    /// an error.
    pub fn resolve_guardians(&self, institution_id: &str, subject_id: &str) -> Result<Vec<Recipient>> {
        let mut guardians = self.store.guardians(institution_id, subject_id)?;
        for guardian in &mut guardians {
            guardian.opted_out = self
                .store
                .opted_out_channels(&guardian.id, institution_id)?
                .into_iter()
                .collect();
        }
        Ok(guardians)
    }
}
