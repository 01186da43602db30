//! Effective per-institution settings: saved overrides layered field by
//! field over the category defaults.

use std::sync::Arc;

use schoolbell_core::error::{Result, SchoolbellError};
use schoolbell_core::types::{Cadence, Channel, Schedule};
use serde::Serialize;

use crate::catalog::Catalog;
use crate::store::{InstitutionSetting, NotifyStore};

/// Use the saved value if one exists, otherwise the default.
pub fn override_or<T>(saved: Option<T>, default: impl FnOnce() -> T) -> T {
    saved.unwrap_or_else(default)
}

/// The settings a run actually acts on for (institution, category).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveSetting {
    pub category_id: String,
    pub label: String,
    pub enabled: bool,
    pub channels: Vec<Channel>,
    pub cadence: Cadence,
    pub schedule: Option<Schedule>,
    pub template: String,
}

#[derive(Clone)]
pub struct SettingsResolver {
    catalog: Arc<Catalog>,
    store: Arc<dyn NotifyStore>,
}

impl SettingsResolver {
    pub fn new(catalog: Arc<Catalog>, store: Arc<dyn NotifyStore>) -> Self {
        Self { catalog, store }
    }

    /// Resolve the effective setting. Fails only for a category that is not
    /// in the catalog or when the store cannot be read.
    pub fn resolve(&self, institution_id: &str, category_id: &str) -> Result<EffectiveSetting> {
        if !self.catalog.contains(category_id) {
            return Err(SchoolbellError::UnknownCategory(category_id.to_string()));
        }
        let saved = self.store.institution_setting(institution_id, category_id)?;
        self.merge(category_id, saved)
    }

    /// Layer a saved row (or nothing) over the catalog defaults.
    pub fn merge(&self, category_id: &str, saved: Option<InstitutionSetting>) -> Result<EffectiveSetting> {
        let category = self
            .catalog
            .get(category_id)
            .ok_or_else(|| SchoolbellError::UnknownCategory(category_id.to_string()))?;
        let saved = saved.unwrap_or_default();

        let default_time = category.schedule.as_ref().map(|s| s.time_of_day);
        let default_days = || category.schedule.as_ref().map(|s| s.days.clone()).unwrap_or_default();
        // Time and days override independently; no time means no schedule.
        let schedule = saved
            .schedule_time
            .or(default_time)
            .map(|time| Schedule::new(time, override_or(saved.schedule_days.clone(), default_days)));

        // A blank custom template is treated as "not customised".
        let custom = saved.template.filter(|t| !t.trim().is_empty());

        Ok(EffectiveSetting {
            category_id: category.id.clone(),
            label: category.label.clone(),
            enabled: override_or(saved.enabled, || true),
            channels: override_or(saved.channels, || category.channels.clone()),
            cadence: category.cadence,
            schedule,
            template: override_or(custom, || category.template.clone()),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}
