//! Static category catalog: what each kind of notification does by default.
//!
//! Loaded once at startup (built-ins plus config overrides) and never
//! mutated afterwards.

use std::collections::BTreeMap;

use chrono::{NaiveTime, Weekday};
use schoolbell_core::types::{Cadence, Channel, NotificationCategory, Schedule};

/// Process-wide map from category id to its default behavior.
#[derive(Debug, Clone)]
pub struct Catalog {
    categories: BTreeMap<String, NotificationCategory>,
}

const WEEKDAYS: [Weekday; 5] = [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri];
const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

fn at(hour: u32, minute: u32, days: &[Weekday]) -> Option<Schedule> {
    NaiveTime::from_hms_opt(hour, minute, 0).map(|t| Schedule::new(t, days.to_vec()))
}

fn category(
    id: &str,
    label: &str,
    channels: &[Channel],
    cadence: Cadence,
    schedule: Option<Schedule>,
    template: &str,
) -> NotificationCategory {
    NotificationCategory {
        id: id.to_string(),
        label: label.to_string(),
        channels: channels.to_vec(),
        cadence,
        schedule,
        template: template.to_string(),
    }
}

impl Catalog {
    /// The categories every institution starts with.
    pub fn builtin() -> Self {
        let list = vec![
            category(
                "attendance_absent",
                "Student Absent",
                &[Channel::Sms, Channel::InApp],
                Cadence::Realtime,
                None,
                "Dear {guardian_name}, {student_name} was marked absent on {attendance_date}. \
                 Please contact the school if this is unexpected.",
            ),
            category(
                "attendance_late",
                "Late Arrival",
                &[Channel::InApp],
                Cadence::Realtime,
                None,
                "{student_name} arrived late on {attendance_date}.",
            ),
            category(
                "fee_reminder",
                "Fee Reminder",
                &[Channel::Sms, Channel::Email, Channel::InApp],
                Cadence::Daily,
                at(8, 0, &WEEKDAYS),
                "Reminder: a fee of {amount} for {student_name} is due on {due_date}.",
            ),
            category(
                "fee_overdue",
                "Fee Overdue",
                &[Channel::Sms, Channel::Email],
                Cadence::Weekly,
                at(9, 0, &[Weekday::Mon]),
                "The fee of {amount} for {student_name} was due on {due_date} and is now overdue.",
            ),
            category(
                "payment_confirmation",
                "Payment Received",
                &[Channel::Sms, Channel::Email, Channel::InApp],
                Cadence::Realtime,
                None,
                "Payment of {amount} received for {student_name}. Receipt: {receipt_number}.",
            ),
            category(
                "birthday_wishes",
                "Birthday Wishes",
                &[Channel::Sms, Channel::InApp],
                Cadence::Daily,
                at(7, 0, &ALL_DAYS),
                "Happy birthday, {student_name}! Best wishes from everyone at {school_name}.",
            ),
            category(
                "exam_results",
                "Exam Results Published",
                &[Channel::Email, Channel::InApp],
                Cadence::Realtime,
                None,
                "Results for {exam_name} are now available for {student_name}.",
            ),
        ];
        Self::from_categories(list)
    }

    pub fn from_categories(list: Vec<NotificationCategory>) -> Self {
        Self {
            categories: list.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    /// Built-ins with config entries layered on top (same id replaces).
    pub fn with_overrides(extra: &[NotificationCategory]) -> Self {
        let mut catalog = Self::builtin();
        for c in extra {
            if catalog.categories.contains_key(&c.id) {
                tracing::info!("Category '{}' overridden by configuration", c.id);
            }
            catalog.categories.insert(c.id.clone(), c.clone());
        }
        catalog
    }

    pub fn get(&self, id: &str) -> Option<&NotificationCategory> {
        self.categories.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.categories.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NotificationCategory> {
        self.categories.values()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}
