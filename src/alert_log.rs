use crate::models::{Alert, Severity};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::info;

pub const ALERT_CAPACITY: usize = 10;

#[derive(Debug, Default)]
struct AlertEntries {
    alerts: VecDeque<Alert>,
    last_id: u64,
}

/// Most-recent-first list of geofence notifications, capped at [`ALERT_CAPACITY`].
#[derive(Debug, Default)]
pub struct AlertLog {
    entries: Mutex<AlertEntries>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn wall_clock() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, AlertEntries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a boundary crossing. The oldest alert is evicted past capacity.
    pub fn raise(&self, vehicle_id: &str, vehicle_name: &str, is_outside: bool) -> Alert {
        let (verb, severity) = if is_outside {
            ("left", Severity::Warning)
        } else {
            ("returned to", Severity::Info)
        };

        let mut entries = self.entries();
        // Time-derived, but strictly increasing even within one millisecond.
        let id = now_millis().max(entries.last_id + 1);
        entries.last_id = id;

        let alert = Alert {
            id,
            vehicle_id: vehicle_id.to_string(),
            message: format!("{} has {} its designated area", vehicle_name, verb),
            timestamp: wall_clock(),
            severity,
        };

        entries.alerts.push_front(alert.clone());
        entries.alerts.truncate(ALERT_CAPACITY);

        info!("Alert {}: {}", alert.id, alert.message);
        alert
    }

    /// Removes the alert with `id`. Returns false if no such alert exists.
    pub fn dismiss(&self, id: u64) -> bool {
        let mut entries = self.entries();
        let before = entries.alerts.len();
        entries.alerts.retain(|alert| alert.id != id);
        entries.alerts.len() != before
    }

    pub fn list(&self) -> Vec<Alert> {
        self.entries().alerts.iter().cloned().collect()
    }
}
