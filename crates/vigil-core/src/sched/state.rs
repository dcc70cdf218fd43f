//! Per-alert-key bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::expr::Computation;
use crate::models::{AlertKey, Status, TagSet};

/// One history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub status: Status,
}

/// Everything the schedule remembers about one alert key.
///
/// Pure data: nothing here performs I/O or sends notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub alert: String,
    /// String form of `group`
    pub tags: String,
    pub group: TagSet,
    /// Oldest first
    pub history: Vec<Event>,
    pub need_ack: bool,
    /// Rendered when the key last went abnormal
    #[serde(default)]
    pub subject: String,
    pub touched: DateTime<Utc>,
    #[serde(default)]
    pub computations: Vec<Computation>,
    /// History length at the last acknowledgement
    #[serde(default)]
    pub ack_index: usize,
    /// Severity of the last notification sent, reset when the key goes normal
    #[serde(default)]
    pub notified_status: Status,
}

impl State {
    pub fn new(key: &AlertKey, now: DateTime<Utc>) -> Self {
        Self {
            alert: key.name().to_string(),
            tags: key.group().to_string(),
            group: key.group().clone(),
            history: Vec::new(),
            need_ack: false,
            subject: String::new(),
            touched: now,
            computations: Vec::new(),
            ack_index: 0,
            notified_status: Status::Normal,
        }
    }

    /// Record that the key was seen at `now`. Never moves backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.touched {
            self.touched = now;
        }
    }

    /// Append `status` and return the status that was last before it
    pub fn append(&mut self, status: Status, now: DateTime<Utc>) -> Status {
        let prev = self.last();
        self.history.push(Event { time: now, status });
        prev
    }

    /// Most recent status, `Normal` when there is no history
    pub fn last(&self) -> Status {
        self.history.last().map_or(Status::Normal, |e| e.status)
    }

    /// Highest status seen since the last acknowledgement
    pub fn abnormal_status(&self) -> Status {
        self.history
            .get(self.ack_index..)
            .and_then(|since| since.iter().map(|e| e.status).max())
            .unwrap_or_else(|| self.last())
    }

    pub fn alert_key(&self) -> AlertKey {
        AlertKey::new(self.alert.clone(), self.group.clone())
    }

    pub fn acknowledge(&mut self) {
        self.need_ack = false;
        self.ack_index = self.history.len();
    }
}
