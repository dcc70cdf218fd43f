//! The alert schedule
//!
//! [`Schedule`] owns every piece of mutable alert state: the per-key
//! [`State`] map, the silence set and the pending-notification map. Two
//! long-lived tasks drive it (see [`Schedule::run`]):
//!
//! - the poll loop runs a check cycle every `check_frequency`, or as soon as
//!   [`Schedule::request_check`] is called;
//! - the notification loop expires pending notifications and fires their
//!   escalations, sleeping until the earliest one is due.
//!
//! Whole check cycles are serialized. Expression evaluation happens without
//! holding the state lock; results are applied under it in one short
//! critical section, and notifications are delivered after it is released.

mod check;
mod dispatch;
mod persist;
mod silence;
mod state;

pub use check::CheckSummary;
pub use silence::Silence;
pub use state::{Event, State};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Conf;
use crate::error::{Error, Result};
use crate::expr::Computation;
use crate::models::{AlertKey, Status};
use crate::notify::Notifier;
use crate::tsdb::QueryService;

/// Notification name → time it was sent
type Pending = HashMap<String, DateTime<Utc>>;

/// Everything that is persisted
#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    #[serde(default)]
    status: HashMap<AlertKey, State>,
    #[serde(default)]
    silences: HashMap<String, Silence>,
    #[serde(default)]
    notifications: HashMap<AlertKey, Pending>,
    #[serde(default)]
    last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    last_save_error: Option<String>,
    /// Bumped for every encoded snapshot, so an older one never overwrites a newer one
    #[serde(skip)]
    generation: u64,
}

impl Inner {
    fn silenced(&self, key: &AlertKey, now: DateTime<Utc>) -> bool {
        self.silences.values().any(|s| s.matches(key, now))
    }
}

/// Read-only view of one alert key
#[derive(Debug, Clone, Serialize)]
pub struct AlertView {
    pub key: AlertKey,
    pub status: Status,
    pub abnormal_status: Status,
    pub need_ack: bool,
    pub silenced: bool,
    pub touched: DateTime<Utc>,
    pub subject: String,
    pub computations: Vec<Computation>,
    /// Notifications currently pending for this key
    pub notifications: Vec<String>,
    pub history: Vec<Event>,
}

/// Point-in-time copy of the schedule for display
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub alerts: Vec<AlertView>,
    pub silences: BTreeMap<String, Silence>,
    pub last_check: Option<DateTime<Utc>>,
    /// Set while the state file cannot be written
    pub last_save_error: Option<String>,
}

/// Runs check cycles and owns all alert state
pub struct Schedule {
    conf: Arc<Conf>,
    backend: Arc<dyn QueryService>,
    notifier: Arc<dyn Notifier>,
    query_timeout: Duration,
    inner: Mutex<Inner>,
    /// Held for the duration of a check cycle
    cycle: tokio::sync::Mutex<()>,
    /// Generation of the last snapshot written to disk
    saved: tokio::sync::Mutex<u64>,
    check_now: Notify,
    wake_notifications: Notify,
}

impl Schedule {
    /// Create a new schedule with empty state
    pub fn new(
        conf: Arc<Conf>,
        backend: Arc<dyn QueryService>,
        notifier: Arc<dyn Notifier>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            conf,
            backend,
            notifier,
            query_timeout,
            inner: Mutex::new(Inner::default()),
            cycle: tokio::sync::Mutex::new(()),
            saved: tokio::sync::Mutex::new(0),
            check_now: Notify::new(),
            wake_notifications: Notify::new(),
        }
    }

    pub fn conf(&self) -> &Conf {
        &self.conf
    }

    /// Load the state file, if one is configured and present
    pub async fn restore(&self) -> Result<()> {
        let Some(path) = &self.conf.state_file else {
            return Ok(());
        };
        if let Some(loaded) = persist::load::<Inner>(path).await? {
            info!(
                path = %path.display(),
                keys = loaded.status.len(),
                silences = loaded.silences.len(),
                "Restored schedule state"
            );
            *self.inner.lock() = loaded;
        }
        Ok(())
    }

    /// Ask the poll loop to run a check cycle now
    pub fn request_check(&self) {
        self.check_now.notify_one();
    }

    pub fn state(&self, key: &AlertKey) -> Option<State> {
        self.inner.lock().status.get(key).cloned()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        let inner = self.inner.lock();
        let mut alerts: Vec<AlertView> = inner
            .status
            .iter()
            .map(|(key, state)| {
                let mut notifications: Vec<String> = inner
                    .notifications
                    .get(key)
                    .map(|p| p.keys().cloned().collect())
                    .unwrap_or_default();
                notifications.sort();
                AlertView {
                    key: key.clone(),
                    status: state.last(),
                    abnormal_status: state.abnormal_status(),
                    need_ack: state.need_ack,
                    silenced: inner.silenced(key, now),
                    touched: state.touched,
                    subject: state.subject.clone(),
                    computations: state.computations.clone(),
                    notifications,
                    history: state.history.clone(),
                }
            })
            .collect();
        alerts.sort_by(|a, b| a.key.cmp(&b.key));

        Snapshot {
            alerts,
            silences: inner.silences.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            last_check: inner.last_check,
            last_save_error: inner.last_save_error.clone(),
        }
    }

    /// Clear `need_ack` and drop pending notifications for `key`
    pub async fn acknowledge(&self, key: &AlertKey) -> Result<()> {
        let bytes = {
            let mut inner = self.inner.lock();
            let state = inner
                .status
                .get_mut(key)
                .ok_or_else(|| Error::not_found("alert", key.to_string()))?;
            state.acknowledge();
            inner.notifications.remove(key);
            self.encode(&mut inner)
        };
        info!(alert = %key, "Acknowledged");
        self.persist(bytes).await;
        Ok(())
    }

    /// Forget `key` entirely
    pub async fn purge(&self, key: &AlertKey) -> Result<()> {
        let bytes = {
            let mut inner = self.inner.lock();
            inner
                .status
                .remove(key)
                .ok_or_else(|| Error::not_found("alert", key.to_string()))?;
            inner.notifications.remove(key);
            self.encode(&mut inner)
        };
        info!(alert = %key, "Purged");
        self.persist(bytes).await;
        Ok(())
    }

    /// Add a silence and return its id
    pub async fn add_silence(&self, silence: Silence) -> Result<String> {
        silence.validate()?;
        let id = silence.id();
        let bytes = {
            let mut inner = self.inner.lock();
            inner.silences.insert(id.clone(), silence);
            self.encode(&mut inner)
        };
        info!(silence = %id, "Silence added");
        self.persist(bytes).await;
        self.request_check();
        Ok(id)
    }

    pub async fn clear_silence(&self, id: &str) -> Result<()> {
        let bytes = {
            let mut inner = self.inner.lock();
            inner
                .silences
                .remove(id)
                .ok_or_else(|| Error::not_found("silence", id))?;
            self.encode(&mut inner)
        };
        info!(silence = %id, "Silence cleared");
        self.persist(bytes).await;
        self.request_check();
        Ok(())
    }

    pub fn silences(&self) -> BTreeMap<String, Silence> {
        let inner = self.inner.lock();
        inner.silences.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Drive the poll and notification loops until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            alerts = self.conf.alerts.len(),
            check_frequency = %humantime::format_duration(self.conf.check_frequency),
            "Starting schedule"
        );
        tokio::join!(
            Arc::clone(&self).poll_loop(cancel.clone()),
            self.notification_loop(cancel)
        );
        info!("Schedule stopped");
    }

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.conf.check_frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                () = self.check_now.notified() => ticker.reset(),
            }
            let (_, outgoing) = self.cycle_at(Utc::now()).await;
            if !outgoing.is_empty() {
                let schedule = Arc::clone(&self);
                tokio::spawn(async move {
                    schedule.dispatch(outgoing).await;
                });
            }
        }
    }

    async fn notification_loop(&self, cancel: CancellationToken) {
        let mut wait = Duration::ZERO;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
                () = self.wake_notifications.notified() => {}
            }
            wait = self.check_notifications().await;
        }
    }

    /// Serialize the persisted state, if there is a state file to write it to
    fn encode(&self, inner: &mut Inner) -> Option<(u64, Vec<u8>)> {
        self.conf.state_file.as_ref()?;
        inner.generation += 1;
        match serde_json::to_vec(&*inner) {
            Ok(bytes) => Some((inner.generation, bytes)),
            Err(e) => {
                error!(error = %e, "Failed to encode schedule state");
                inner.last_save_error = Some(e.to_string());
                None
            }
        }
    }

    /// Write an encoded snapshot, unless a newer one is already on disk
    async fn persist(&self, encoded: Option<(u64, Vec<u8>)>) {
        let (Some(path), Some((generation, bytes))) = (&self.conf.state_file, encoded) else {
            return;
        };
        let mut saved = self.saved.lock().await;
        if *saved >= generation {
            return;
        }
        let result = persist::save(path, &bytes).await;

        let mut inner = self.inner.lock();
        match result {
            Ok(()) => {
                *saved = generation;
                inner.last_save_error = None;
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "Failed to save schedule state; it will be lost on restart"
                );
                metrics::counter!("vigil_state_save_failures_total").increment(1);
                inner.last_save_error = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests;
