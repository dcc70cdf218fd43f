//! One check cycle

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info};

use super::dispatch::Outgoing;
use super::{Inner, Schedule, State};
use crate::config::Alert;
use crate::expr::{Computation, Context, Expr, GroupResult};
use crate::models::{AlertKey, Status};
use crate::template::TemplateData;
use crate::tsdb::QueryCache;

/// What one check cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckSummary {
    pub time: Option<DateTime<Utc>>,
    /// Alerts evaluated
    pub alerts: usize,
    /// Alerts skipped because an expression failed
    pub failed: Vec<String>,
    /// Keys whose state was updated
    pub keys: usize,
    /// Keys marked unknown
    pub unknown: usize,
    /// Notification messages delivered to at least one target
    pub notifications: usize,
}

/// Evaluated status of one key
struct Evaluated {
    status: Status,
    computations: Vec<Computation>,
}

/// Map an expression value to a status: NaN is an error, non-zero fires.
fn status_of(result: &GroupResult, fired: Status) -> Status {
    match result.value.as_number() {
        Some(v) if v.is_nan() => Status::Error,
        Some(v) if v != 0.0 => fired,
        _ => Status::Normal,
    }
}

impl Schedule {
    /// Run one check cycle at the current time
    pub async fn check(&self) -> CheckSummary {
        self.check_at(Utc::now()).await
    }

    /// Run one check cycle as of `now` and deliver what it queued
    pub async fn check_at(&self, now: DateTime<Utc>) -> CheckSummary {
        let (mut summary, outgoing) = self.cycle_at(now).await;
        summary.notifications = self.dispatch(outgoing).await;
        summary
    }

    /// Evaluate every alert and update state. Delivery is left to the
    /// caller so a slow notifier never holds up the next cycle.
    pub(super) async fn cycle_at(&self, now: DateTime<Utc>) -> (CheckSummary, Vec<Outgoing>) {
        let cycle = self.cycle.lock().await;
        let started = Instant::now();

        let cache = QueryCache::new(self.backend.clone(), self.query_timeout);
        let ctx = Context::new(now, &cache);
        let outcomes = join_all(self.conf.alerts.values().map(|a| self.evaluate_alert(a, &ctx))).await;

        let mut summary = CheckSummary {
            time: Some(now),
            alerts: self.conf.alerts.len(),
            ..Default::default()
        };
        let mut statuses = BTreeMap::new();
        for (alert, outcome) in self.conf.alerts.values().zip(outcomes) {
            match outcome {
                Some(keys) => statuses.extend(keys),
                None => summary.failed.push(alert.name.clone()),
            }
        }

        let (outgoing, encoded) = {
            let mut inner = self.inner.lock();
            inner.silences.retain(|_, s| !s.has_expired(now));
            summary.unknown = self.mark_unknown(&inner, &mut statuses, now);
            summary.keys = statuses.len();

            let mut outgoing = Vec::new();
            for (key, evaluated) in statuses {
                self.apply(&mut inner, key, evaluated, now, &mut outgoing);
            }
            inner.last_check = Some(now);
            (outgoing, self.encode(&mut inner))
        };
        drop(cycle);

        self.persist(encoded).await;
        if !outgoing.is_empty() {
            self.wake_notifications.notify_one();
        }

        let elapsed = started.elapsed();
        metrics::counter!("vigil_checks_total").increment(1);
        metrics::counter!("vigil_alert_failures_total").increment(summary.failed.len() as u64);
        metrics::histogram!("vigil_check_duration_seconds").record(elapsed.as_secs_f64());
        info!(
            alerts = summary.alerts,
            failed = summary.failed.len(),
            keys = summary.keys,
            unknown = summary.unknown,
            queued = outgoing.len(),
            fetches = cache.fetch_count(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Check cycle complete"
        );
        (summary, outgoing)
    }

    /// Evaluate crit, then warn. `None` if either fails.
    async fn evaluate_alert(&self, alert: &Alert, ctx: &Context<'_>) -> Option<BTreeMap<AlertKey, Evaluated>> {
        let mut keys: BTreeMap<AlertKey, Evaluated> = BTreeMap::new();

        if let Some(crit) = &alert.crit {
            for r in self.evaluate_expr(alert, "crit", crit, ctx).await? {
                keys.insert(
                    AlertKey::new(alert.name.clone(), r.group.clone()),
                    Evaluated {
                        status: status_of(&r, Status::Critical),
                        computations: r.computations,
                    },
                );
            }
        }

        if let Some(warn) = &alert.warn {
            for r in self.evaluate_expr(alert, "warn", warn, ctx).await? {
                let key = AlertKey::new(alert.name.clone(), r.group.clone());
                let status = status_of(&r, Status::Warning);
                match keys.get_mut(&key) {
                    // crit takes precedence for the same key
                    Some(existing) if existing.status == Status::Critical => {}
                    Some(existing) if existing.status >= status => {}
                    _ => {
                        keys.insert(
                            key,
                            Evaluated {
                                status,
                                computations: r.computations,
                            },
                        );
                    }
                }
            }
        }

        Some(keys)
    }

    async fn evaluate_expr(
        &self,
        alert: &Alert,
        which: &str,
        expr: &Expr,
        ctx: &Context<'_>,
    ) -> Option<Vec<GroupResult>> {
        match expr.evaluate(ctx).await {
            Ok(results) => {
                debug!(alert = %alert.name, expr = which, results = results.len(), "Evaluated");
                Some(results)
            }
            Err(e) => {
                error!(alert = %alert.name, expr = which, error = %e, "Skipping alert this cycle");
                None
            }
        }
    }

    /// Mark keys that have not been seen for their alert's unknown period
    fn mark_unknown(
        &self,
        inner: &Inner,
        statuses: &mut BTreeMap<AlertKey, Evaluated>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut count = 0;
        for (key, state) in &inner.status {
            if statuses.contains_key(key) {
                continue;
            }
            // Keys of removed alerts are left alone.
            let Some(alert) = self.conf.alerts.get(key.name()) else {
                continue;
            };
            let Ok(grace) = chrono::Duration::from_std(self.conf.unknown_for(alert)) else {
                continue;
            };
            if now - state.touched > grace {
                statuses.insert(
                    key.clone(),
                    Evaluated {
                        status: Status::Unknown,
                        computations: Vec::new(),
                    },
                );
                count += 1;
            }
        }
        count
    }

    /// Append the new status to `key`'s state and decide what to send
    fn apply(
        &self,
        inner: &mut Inner,
        key: AlertKey,
        evaluated: Evaluated,
        now: DateTime<Utc>,
        outgoing: &mut Vec<Outgoing>,
    ) {
        let Some(alert) = self.conf.alerts.get(key.name()) else {
            return;
        };
        let silenced = inner.silenced(&key, now);
        let pending = inner.notifications.get(&key).is_some_and(|p| !p.is_empty());
        let status = evaluated.status;

        let state = inner
            .status
            .entry(key.clone())
            .or_insert_with(|| State::new(&key, now));
        if status != Status::Unknown {
            state.touch(now);
            state.computations = evaluated.computations;
        }
        let prev = state.append(status, now);

        let template = self.conf.template_for(alert);
        if status.is_abnormal() {
            state.subject = template.render_subject(&TemplateData {
                key: &key,
                status,
                computations: &state.computations,
            });
        }

        if status > prev {
            debug!(alert = %key, from = %prev, to = %status, silenced, "Escalated");
            inner.notifications.remove(&key);
            state.need_ack = true;
        }

        // Escalations notify, as does an abnormal status that outranks the
        // last one notified (for instance once a silence has ended). A
        // de-escalation that nobody has acknowledged notifies again.
        let notify = if silenced {
            None
        } else if status > prev || (status.is_abnormal() && status > state.notified_status) {
            Some(status)
        } else if status < prev && state.need_ack && pending {
            Some(if status == Status::Normal {
                state.abnormal_status()
            } else {
                status
            })
        } else {
            None
        };

        if let Some(severity) = notify {
            let names = if severity == Status::Warning {
                &alert.warn_notification
            } else {
                &alert.crit_notification
            };
            for name in names {
                let Some(notification) = self.conf.notifications.get(name) else {
                    continue;
                };
                outgoing.push(Outgoing::render(notification, template, &key, status, &state.computations));
                inner
                    .notifications
                    .entry(key.clone())
                    .or_default()
                    .insert(name.clone(), now);
            }
            if status.is_abnormal() {
                state.notified_status = status;
            }
        }

        if status == Status::Normal {
            state.notified_status = Status::Normal;
        }
    }
}
