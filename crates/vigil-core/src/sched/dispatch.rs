//! Notification delivery and escalation

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::Schedule;
use crate::expr::Computation;
use crate::models::{AlertKey, Status};
use crate::notify::{Message, Notification};
use crate::template::{Template, TemplateData};

/// A notification rendered for one key, waiting to be sent
#[derive(Debug, Clone)]
pub(super) struct Outgoing {
    notification: String,
    key: AlertKey,
    status: Status,
    subject: String,
    body: String,
}

impl Outgoing {
    pub(super) fn render(
        notification: &Notification,
        template: &Template,
        key: &AlertKey,
        status: Status,
        computations: &[Computation],
    ) -> Self {
        let data = TemplateData {
            key,
            status,
            computations,
        };
        Self {
            notification: notification.name.clone(),
            key: key.clone(),
            status,
            subject: template.render_subject(&data),
            body: notification.body.as_ref().unwrap_or(template).render_body(&data),
        }
    }
}

/// Turn rendered sends into messages, one per key, except that unknown
/// sends sharing a notification and alert name become a single message.
fn coalesce(outgoing: Vec<Outgoing>) -> Vec<(String, Message)> {
    let mut messages = Vec::new();
    let mut unknown: BTreeMap<(String, String), Vec<Outgoing>> = BTreeMap::new();

    for o in outgoing {
        if o.status == Status::Unknown {
            unknown
                .entry((o.notification.clone(), o.key.name().to_string()))
                .or_default()
                .push(o);
        } else {
            messages.push((
                o.notification,
                Message {
                    subject: o.subject,
                    body: o.body,
                    keys: vec![o.key],
                },
            ));
        }
    }

    for ((notification, alert), mut group) in unknown {
        if group.len() == 1 {
            if let Some(o) = group.pop() {
                messages.push((
                    notification,
                    Message {
                        subject: o.subject,
                        body: o.body,
                        keys: vec![o.key],
                    },
                ));
            }
            continue;
        }
        let keys: Vec<AlertKey> = group.into_iter().map(|o| o.key).collect();
        let body = keys.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n");
        messages.push((
            notification,
            Message {
                subject: format!("unknown: {} keys of {alert}", keys.len()),
                body,
                keys,
            },
        ));
    }
    messages
}

impl Schedule {
    /// Deliver rendered notifications. Returns the number of messages that
    /// reached at least one target.
    pub(super) async fn dispatch(&self, outgoing: Vec<Outgoing>) -> usize {
        let messages = coalesce(outgoing);
        let sends = messages.iter().filter_map(|(name, message)| {
            let notification = self.conf.notifications.get(name)?;
            Some(async move {
                let mut delivered = false;
                for d in self.notifier.notify(notification, message).await {
                    match d.result {
                        Ok(()) => {
                            delivered = true;
                            metrics::counter!("vigil_notifications_sent_total").increment(1);
                            debug!(notification = %name, target = %d.target, keys = message.keys.len(), "Delivered");
                        }
                        Err(e) => {
                            metrics::counter!("vigil_notifications_failed_total").increment(1);
                            warn!(notification = %name, target = %d.target, error = %e, "Delivery failed");
                        }
                    }
                }
                delivered
            })
        });
        let results = join_all(sends).await;
        let delivered = results.iter().filter(|ok| **ok).count();
        if !results.is_empty() {
            info!(messages = results.len(), delivered, "Notifications sent");
        }
        delivered
    }

    /// Expire pending notifications and fire escalations at the current time
    pub async fn check_notifications(&self) -> Duration {
        self.check_notifications_at(Utc::now()).await
    }

    /// Expire pending notifications and fire escalations as of `now`.
    ///
    /// A pending notification with a timeout expires once the timeout has
    /// passed. If the key still needs acknowledgement and is not silenced,
    /// the notification's `next` fires and becomes pending in its place.
    /// Silenced keys keep their expired entries until the silence ends.
    ///
    /// Returns how long to wait before the next pass.
    pub async fn check_notifications_at(&self, now: DateTime<Utc>) -> Duration {
        let (outgoing, encoded, wait) = {
            let mut inner = self.inner.lock();
            let mut wait = self.conf.max_notification_wait;
            let mut outgoing = Vec::new();
            let mut changed = false;

            let keys: Vec<AlertKey> = inner.notifications.keys().cloned().collect();
            for key in keys {
                let silenced = inner.silenced(&key, now);
                let Some(mut pending) = inner.notifications.remove(&key) else {
                    continue;
                };
                let names: Vec<(String, DateTime<Utc>)> =
                    pending.iter().map(|(n, t)| (n.clone(), *t)).collect();

                for (name, sent) in names {
                    let Some(notification) = self.conf.notifications.get(&name) else {
                        pending.remove(&name);
                        changed = true;
                        continue;
                    };
                    let Some(timeout) = notification.timeout else {
                        continue;
                    };
                    let Some(due) = chrono::Duration::from_std(timeout)
                        .ok()
                        .and_then(|t| sent.checked_add_signed(t))
                    else {
                        continue;
                    };
                    if now < due {
                        wait = wait.min((due - now).to_std().unwrap_or_default());
                        continue;
                    }
                    if silenced {
                        wait = wait.min(self.conf.check_frequency);
                        continue;
                    }

                    pending.remove(&name);
                    changed = true;
                    let Some(state) = inner.status.get(&key) else {
                        continue;
                    };
                    if !state.need_ack {
                        continue;
                    }
                    let Some(next) = notification
                        .next
                        .as_ref()
                        .and_then(|n| self.conf.notifications.get(n))
                    else {
                        continue;
                    };

                    let template = self
                        .conf
                        .alerts
                        .get(key.name())
                        .map_or_else(|| self.conf.default_template(), |a| self.conf.template_for(a));
                    let status = state.abnormal_status();
                    info!(alert = %key, from = %name, to = %next.name, "Escalating notification");
                    outgoing.push(Outgoing::render(next, template, &key, status, &state.computations));
                    pending.insert(next.name.clone(), now);
                    if let Some(t) = next.timeout {
                        wait = wait.min(t);
                    }
                }

                if !pending.is_empty() {
                    inner.notifications.insert(key, pending);
                }
            }

            let encoded = if changed { self.encode(&mut inner) } else { None };
            (outgoing, encoded, wait)
        };

        self.persist(encoded).await;
        self.dispatch(outgoing).await;
        debug!(wait = %humantime::format_duration(wait), "Next notification pass");
        wait
    }
}
