//! Default notifier: print, HTTP POST/GET, and an email stub

use std::time::Duration;

use reqwest::Client;
use tracing::{info, warn};

use super::{Delivery, Message, Notification, NotifyError, Notifier};
use crate::error::{Error, Result};

/// Sends notifications through HTTP and the log
pub struct NotificationSender {
    client: Client,
}

impl NotificationSender {
    /// Create a new notification sender
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }

    async fn post(&self, url: &str, message: &Message) -> std::result::Result<(), NotifyError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(post_body(message))
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Status {
                target: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn get(&self, url: &str) -> std::result::Result<(), NotifyError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Status {
                target: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Body for POST targets: the rendered body, or the subject when there is none
fn post_body(message: &Message) -> String {
    if message.body.is_empty() {
        message.subject.clone()
    } else {
        message.body.clone()
    }
}

#[async_trait::async_trait]
impl Notifier for NotificationSender {
    async fn notify(&self, notification: &Notification, message: &Message) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        let keys: Vec<String> = message.keys.iter().map(ToString::to_string).collect();

        if notification.print {
            info!(
                notification = %notification.name,
                keys = ?keys,
                subject = %message.subject,
                "Notification"
            );
            deliveries.push(Delivery {
                target: "print".into(),
                result: Ok(()),
            });
        }

        if let Some(url) = &notification.post {
            deliveries.push(Delivery {
                target: format!("post:{url}"),
                result: self.post(url, message).await,
            });
        }

        if let Some(url) = &notification.get {
            deliveries.push(Delivery {
                target: format!("get:{url}"),
                result: self.get(url).await,
            });
        }

        for to in &notification.email {
            // SMTP delivery is not wired up
            warn!(
                notification = %notification.name,
                recipient = %to,
                subject = %message.subject,
                "Email notifications not yet implemented"
            );
            deliveries.push(Delivery {
                target: format!("email:{to}"),
                result: Err(NotifyError::Unsupported("email".into())),
            });
        }

        deliveries
    }
}
