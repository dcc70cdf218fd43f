//! Notification targets and delivery

mod sender;

pub use sender::NotificationSender;

use std::time::Duration;

use crate::models::AlertKey;
use crate::template::Template;

/// A configured notification: where to deliver and what follows it.
///
/// `next` and `timeout` form an escalation chain. When a notification with a
/// timeout has been pending that long without acknowledgement, `next` fires.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Notification {
    pub name: String,
    pub email: Vec<String>,
    pub post: Option<String>,
    pub get: Option<String>,
    pub print: bool,
    /// Overrides the alert template's body for this notification
    pub body: Option<Template>,
    pub next: Option<String>,
    pub timeout: Option<Duration>,
}

/// A rendered message for one or more alert keys
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub body: String,
    pub keys: Vec<AlertKey>,
}

/// Outcome of delivering to a single target
#[derive(Debug)]
pub struct Delivery {
    /// e.g. `post:http://...` or `email:ops@example.com`
    pub target: String,
    pub result: Result<(), NotifyError>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("{target} returned {status}")]
    Status { target: String, status: u16 },

    #[error("not delivered: {0}")]
    Unsupported(String),
}

/// Delivers messages to the targets of a notification
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `message` to every target of `notification`.
    ///
    /// A failing target does not stop delivery to the others.
    async fn notify(&self, notification: &Notification, message: &Message) -> Vec<Delivery>;
}

/// Logs what would be sent without delivering anything
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRun;

#[async_trait::async_trait]
impl Notifier for DryRun {
    async fn notify(&self, notification: &Notification, message: &Message) -> Vec<Delivery> {
        tracing::info!(
            notification = %notification.name,
            subject = %message.subject,
            keys = message.keys.len(),
            "Would notify"
        );
        Vec::new()
    }
}
