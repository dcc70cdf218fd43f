//! In-memory collaborators for tests

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::models::AlertKey;
use crate::notify::{Delivery, Message, Notification, Notifier, NotifyError};
use crate::tsdb::{QueryError, QueryService, Request, ResponseSet};

/// Answers requests by metric name from a fixed table
#[derive(Default)]
pub struct StaticQueryService {
    responses: Mutex<HashMap<String, Result<ResponseSet, QueryError>>>,
    requests: Mutex<Vec<Request>>,
    delay: Option<Duration>,
}

impl StaticQueryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer every request for `metric` with `responses`, replacing any earlier answer
    pub fn respond(&self, metric: &str, responses: ResponseSet) {
        self.responses.lock().insert(metric.to_string(), Ok(responses));
    }

    pub fn fail(&self, metric: &str, error: QueryError) {
        self.responses.lock().insert(metric.to_string(), Err(error));
    }

    /// Requests received so far, in arrival order
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait::async_trait]
impl QueryService for StaticQueryService {
    async fn query(&self, request: &Request) -> Result<ResponseSet, QueryError> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let metric = request.queries.first().map(|q| q.metric.as_str()).unwrap_or_default();
        self.responses
            .lock()
            .get(metric)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// One captured notifier call
#[derive(Debug, Clone)]
pub struct Sent {
    pub notification: String,
    pub subject: String,
    pub body: String,
    pub keys: Vec<AlertKey>,
}

/// Records every send instead of delivering it
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
    delay: Option<Duration>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every send for `delay` after recording it
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Record sends but report every delivery as failed
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    /// Names of the notifications sent, in order
    pub fn names(&self) -> Vec<String> {
        self.sent.lock().iter().map(|s| s.notification.clone()).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification, message: &Message) -> Vec<Delivery> {
        self.sent.lock().push(Sent {
            notification: notification.name.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            keys: message.keys.clone(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = if self.failing {
            Err(NotifyError::Status {
                target: "recorder".into(),
                status: 503,
            })
        } else {
            Ok(())
        };
        vec![Delivery {
            target: "recorder".into(),
            result,
        }]
    }
}
