//! Per-cycle query deduplication

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{QueryError, QueryService, Request, ResponseSet};

type Entry = Arc<OnceCell<Result<Arc<ResponseSet>, QueryError>>>;

/// Deduplicates backend requests within one check cycle.
///
/// A cache is built at the start of a cycle and dropped at its end. Each
/// distinct request is fetched at most once; concurrent callers for the same
/// request wait on the first fetch, and a failed fetch is handed to every
/// caller rather than retried.
pub struct QueryCache {
    service: Arc<dyn QueryService>,
    timeout: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    fetches: AtomicUsize,
}

impl QueryCache {
    /// Create an empty cache in front of `service`
    pub fn new(service: Arc<dyn QueryService>, timeout: Duration) -> Self {
        Self {
            service,
            timeout,
            entries: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Fetch `request`, or return the result of an earlier fetch of it
    pub async fn query(&self, request: &Request) -> Result<Arc<ResponseSet>, QueryError> {
        let key = request.cache_key();
        let entry = {
            let mut entries = self.entries.lock();
            entries.entry(key).or_default().clone()
        };

        entry
            .get_or_init(|| async {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                debug!(queries = request.queries.len(), start = request.start, "Fetching from backend");
                match tokio::time::timeout(self.timeout, self.service.query(request)).await {
                    Ok(Ok(responses)) => Ok(Arc::new(responses)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(QueryError::Timeout(self.timeout)),
                }
            })
            .await
            .clone()
    }

    /// Number of requests actually sent to the backend
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Number of distinct requests seen
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
