//! Time-series backend contract
//!
//! Expressions never talk to the backend directly. They build a [`Request`],
//! hand it to a [`QueryService`] (normally through the per-cycle
//! [`QueryCache`]) and get back a [`ResponseSet`].

mod cache;
mod opentsdb;
mod query;

pub use cache::QueryCache;
pub use opentsdb::OpenTsdbClient;
pub use query::{Query, RateOptions};

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::TagSet;

/// A points-in-time series: unix seconds → value
pub type Series = BTreeMap<i64, f64>;

/// One backend request covering a time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Window start, unix seconds
    pub start: i64,
    /// Window end, unix seconds (backend "now" when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    pub queries: Vec<Query>,
}

impl Request {
    /// Canonical text used as the cache key
    pub fn cache_key(&self) -> String {
        // Serialization of plain structs, strings and numbers cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// One series group returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub metric: String,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default)]
    pub dps: Series,
}

/// All groups returned for one request
pub type ResponseSet = Vec<Response>;

/// Errors from the time-series backend.
///
/// Cloneable so a cached failure can be handed to every caller that asked for
/// the same request within one check cycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    /// Query text could not be parsed
    #[error("invalid query {query:?}: {reason}")]
    InvalidQuery { query: String, reason: String },

    /// Connection or transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Backend answered with a non-success status
    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    /// Backend did not answer in time
    #[error("query timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    /// Response body could not be decoded
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Anything that can answer time-series requests
#[async_trait::async_trait]
pub trait QueryService: Send + Sync {
    /// Execute one request
    async fn query(&self, request: &Request) -> Result<ResponseSet, QueryError>;
}
