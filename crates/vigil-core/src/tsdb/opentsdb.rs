//! HTTP client for OpenTSDB-compatible backends

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use super::{QueryError, QueryService, Request, ResponseSet};
use crate::config::TsdbConfig;
use crate::error::{Error, Result};

/// Sends requests to `POST {url}/api/query`
#[derive(Clone)]
pub struct OpenTsdbClient {
    client: Client,
    url: String,
    timeout: Duration,
}

impl OpenTsdbClient {
    /// Create a new client for the configured backend
    pub fn new(config: &TsdbConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: format!("{}/api/query", config.url.trim_end_matches('/')),
            timeout: config.timeout,
        })
    }
}

#[async_trait::async_trait]
impl QueryService for OpenTsdbClient {
    async fn query(&self, request: &Request) -> std::result::Result<ResponseSet, QueryError> {
        debug!(url = %self.url, start = request.start, "Querying backend");

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    QueryError::Timeout(self.timeout)
                } else {
                    QueryError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::Backend {
                status: status.as_u16(),
                message: body,
            });
        }

        response
            .json::<ResponseSet>()
            .await
            .map_err(|e| QueryError::Decode(e.to_string()))
    }
}
