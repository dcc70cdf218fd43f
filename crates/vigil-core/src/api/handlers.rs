//! API handlers for the HTTP REST API

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::expr::{Context, Expr, GroupResult};
use crate::models::{AlertKey, Status};
use crate::sched::{AlertView, CheckSummary, Schedule, Silence, Snapshot};
use crate::tsdb::{QueryCache, QueryService};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub schedule: Arc<Schedule>,
    pub backend: Arc<dyn QueryService>,
    pub query_timeout: Duration,
    pub metrics: PrometheusHandle,
}

type ApiError = (StatusCode, String);

fn api_error(e: Error) -> ApiError {
    let status = match &e {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Validation(_) | Error::Parse(_) => StatusCode::BAD_REQUEST,
        Error::Eval(_) | Error::Query(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn parse_key(key: &str) -> Result<AlertKey, ApiError> {
    key.parse().map_err(api_error)
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub last_check: Option<DateTime<Utc>>,
    pub last_save_error: Option<String>,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.schedule.snapshot(Utc::now());
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        last_check: snapshot.last_check,
        last_save_error: snapshot.last_save_error,
    })
}

/// Query parameters for listing alerts
#[derive(Debug, Default, Deserialize)]
pub struct ListAlertsQuery {
    /// Only keys whose current status is at least this severe
    pub status: Option<Status>,
    /// Only keys of this alert
    pub alert: Option<String>,
}

/// Current schedule state
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<ListAlertsQuery>,
) -> Json<Snapshot> {
    let mut snapshot = state.schedule.snapshot(Utc::now());
    snapshot.alerts.retain(|a| {
        query.status.map_or(true, |s| a.status >= s)
            && query.alert.as_deref().map_or(true, |n| a.key.name() == n)
    });
    Json(snapshot)
}

/// State of one alert key
pub async fn get_alert(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<AlertView>, ApiError> {
    let key = parse_key(&key)?;
    state
        .schedule
        .snapshot(Utc::now())
        .alerts
        .into_iter()
        .find(|a| a.key == key)
        .map(Json)
        .ok_or_else(|| api_error(Error::not_found("alert", key.to_string())))
}

/// Run a check cycle immediately and return its summary
pub async fn run_check(State(state): State<AppState>) -> Json<CheckSummary> {
    Json(state.schedule.check().await)
}

pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = parse_key(&key)?;
    state.schedule.acknowledge(&key).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn purge_alert(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = parse_key(&key)?;
    state.schedule.purge(&key).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_silences(State(state): State<AppState>) -> Json<BTreeMap<String, Silence>> {
    Json(state.schedule.silences())
}

/// Silence creation request. Either `end` or `duration` bounds it.
#[derive(Debug, Deserialize)]
pub struct CreateSilenceRequest {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub alert: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl CreateSilenceRequest {
    /// Resolve the request into a silence as of `now`
    pub fn into_silence(self, now: DateTime<Utc>) -> crate::Result<Silence> {
        let start = self.start.unwrap_or(now);
        let end = match (self.end, self.duration) {
            (Some(end), None) => end,
            (None, Some(d)) => {
                let d = chrono::Duration::from_std(d)
                    .map_err(|_| Error::validation("silence duration out of range"))?;
                start + d
            }
            _ => return Err(Error::validation("exactly one of end or duration is required")),
        };
        Silence::new(start, end, self.alert, self.tags)
    }
}

#[derive(Serialize)]
pub struct CreateSilenceResponse {
    pub id: String,
}

pub async fn create_silence(
    State(state): State<AppState>,
    Json(req): Json<CreateSilenceRequest>,
) -> Result<(StatusCode, Json<CreateSilenceResponse>), ApiError> {
    let silence = req.into_silence(Utc::now()).map_err(api_error)?;
    let id = state.schedule.add_silence(silence).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(CreateSilenceResponse { id })))
}

pub async fn clear_silence(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.schedule.clear_silence(&id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Ad-hoc expression evaluation request
#[derive(Debug, Deserialize)]
pub struct EvalRequest {
    pub expr: String,
    /// Evaluate as of this time instead of now
    pub time: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct EvalResponse {
    pub time: DateTime<Utc>,
    pub results: Vec<GroupResult>,
    /// Backend fetches the evaluation needed
    pub fetches: usize,
}

pub async fn evaluate_expr(
    State(state): State<AppState>,
    Json(req): Json<EvalRequest>,
) -> Result<Json<EvalResponse>, ApiError> {
    let expr = Expr::parse(&req.expr).map_err(|e| api_error(e.into()))?;
    let time = req.time.unwrap_or_else(Utc::now);
    let cache = QueryCache::new(state.backend.clone(), state.query_timeout);
    let results = expr
        .evaluate(&Context::new(time, &cache))
        .await
        .map_err(|e| api_error(e.into()))?;
    Ok(Json(EvalResponse {
        time,
        results,
        fetches: cache.fetch_count(),
    }))
}

/// Prometheus exposition of the scheduler's own metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render())
}
