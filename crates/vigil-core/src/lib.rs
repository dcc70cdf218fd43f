//! # Vigil
//!
//! Expression-driven alert scheduler for OpenTSDB-compatible time series.
//!
//! Vigil periodically evaluates alert expressions against a time-series
//! backend, tracks every alert key through its lifecycle (normal, warning,
//! critical, unknown, acknowledged) and delivers notifications with
//! escalation chains and silences.
//!
//! ## Architecture
//!
//! - **Expressions** (`expr`): parser and async evaluator with per-cycle query deduplication
//! - **Backend** (`tsdb`): query model, OpenTSDB HTTP client and the query cache
//! - **Schedule** (`sched`): check cycles, per-key state, silences, notification escalation
//! - **Notifications** (`notify`, `template`): targets, delivery and message templates
//! - **API**: REST API for state, acknowledgements and silences
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the scheduler and API
//! vigil --config vigil.toml serve
//!
//! # Evaluate an expression once
//! vigil expr 'avg(q("sum:cpu{host=*}", "5m")) > 80'
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod api;
pub mod config;
pub mod error;
pub mod expr;
pub mod models;
pub mod notify;
pub mod sched;
pub mod template;
pub mod tsdb;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::{Conf, Config};
    pub use crate::error::{Error, Result};
    pub use crate::expr::{Context, Expr};
    pub use crate::models::*;
    pub use crate::notify::{Notification, Notifier};
    pub use crate::sched::{Schedule, Silence};
    pub use crate::tsdb::{QueryCache, QueryService};
}
