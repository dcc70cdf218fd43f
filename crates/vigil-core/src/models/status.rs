//! Alert status

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Severity of one alert instance.
///
/// Variants are declared in ascending severity so the derived ordering can be
/// compared directly: `Normal < Warning < Critical < Unknown < Error`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Condition is false
    #[default]
    Normal,
    /// Warn expression is true
    Warning,
    /// Crit expression is true
    Critical,
    /// No data seen for longer than the unknown duration
    Unknown,
    /// Expression produced a non-finite value
    Error,
}

impl Status {
    /// Anything other than `Normal`
    pub fn is_abnormal(self) -> bool {
        self != Status::Normal
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Normal => "normal",
            Status::Warning => "warning",
            Status::Critical => "critical",
            Status::Unknown => "unknown",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Status::Normal),
            "warning" => Ok(Status::Warning),
            "critical" => Ok(Status::Critical),
            "unknown" => Ok(Status::Unknown),
            "error" => Ok(Status::Error),
            other => Err(Error::validation(format!("unknown status: {other}"))),
        }
    }
}
