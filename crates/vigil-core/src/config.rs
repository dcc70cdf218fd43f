//! Configuration management for Vigil
//!
//! [`Config`] is the raw, deserialized file. [`Config::into_conf`] validates
//! it and produces the typed [`Conf`] the schedule runs on.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::notify::Notification;
use crate::template::Template;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,

    /// Time-series backend
    pub tsdb: TsdbConfig,

    /// Check cycle configuration
    pub schedule: ScheduleConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    pub templates: BTreeMap<String, TemplateConfig>,
    pub notifications: BTreeMap<String, NotificationConfig>,
    pub alerts: BTreeMap<String, AlertConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// HTTP API port
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8070,
        }
    }
}

/// Time-series backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TsdbConfig {
    /// Base URL, e.g. `http://localhost:4242`
    pub url: String,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:4242".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Check cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Interval between check cycles
    #[serde(with = "humantime_serde")]
    pub check_frequency: Duration,
    /// How long a key may go unseen before it is marked unknown
    #[serde(with = "humantime_serde")]
    pub unknown: Duration,
    /// Where schedule state is persisted; in-memory only when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    /// Longest the notification loop sleeps between passes
    #[serde(with = "humantime_serde")]
    pub max_notification_wait: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_frequency: Duration::from_secs(5 * 60),
            unknown: Duration::from_secs(60 * 60),
            state_file: None,
            max_notification_wait: Duration::from_secs(60 * 60),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub email: Vec<String>,
    pub post: Option<String>,
    pub get: Option<String>,
    pub print: bool,
    /// Body template text for this notification
    pub body: Option<String>,
    pub next: Option<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub crit: Option<String>,
    pub warn: Option<String>,
    pub crit_notification: Vec<String>,
    pub warn_notification: Vec<String>,
    /// Overrides `schedule.unknown` for this alert
    #[serde(with = "humantime_serde")]
    pub unknown: Option<Duration>,
    pub template: Option<String>,
}

/// The sections `VIGIL__*` environment variables may override
#[derive(Debug, Serialize, Deserialize)]
struct Ambient {
    server: ServerConfig,
    tsdb: TsdbConfig,
    schedule: ScheduleConfig,
    logging: LoggingConfig,
}

impl Config {
    /// Load from an optional TOML file, then apply `VIGIL__*` environment
    /// overrides to the server, tsdb, schedule and logging sections
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| Error::config(format!("{path}: {e}")))?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(config::Environment::with_prefix("VIGIL"))?;
        Ok(config)
    }

    /// Parse a TOML document. Table names keep their case, so alerts,
    /// notifications and templates may be named `CpuHigh` or `OpsTeam`.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(e.to_string()))
    }

    /// Layer environment overrides over the ambient sections. The config
    /// crate lowercases keys, which is harmless here since these keys are
    /// all lowercase; user-named tables never pass through it.
    fn apply_env(&mut self, env: config::Environment) -> Result<()> {
        let current = Ambient {
            server: self.server.clone(),
            tsdb: self.tsdb.clone(),
            schedule: self.schedule.clone(),
            logging: self.logging.clone(),
        };
        let ambient: Ambient = config::Config::builder()
            .add_source(config::Config::try_from(&current).map_err(|e| Error::config(e.to_string()))?)
            .add_source(env.separator("__").try_parsing(true))
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| Error::config(e.to_string()))?;
        self.server = ambient.server;
        self.tsdb = ambient.tsdb;
        self.schedule = ambient.schedule;
        self.logging = ambient.logging;
        Ok(())
    }

    /// Validate and build the typed configuration
    pub fn into_conf(self) -> Result<Conf> {
        let mut templates = BTreeMap::new();
        for (name, t) in &self.templates {
            templates.insert(name.clone(), Template::new(name.clone(), &t.subject, &t.body)?);
        }

        let mut notifications = BTreeMap::new();
        for (name, n) in &self.notifications {
            if n.next.is_some() && n.timeout.is_none() {
                return Err(Error::config(format!(
                    "notification {name}: next requires a timeout"
                )));
            }
            let body = n
                .body
                .as_deref()
                .map(|body| Template::new(name.clone(), "", body))
                .transpose()?;
            notifications.insert(
                name.clone(),
                Notification {
                    name: name.clone(),
                    email: n.email.clone(),
                    post: n.post.clone(),
                    get: n.get.clone(),
                    print: n.print,
                    body,
                    next: n.next.clone(),
                    timeout: n.timeout,
                },
            );
        }
        check_chains(&notifications)?;

        let mut alerts = BTreeMap::new();
        for (name, a) in self.alerts {
            if name.is_empty() || name.contains(['{', '}', ',', '=']) {
                return Err(Error::config(format!("invalid alert name {name:?}")));
            }
            let parse = |field: &str, text: &Option<String>| -> Result<Option<Expr>> {
                text.as_deref()
                    .map(|t| {
                        Expr::parse(t).map_err(|e| Error::config(format!("alert {name}: {field}: {e}")))
                    })
                    .transpose()
            };
            let crit = parse("crit", &a.crit)?;
            let warn = parse("warn", &a.warn)?;
            if crit.is_none() && warn.is_none() {
                return Err(Error::config(format!("alert {name}: needs crit or warn")));
            }
            for n in a.crit_notification.iter().chain(&a.warn_notification) {
                if !notifications.contains_key(n) {
                    return Err(Error::config(format!("alert {name}: unknown notification {n:?}")));
                }
            }
            if let Some(t) = &a.template {
                if !templates.contains_key(t) {
                    return Err(Error::config(format!("alert {name}: unknown template {t:?}")));
                }
            }
            alerts.insert(
                name.clone(),
                Alert {
                    name,
                    crit,
                    warn,
                    crit_notification: a.crit_notification,
                    warn_notification: a.warn_notification,
                    unknown: a.unknown,
                    template: a.template,
                },
            );
        }

        Ok(Conf {
            check_frequency: self.schedule.check_frequency,
            unknown: self.schedule.unknown,
            state_file: self.schedule.state_file,
            max_notification_wait: self.schedule.max_notification_wait,
            alerts,
            notifications,
            templates,
            default_template: Template::builtin()?,
        })
    }
}

/// Every `next` must name a notification, and no chain may loop.
fn check_chains(notifications: &BTreeMap<String, Notification>) -> Result<()> {
    for start in notifications.values() {
        let mut seen = HashSet::new();
        seen.insert(start.name.as_str());
        let mut current = start;
        while let Some(next) = &current.next {
            current = notifications.get(next).ok_or_else(|| {
                Error::config(format!("notification {}: unknown next {next:?}", current.name))
            })?;
            if !seen.insert(current.name.as_str()) {
                return Err(Error::config(format!(
                    "notification {}: escalation chain loops back to {next}",
                    start.name
                )));
            }
        }
    }
    Ok(())
}

/// One configured alert
#[derive(Debug, Clone)]
pub struct Alert {
    pub name: String,
    pub crit: Option<Expr>,
    pub warn: Option<Expr>,
    pub crit_notification: Vec<String>,
    pub warn_notification: Vec<String>,
    pub unknown: Option<Duration>,
    pub template: Option<String>,
}

/// Validated configuration the schedule runs on
#[derive(Debug, Clone)]
pub struct Conf {
    pub check_frequency: Duration,
    pub unknown: Duration,
    pub state_file: Option<PathBuf>,
    pub max_notification_wait: Duration,
    pub alerts: BTreeMap<String, Alert>,
    pub notifications: BTreeMap<String, Notification>,
    pub templates: BTreeMap<String, Template>,
    default_template: Template,
}

impl Conf {
    /// Template for `alert`, falling back to the built-in one
    pub fn template_for(&self, alert: &Alert) -> &Template {
        alert
            .template
            .as_ref()
            .and_then(|t| self.templates.get(t))
            .unwrap_or(&self.default_template)
    }

    pub fn default_template(&self) -> &Template {
        &self.default_template
    }

    /// Grace period before keys of `alert` are marked unknown
    pub fn unknown_for(&self, alert: &Alert) -> Duration {
        alert.unknown.unwrap_or(self.unknown)
    }
}
