//! Subject and body templates
//!
//! Templates are rendered with minijinja in strict mode. The context holds:
//!
//! | variable         | value                                        |
//! |------------------|----------------------------------------------|
//! | `alert`          | alert name                                   |
//! | `key`            | full alert key, `name{k=v,...}`              |
//! | `status`         | `warning`, `critical`, ...                   |
//! | `tags`           | `k=v,...`                                    |
//! | `group`          | map of tag name to value, e.g. `group.host`  |
//! | `value`          | value of the last computation, empty if none |
//! | `computations`   | one `text = value` line per computation      |
//!
//! Referring to any other variable fails when the template is loaded. A tag
//! missing from `group` fails at render time unless guarded, for instance
//! with `{{ group.host | default("") }}`.

use std::sync::OnceLock;

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::expr::Computation;
use crate::models::{AlertKey, Status};

const DEFAULT_SUBJECT: &str = "{{ status }}: {{ key }}";
const DEFAULT_BODY: &str = "{{ status }}: {{ key }}\n\n{{ computations }}";

const VARIABLES: &[&str] = &["alert", "key", "status", "tags", "group", "value", "computations"];

fn environment() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();
    ENV.get_or_init(|| {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env
    })
}

/// Compile `source` and reject references outside the template context
fn check(source: &str) -> std::result::Result<(), String> {
    let compiled = environment().template_from_str(source).map_err(|e| e.to_string())?;
    let mut unknown: Vec<String> = compiled
        .undeclared_variables(false)
        .into_iter()
        .filter(|v| !VARIABLES.contains(&v.as_str()))
        .collect();
    unknown.sort();
    match unknown.first() {
        Some(v) => Err(format!("unknown template variable {v:?}")),
        None => Ok(()),
    }
}

/// Everything a template can refer to
pub struct TemplateData<'a> {
    pub key: &'a AlertKey,
    pub status: Status,
    pub computations: &'a [Computation],
}

impl TemplateData<'_> {
    fn context(&self) -> serde_json::Value {
        let group: serde_json::Map<String, serde_json::Value> = self
            .key
            .group()
            .iter()
            .map(|(k, v)| (k.to_string(), v.into()))
            .collect();
        let computations = self
            .computations
            .iter()
            .map(|c| format!("{} = {}", c.text, c.value))
            .collect::<Vec<_>>()
            .join("\n");
        serde_json::json!({
            "alert": self.key.name(),
            "key": self.key.to_string(),
            "status": self.status.as_str(),
            "tags": self.key.group().to_string(),
            "group": group,
            "value": self.computations.last().map(|c| c.value.to_string()).unwrap_or_default(),
            "computations": computations,
        })
    }
}

/// A named subject/body pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Template {
    name: String,
    subject: String,
    body: String,
}

impl Template {
    /// Compile a template, rejecting syntax errors and unknown variables
    pub fn new(name: impl Into<String>, subject: &str, body: &str) -> Result<Self> {
        let name = name.into();
        for source in [subject, body] {
            check(source).map_err(|e| Error::config(format!("template {name}: {e}")))?;
        }
        Ok(Self {
            name,
            subject: subject.to_string(),
            body: body.to_string(),
        })
    }

    /// The built-in template used by alerts that name none
    pub fn builtin() -> Result<Self> {
        Self::new("default", DEFAULT_SUBJECT, DEFAULT_BODY)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render_subject(&self, data: &TemplateData<'_>) -> String {
        self.render(&self.subject, data)
    }

    pub fn render_body(&self, data: &TemplateData<'_>) -> String {
        self.render(&self.body, data)
    }

    /// Render `source`, falling back to `status: key` when rendering fails
    fn render(&self, source: &str, data: &TemplateData<'_>) -> String {
        match environment().render_str(source, data.context()) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(template = %self.name, key = %data.key, error = %e, "Failed to render template");
                format!("{}: {} (template {} failed: {e})", data.status.as_str(), data.key, self.name)
            }
        }
    }
}
