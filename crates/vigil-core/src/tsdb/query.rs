//! OpenTSDB-style query text
//!
//! `aggregator:[downsample:][rate[{counter[,max[,reset]]}]:]metric[{tag=filter,...}]`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::QueryError;
use crate::models::TagSet;

const AGGREGATORS: &[&str] = &[
    "avg", "count", "dev", "first", "last", "max", "min", "mimmax", "mimmin", "none", "sum",
    "zimsum", "median", "p50", "p75", "p90", "p95", "p99", "p999",
];

/// Counter handling for rate queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateOptions {
    pub counter: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter_max: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_value: Option<i64>,
}

/// One sub-query of a backend request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub aggregator: String,
    pub metric: String,
    #[serde(default)]
    pub rate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_options: Option<RateOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downsample: Option<String>,
    #[serde(default)]
    pub tags: TagSet,
}

impl FromStr for Query {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| QueryError::InvalidQuery {
            query: s.to_string(),
            reason: reason.to_string(),
        };

        let text = s.trim();
        // The tag filter is a brace group inside the last `:` segment.
        let last_colon = text.rfind(':').unwrap_or(0);
        let (head, tags) = match text.rfind('{') {
            Some(i) if i > last_colon && text.ends_with('}') => {
                (&text[..i], &text[i + 1..text.len() - 1])
            }
            _ => (text, ""),
        };
        let tags: TagSet = tags
            .parse()
            .map_err(|e: crate::error::Error| invalid(&e.to_string()))?;

        let parts = split_outside_braces(head);
        if parts.len() < 2 {
            return Err(invalid("expected aggregator:metric"));
        }
        let aggregator = parts[0].to_string();
        if !AGGREGATORS.contains(&aggregator.as_str()) {
            return Err(invalid(&format!("unknown aggregator {aggregator:?}")));
        }
        let metric = parts[parts.len() - 1].to_string();
        if metric.is_empty() {
            return Err(invalid("empty metric"));
        }

        let mut query = Query {
            aggregator,
            metric,
            rate: false,
            rate_options: None,
            downsample: None,
            tags,
        };
        for part in &parts[1..parts.len() - 1] {
            if let Some(rest) = part.strip_prefix("rate") {
                if query.rate {
                    return Err(invalid("rate given twice"));
                }
                query.rate = true;
                if !rest.is_empty() {
                    let opts = parse_rate_options(rest).ok_or_else(|| invalid("bad rate options"))?;
                    query.rate_options = Some(opts);
                }
            } else if is_downsample(part) {
                if query.downsample.is_some() {
                    return Err(invalid("downsample given twice"));
                }
                query.downsample = Some((*part).to_string());
            } else {
                return Err(invalid(&format!("unexpected component {part:?}")));
            }
        }
        Ok(query)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.aggregator)?;
        if let Some(ds) = &self.downsample {
            write!(f, "{ds}:")?;
        }
        if self.rate {
            f.write_str("rate")?;
            if let Some(opts) = &self.rate_options {
                write!(f, "{{{}", if opts.counter { "counter" } else { "" })?;
                if let Some(max) = opts.counter_max {
                    write!(f, ",{max}")?;
                }
                if let Some(reset) = opts.reset_value {
                    write!(f, ",{reset}")?;
                }
                f.write_str("}")?;
            }
            f.write_str(":")?;
        }
        write!(f, "{}{{{}}}", self.metric, self.tags)
    }
}

/// Split on `:` but not inside `{...}` (rate options contain commas and braces)
fn split_outside_braces(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// `{counter,max,reset}`
fn parse_rate_options(s: &str) -> Option<RateOptions> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    let mut fields = inner.split(',').map(str::trim);
    let counter = match fields.next()? {
        "counter" => true,
        "" => false,
        _ => return None,
    };
    let counter_max = match fields.next() {
        Some(v) if !v.is_empty() => Some(v.parse().ok()?),
        _ => None,
    };
    let reset_value = match fields.next() {
        Some(v) if !v.is_empty() => Some(v.parse().ok()?),
        _ => None,
    };
    Some(RateOptions {
        counter,
        counter_max,
        reset_value,
    })
}

/// `<interval>-<aggregator>`, e.g. `5m-avg`
fn is_downsample(s: &str) -> bool {
    let Some((interval, agg)) = s.split_once('-') else {
        return false;
    };
    AGGREGATORS.contains(&agg) && humantime::parse_duration(interval).is_ok()
}
