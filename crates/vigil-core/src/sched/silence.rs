//! Time-windowed notification suppression

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::models::AlertKey;

/// Suppresses notifications for matching alert keys between `start` and `end`.
///
/// `tags` maps a tag key to a glob pattern the key's tag value must match.
/// Evaluation and state tracking continue for silenced keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Silence {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Exact alert name, or empty for any alert
    #[serde(default)]
    pub alert: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Silence {
    /// Create a silence, rejecting empty windows and match-everything silences
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        alert: impl Into<String>,
        tags: BTreeMap<String, String>,
    ) -> Result<Self> {
        let silence = Self {
            start,
            end,
            alert: alert.into(),
            tags,
        };
        silence.validate()?;
        Ok(silence)
    }

    pub fn validate(&self) -> Result<()> {
        if self.end <= self.start {
            return Err(Error::validation("silence must end after it starts"));
        }
        if self.alert.is_empty() && self.tags.is_empty() {
            return Err(Error::validation("silence must name an alert or at least one tag"));
        }
        Ok(())
    }

    /// Content hash; silences are immutable so this never changes.
    pub fn id(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.start.to_rfc3339().as_bytes());
        hasher.update(b"|");
        hasher.update(self.end.to_rfc3339().as_bytes());
        hasher.update(b"|");
        hasher.update(self.alert.as_bytes());
        for (k, v) in &self.tags {
            hasher.update(b"|");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now <= self.end
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.end
    }

    /// True if active at `now` and matching `key`
    pub fn matches(&self, key: &AlertKey, now: DateTime<Utc>) -> bool {
        if !self.is_active(now) {
            return false;
        }
        if !self.alert.is_empty() && self.alert != key.name() {
            return false;
        }
        self.tags.iter().all(|(k, pattern)| {
            key.group()
                .get(k)
                .is_some_and(|value| glob_match::glob_match(pattern, value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn silence(alert: &str, tags: &[(&str, &str)]) -> Silence {
        Silence::new(
            t(1_000),
            t(1_000) + Duration::hours(1),
            alert,
            tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_matches_window_alert_and_tags() {
        let s = silence("cpu", &[("host", "web*")]);
        let key: AlertKey = "cpu{dc=ny,host=web01}".parse().unwrap();

        assert!(s.matches(&key, t(1_000)));
        assert!(s.matches(&key, t(4_600)));
        assert!(!s.matches(&key, t(999)));
        assert!(!s.matches(&key, t(4_601)));
        assert!(!s.matches(&"mem{host=web01}".parse().unwrap(), t(2_000)));
        assert!(!s.matches(&"cpu{host=db01}".parse().unwrap(), t(2_000)));
        assert!(!s.matches(&"cpu{dc=ny}".parse().unwrap(), t(2_000)));
    }

    #[test]
    fn test_empty_alert_matches_any_name() {
        let s = silence("", &[("dc", "ny")]);
        assert!(s.matches(&"cpu{dc=ny,host=a}".parse().unwrap(), t(2_000)));
        assert!(s.matches(&"disk{dc=ny}".parse().unwrap(), t(2_000)));
    }

    #[test]
    fn test_id_is_stable_and_content_derived() {
        let a = silence("cpu", &[("host", "web*")]);
        let b = silence("cpu", &[("host", "web*")]);
        let c = silence("cpu", &[("host", "db*")]);

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().len(), 40);
    }

    #[test]
    fn test_validation() {
        assert!(Silence::new(t(10), t(5), "cpu", BTreeMap::new()).is_err());
        assert!(Silence::new(t(10), t(20), "", BTreeMap::new()).is_err());
    }
}
