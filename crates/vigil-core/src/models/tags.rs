//! Tag sets and alert keys

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A set of `key=value` tags identifying one time series group.
///
/// Keys are kept sorted, so the string form is deterministic regardless of
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Create an empty tag set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tag, replacing any previous value for the key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True if every pair in `other` is also present in `self`.
    pub fn subset(&self, other: &TagSet) -> bool {
        other
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).is_some_and(|mine| mine == v))
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl FromStr for TagSet {
    type Err = Error;

    /// Parses `k=v,k=v`. An empty string yields an empty set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tags = TagSet::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(tags);
        }
        for pair in s.split(',') {
            let Some((k, v)) = pair.split_once('=') else {
                return Err(Error::validation(format!("invalid tag pair: {pair:?}")));
            };
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() || v.is_empty() {
                return Err(Error::validation(format!("empty tag key or value in {pair:?}")));
            }
            if tags.0.contains_key(k) {
                return Err(Error::validation(format!("duplicate tag key: {k}")));
            }
            tags.insert(k, v);
        }
        Ok(tags)
    }
}

impl FromIterator<(String, String)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        TagSet(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, String>> for TagSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        TagSet(map)
    }
}

/// Identity of one alert instance: alert name plus the tag group it fired for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AlertKey {
    name: String,
    group: TagSet,
}

impl AlertKey {
    pub fn new(name: impl Into<String>, group: TagSet) -> Self {
        Self {
            name: name.into(),
            group,
        }
    }

    /// Alert name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag group
    pub fn group(&self) -> &TagSet {
        &self.group
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.name, self.group)
    }
}

impl FromStr for AlertKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::validation(format!("invalid alert key: {s:?}"));
        let (name, rest) = s.split_once('{').ok_or_else(invalid)?;
        let tags = rest.strip_suffix('}').ok_or_else(invalid)?;
        if name.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(name, tags.parse()?))
    }
}

impl From<AlertKey> for String {
    fn from(key: AlertKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for AlertKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs.iter().fold(TagSet::new(), |t, (k, v)| t.with(*k, *v))
    }

    #[test]
    fn test_string_form_is_sorted() {
        let t = tags(&[("host", "web01"), ("dc", "ny"), ("app", "api")]);
        assert_eq!(t.to_string(), "app=api,dc=ny,host=web01");
    }

    #[test]
    fn test_subset() {
        let big = tags(&[("host", "x"), ("dc", "ny")]);
        let small = tags(&[("host", "x")]);
        assert!(big.subset(&small));
        assert!(!small.subset(&big));
        assert!(big.subset(&TagSet::new()));
        assert!(!big.subset(&tags(&[("host", "y")])));
    }

    #[test]
    fn test_parse_tagset() {
        let t: TagSet = "host=x, dc=ny".parse().unwrap();
        assert_eq!(t, tags(&[("dc", "ny"), ("host", "x")]));
        assert!("".parse::<TagSet>().unwrap().is_empty());
        assert!("host".parse::<TagSet>().is_err());
        assert!("host=x,host=y".parse::<TagSet>().is_err());
    }

    #[test]
    fn test_alert_key_round_trip() {
        let key = AlertKey::new("cpu.high", tags(&[("host", "x"), ("dc", "ny")]));
        assert_eq!(key.to_string(), "cpu.high{dc=ny,host=x}");
        let parsed: AlertKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);

        let bare: AlertKey = "a{}".parse().unwrap();
        assert!(bare.group().is_empty());
        assert!("a".parse::<AlertKey>().is_err());
        assert!("{host=x}".parse::<AlertKey>().is_err());
    }

    #[test]
    fn test_alert_key_serializes_as_string() {
        let key = AlertKey::new("a", tags(&[("host", "x")]));
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"a{host=x}\"");
        let back: AlertKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    fn arb_pairs() -> impl Strategy<Value = Vec<(String, String)>> {
        prop::collection::vec(("[a-z]{1,6}", "[a-z0-9]{1,6}"), 0..6)
    }

    proptest! {
        #[test]
        fn prop_equality_is_symmetric(a in arb_pairs(), b in arb_pairs()) {
            let ta: TagSet = a.into_iter().collect();
            let tb: TagSet = b.into_iter().collect();
            prop_assert_eq!(ta == tb, tb == ta);
        }

        #[test]
        fn prop_string_independent_of_insertion_order(pairs in arb_pairs()) {
            let forward: TagSet = pairs.iter().cloned().collect();
            let reverse: TagSet = pairs.iter().rev().cloned().collect::<Vec<_>>().into_iter().collect();
            // Later duplicates win on collect, so compare on deduplicated keys only.
            let mut keys: Vec<&String> = pairs.iter().map(|(k, _)| k).collect();
            keys.sort();
            keys.dedup();
            if keys.len() == pairs.len() {
                prop_assert_eq!(forward.to_string(), reverse.to_string());
            }
            let rendered = forward.to_string();
            let rendered_keys: Vec<&str> = rendered
                .split(',')
                .filter(|p| !p.is_empty())
                .filter_map(|p| p.split_once('=').map(|(k, _)| k))
                .collect();
            let mut sorted = rendered_keys.clone();
            sorted.sort_unstable();
            prop_assert_eq!(rendered_keys, sorted);
        }
    }
}
