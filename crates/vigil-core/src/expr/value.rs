//! Values produced by expression evaluation

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::TagSet;
use crate::tsdb::Series;

/// Static type of an expression node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Number,
    String,
    Query,
    Series,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Type::Number => "number",
            Type::String => "string",
            Type::Query => "query",
            Type::Series => "series",
        })
    }
}

/// Runtime value of one tag group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Number(#[serde(with = "non_finite")] f64),
    Series(Series),
}

impl Value {
    /// The scalar, if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Series(_) => None,
        }
    }
}

/// A named intermediate value recorded while evaluating, for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    pub text: String,
    #[serde(with = "non_finite")]
    pub value: f64,
}

/// Evaluation outcome for one tag group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    pub value: Value,
    pub group: TagSet,
    pub computations: Vec<Computation>,
}

impl GroupResult {
    pub fn number(value: f64, group: TagSet) -> Self {
        Self {
            value: Value::Number(value),
            group,
            computations: Vec::new(),
        }
    }

    pub fn series(series: Series, group: TagSet) -> Self {
        Self {
            value: Value::Series(series),
            group,
            computations: Vec::new(),
        }
    }
}

/// JSON has no NaN or infinity, so non-finite floats are written as strings.
mod non_finite {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() {
            s.serialize_f64(*v)
        } else {
            s.serialize_str(&v.to_string())
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(f64),
        Str(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Num(n) => Ok(n),
            Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_finite_survives_json() {
        let c = Computation {
            text: "avg(x)".into(),
            value: f64::NAN,
        };
        let json = serde_json::to_string(&c).unwrap();
        let back: Computation = serde_json::from_str(&json).unwrap();
        assert!(back.value.is_nan());

        let inf = Value::Number(f64::INFINITY);
        let back: Value = serde_json::from_str(&serde_json::to_string(&inf).unwrap()).unwrap();
        assert_eq!(back, inf);
    }
}
