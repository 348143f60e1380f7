//! Hyperparameter values and search strategy names

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PrepError;

/// One sampled hyperparameter value.
///
/// Serialized untagged so points read like the estimator parameters they
/// stand for. Integers are tried before floats, so `3` reads back as `Int`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ParameterValue {
    /// Numeric view; integers widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v),
            ParameterValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ParameterValue::Float(_) | ParameterValue::Int(_))
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Int(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Bool(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::String(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        ParameterValue::String(v)
    }
}

/// A concrete point of the space, keyed by parameter name.
pub type HyperparamPoint = BTreeMap<String, ParameterValue>;

/// Render a point as `a=1, b=x` for logs.
pub fn format_point(point: &HyperparamPoint) -> String {
    point
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// How candidate points are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchStrategyKind {
    #[default]
    Grid,
    Random,
    Bayesian,
}

impl SearchStrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            SearchStrategyKind::Grid => "GRID",
            SearchStrategyKind::Random => "RANDOM",
            SearchStrategyKind::Bayesian => "BAYESIAN",
        }
    }
}

impl FromStr for SearchStrategyKind {
    type Err = PrepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GRID" => Ok(SearchStrategyKind::Grid),
            "RANDOM" => Ok(SearchStrategyKind::Random),
            "BAYESIAN" => Ok(SearchStrategyKind::Bayesian),
            other => Err(PrepError::ConfigError(format!("Unknown search strategy: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_serde() {
        let point: HyperparamPoint = serde_json::from_str(r#"{"a": 3, "b": 0.5, "c": "rbf", "d": true}"#).unwrap();
        assert_eq!(point["a"], ParameterValue::Int(3));
        assert_eq!(point["b"], ParameterValue::Float(0.5));
        assert_eq!(point["c"].as_str(), Some("rbf"));
        assert_eq!(point["d"].as_bool(), Some(true));
        assert_eq!(format_point(&point), "a=3, b=0.5, c=rbf, d=true");
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!("BAYESIAN".parse::<SearchStrategyKind>().unwrap(), SearchStrategyKind::Bayesian);
        assert!(matches!("SIMULATED".parse::<SearchStrategyKind>(), Err(PrepError::ConfigError(_))));
    }
}
