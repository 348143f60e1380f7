//! Hyperparameter dimensions and the three shapes they render to: a finite
//! grid, a samplable distribution, or a prior for sequential optimization.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::value::{ParameterValue, SearchStrategyKind};
use crate::error::{PrepError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchMode {
    Explicit,
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scaling {
    #[default]
    Linear,
    Logarithmic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeDefinition {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub scaling: Scaling,
    #[serde(default)]
    pub nb_values: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnabledFlag {
    #[serde(default)]
    pub enabled: bool,
}

/// `values` of a grid document entry: a plain list for numericals, a map of
/// enabled flags for categoricals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimensionValues {
    List(Vec<ParameterValue>),
    Enabled(BTreeMap<String, EnabledFlag>),
}

impl Default for DimensionValues {
    fn default() -> Self {
        DimensionValues::List(Vec::new())
    }
}

/// One entry of a hyperparameter grid document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionDefinition {
    #[serde(default)]
    pub grid_mode: Option<SearchMode>,
    #[serde(default)]
    pub random_mode: Option<SearchMode>,
    #[serde(default)]
    pub values: DimensionValues,
    #[serde(default)]
    pub range: Option<RangeDefinition>,
}

impl DimensionDefinition {
    pub fn explicit(values: Vec<ParameterValue>) -> Self {
        Self {
            grid_mode: Some(SearchMode::Explicit),
            random_mode: Some(SearchMode::Explicit),
            values: DimensionValues::List(values),
            range: None,
        }
    }

    pub fn range(min: f64, max: f64, scaling: Scaling, nb_values: usize) -> Self {
        Self {
            grid_mode: Some(SearchMode::Range),
            random_mode: Some(SearchMode::Range),
            values: DimensionValues::default(),
            range: Some(RangeDefinition {
                min,
                max,
                scaling,
                nb_values: Some(nb_values),
            }),
        }
    }

    pub fn categorical(values: &[(&str, bool)]) -> Self {
        Self {
            grid_mode: None,
            random_mode: None,
            values: DimensionValues::Enabled(
                values
                    .iter()
                    .map(|(name, enabled)| (name.to_string(), EnabledFlag { enabled: *enabled }))
                    .collect(),
            ),
            range: None,
        }
    }
}

/// Random-search distribution of one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Distribution {
    Uniform { low: f64, high: f64 },
    /// Reciprocal distribution: uniform in log space.
    LogUniform { low: f64, high: f64 },
    /// Both bounds inclusive.
    IntUniform { low: i64, high: i64 },
    /// Log-uniform draw rounded down, both bounds inclusive.
    IntLogUniform { low: i64, high: i64 },
}

impl Distribution {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match *self {
            Distribution::Uniform { low, high } => ParameterValue::Float(low + rng.gen::<f64>() * (high - low)),
            Distribution::LogUniform { low, high } => {
                let (l, h) = (low.ln(), high.ln());
                ParameterValue::Float((l + rng.gen::<f64>() * (h - l)).exp())
            }
            Distribution::IntUniform { low, high } => ParameterValue::Int(rng.gen_range(low..=high)),
            Distribution::IntLogUniform { low, high } => {
                let (l, h) = ((low as f64).ln(), ((high + 1) as f64).ln());
                let drawn = (l + rng.gen::<f64>() * (h - l)).exp().floor() as i64;
                ParameterValue::Int(drawn.clamp(low, high))
            }
        }
    }
}

/// Prior of one dimension for the sequential optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Prior {
    Real { low: f64, high: f64, log: bool },
    Integer { low: i64, high: i64, log: bool },
    Categorical(Vec<ParameterValue>),
}

impl Prior {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match self {
            Prior::Real { low, high, log: false } => {
                Distribution::Uniform { low: *low, high: *high }.sample(rng)
            }
            Prior::Real { low, high, log: true } => {
                Distribution::LogUniform { low: *low, high: *high }.sample(rng)
            }
            Prior::Integer { low, high, log: false } => {
                Distribution::IntUniform { low: *low, high: *high }.sample(rng)
            }
            Prior::Integer { low, high, log: true } => {
                Distribution::IntLogUniform { low: *low, high: *high }.sample(rng)
            }
            Prior::Categorical(values) => values[rng.gen_range(0..values.len())].clone(),
        }
    }

    /// Position of a value in `[0, 1]`, the space the surrogate model works in.
    pub fn to_unit(&self, value: &ParameterValue) -> Result<f64> {
        let unit = |v: f64, low: f64, high: f64, log: bool| {
            let (v, low, high) = if log { (v.ln(), low.ln(), high.ln()) } else { (v, low, high) };
            if high > low {
                ((v - low) / (high - low)).clamp(0.0, 1.0)
            } else {
                0.0
            }
        };
        match self {
            Prior::Real { low, high, log } => {
                let v = value.as_float().ok_or_else(|| mismatch(self, value))?;
                Ok(unit(v, *low, *high, *log))
            }
            Prior::Integer { low, high, log } => {
                let v = value.as_float().ok_or_else(|| mismatch(self, value))?;
                Ok(unit(v, *low as f64, *high as f64, *log))
            }
            Prior::Categorical(values) => {
                let idx = values.iter().position(|v| v == value).ok_or_else(|| mismatch(self, value))?;
                Ok(if values.len() > 1 { idx as f64 / (values.len() - 1) as f64 } else { 0.0 })
            }
        }
    }
}

fn mismatch(prior: &Prior, value: &ParameterValue) -> PrepError {
    PrepError::ConfigError(format!("Value {} does not belong to prior {:?}", value, prior))
}

/// What a dimension renders to for a given strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum DimensionSpace {
    /// Finite list: the grid, or the choices a random search samples from.
    Values(Vec<ParameterValue>),
    Distribution(Distribution),
    Prior(Prior),
}

impl DimensionSpace {
    pub fn as_values(&self) -> Option<&[ParameterValue]> {
        match self {
            DimensionSpace::Values(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumericKind {
    Float,
    Integer,
}

/// A float or integer dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericalDimension {
    kind: NumericKind,
    definition: DimensionDefinition,
}

impl NumericalDimension {
    fn new(kind: NumericKind, definition: DimensionDefinition) -> Result<Self> {
        let uses_range = [definition.grid_mode, definition.random_mode].contains(&Some(SearchMode::Range));
        if uses_range && definition.range.is_none() {
            return Err(PrepError::ConfigError(
                "Numerical dimension must have a 'range' parameter".to_string(),
            ));
        }
        Ok(Self { kind, definition })
    }

    fn mode(&self, strategy: SearchStrategyKind) -> Result<SearchMode> {
        let mode = match strategy {
            SearchStrategyKind::Grid => self.definition.grid_mode,
            SearchStrategyKind::Random | SearchStrategyKind::Bayesian => self.definition.random_mode,
        };
        mode.ok_or_else(|| {
            PrepError::ConfigError(format!("No search mode for strategy {}", strategy.name()))
        })
    }

    fn explicit_values(&self) -> Vec<ParameterValue> {
        match &self.definition.values {
            DimensionValues::List(values) => values.clone(),
            DimensionValues::Enabled(_) => Vec::new(),
        }
    }

    fn range(&self) -> Result<&RangeDefinition> {
        self.definition
            .range
            .as_ref()
            .ok_or_else(|| PrepError::ConfigError("Numerical dimension must have a 'range' parameter".to_string()))
    }

    pub fn build(&self, strategy: SearchStrategyKind) -> Result<DimensionSpace> {
        match self.mode(strategy)? {
            SearchMode::Explicit => {
                let values = self.explicit_values();
                Ok(match strategy {
                    SearchStrategyKind::Bayesian => DimensionSpace::Prior(Prior::Categorical(values)),
                    _ => DimensionSpace::Values(values),
                })
            }
            SearchMode::Range => {
                let range = self.range()?;
                match strategy {
                    SearchStrategyKind::Grid => {
                        let n = range.nb_values.ok_or_else(|| {
                            PrepError::ConfigError("Range dimension needs 'nbValues' for grid search".to_string())
                        })?;
                        Ok(DimensionSpace::Values(self.build_grid(range.min, range.max, n, range.scaling)?))
                    }
                    _ => self.build_marginal_distribution(range.min, range.max, range.scaling, strategy),
                }
            }
        }
    }

    /// `n` points between `a` and `b` inclusive.
    pub fn build_grid(&self, a: f64, b: f64, n: usize, scaling: Scaling) -> Result<Vec<ParameterValue>> {
        match self.kind {
            NumericKind::Float => Ok(build_float_grid(a, b, n, scaling)?
                .into_iter()
                .map(ParameterValue::Float)
                .collect()),
            NumericKind::Integer => Ok(build_integer_grid(a as i64, b as i64, n, scaling)?
                .into_iter()
                .map(ParameterValue::Int)
                .collect()),
        }
    }

    pub fn build_marginal_distribution(
        &self,
        a: f64,
        b: f64,
        scaling: Scaling,
        strategy: SearchStrategyKind,
    ) -> Result<DimensionSpace> {
        if scaling == Scaling::Logarithmic && a <= 0.0 {
            return Err(PrepError::ConfigError(format!(
                "Logarithmic scaling needs a positive lower bound, got {}",
                a
            )));
        }
        let log = scaling == Scaling::Logarithmic;
        let degenerate = match self.kind {
            NumericKind::Float => ParameterValue::Float(a),
            NumericKind::Integer => ParameterValue::Int(a as i64),
        };
        if a == b {
            return Ok(match strategy {
                SearchStrategyKind::Bayesian => DimensionSpace::Prior(Prior::Categorical(vec![degenerate])),
                _ => DimensionSpace::Values(vec![degenerate]),
            });
        }
        match (strategy, self.kind) {
            (SearchStrategyKind::Random, NumericKind::Float) => Ok(DimensionSpace::Distribution(if log {
                Distribution::LogUniform { low: a, high: b }
            } else {
                Distribution::Uniform { low: a, high: b }
            })),
            (SearchStrategyKind::Random, NumericKind::Integer) => {
                let (low, high) = (a as i64, b as i64);
                Ok(DimensionSpace::Distribution(if log {
                    Distribution::IntLogUniform { low, high }
                } else {
                    Distribution::IntUniform { low, high }
                }))
            }
            (SearchStrategyKind::Bayesian, NumericKind::Float) => {
                Ok(DimensionSpace::Prior(Prior::Real { low: a, high: b, log }))
            }
            (SearchStrategyKind::Bayesian, NumericKind::Integer) => Ok(DimensionSpace::Prior(Prior::Integer {
                low: a as i64,
                high: b as i64,
                log,
            })),
            (SearchStrategyKind::Grid, _) => Err(PrepError::ConfigError(
                "Grid search has no marginal distribution".to_string(),
            )),
        }
    }
}

/// Evenly spaced floats, in log space for `Logarithmic`.
pub fn build_float_grid(a: f64, b: f64, n: usize, scaling: Scaling) -> Result<Vec<f64>> {
    if n == 0 {
        return Err(PrepError::ConfigError("A grid needs at least one value".to_string()));
    }
    if a == b || n == 1 {
        return Ok(vec![a]);
    }
    let step = |i: usize| i as f64 / (n - 1) as f64;
    match scaling {
        Scaling::Linear => Ok((0..n).map(|i| if i == n - 1 { b } else { a + (b - a) * step(i) }).collect()),
        Scaling::Logarithmic => {
            if a <= 0.0 || b <= 0.0 {
                return Err(PrepError::ConfigError(format!(
                    "Logarithmic scaling needs positive bounds, got [{}, {}]",
                    a, b
                )));
            }
            let (la, lb) = (a.ln(), b.ln());
            Ok((0..n)
                .map(|i| match i {
                    0 => a,
                    _ if i == n - 1 => b,
                    _ => (la + (lb - la) * step(i)).exp(),
                })
                .collect())
        }
    }
}

/// Integer grid, both bounds inclusive. Points collapsing onto the same
/// integer are merged, so the result is strictly increasing.
pub fn build_integer_grid(low: i64, high: i64, n: usize, scaling: Scaling) -> Result<Vec<i64>> {
    if n == 0 {
        return Err(PrepError::ConfigError("A grid needs at least one value".to_string()));
    }
    if low == high || n == 1 {
        return Ok(vec![low]);
    }
    let step = |i: usize| i as f64 / (n - 1) as f64;
    let mut points: Vec<i64> = match scaling {
        Scaling::Linear => {
            if ((high - low) as usize) < n {
                return Ok((low..=high).collect());
            }
            (0..n).map(|i| (low as f64 + (high - low) as f64 * step(i)) as i64).collect()
        }
        Scaling::Logarithmic => {
            if low <= 0 {
                return Err(PrepError::ConfigError(format!(
                    "Logarithmic scaling needs a positive lower bound, got {}",
                    low
                )));
            }
            let (ll, lh) = ((low as f64).ln(), (high as f64).ln());
            (0..n)
                .map(|i| {
                    let v = (ll + (lh - ll) * step(i)).exp();
                    // exp(ln(x)) may land just under an integer bound
                    (v + 1e-9).floor() as i64
                })
                .collect()
        }
    };
    for p in points.iter_mut() {
        *p = (*p).clamp(low, high);
    }
    points.sort_unstable();
    points.dedup();
    Ok(points)
}

/// Categorical dimension: the enabled values of an enabled-flag map.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoricalDimension {
    values: BTreeMap<String, EnabledFlag>,
}

impl CategoricalDimension {
    pub fn new(values: BTreeMap<String, EnabledFlag>) -> Self {
        Self { values }
    }

    pub fn enabled_values(&self) -> Vec<ParameterValue> {
        self.values
            .iter()
            .filter(|(_, flag)| flag.enabled)
            .map(|(name, _)| ParameterValue::String(name.clone()))
            .collect()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.values.get(name).map(|f| f.enabled).unwrap_or(false)
    }

    pub fn build(&self, strategy: SearchStrategyKind) -> DimensionSpace {
        let values = self.enabled_values();
        match strategy {
            SearchStrategyKind::Bayesian => DimensionSpace::Prior(Prior::Categorical(values)),
            _ => DimensionSpace::Values(values),
        }
    }
}

/// One named axis of a hyperparameter space.
#[derive(Debug, Clone, PartialEq)]
pub enum HyperparameterDimension {
    Float(NumericalDimension),
    Integer(NumericalDimension),
    Categorical(CategoricalDimension),
}

impl HyperparameterDimension {
    /// Float dimension; a range mode without a range is rejected here.
    pub fn float(definition: DimensionDefinition) -> Result<Self> {
        Ok(HyperparameterDimension::Float(NumericalDimension::new(NumericKind::Float, definition)?))
    }

    pub fn integer(definition: DimensionDefinition) -> Result<Self> {
        Ok(HyperparameterDimension::Integer(NumericalDimension::new(NumericKind::Integer, definition)?))
    }

    pub fn categorical(definition: DimensionDefinition) -> Result<Self> {
        match definition.values {
            DimensionValues::Enabled(values) => Ok(HyperparameterDimension::Categorical(CategoricalDimension::new(values))),
            DimensionValues::List(values) => {
                let values = values
                    .into_iter()
                    .map(|v| (v.to_string(), EnabledFlag { enabled: true }))
                    .collect();
                Ok(HyperparameterDimension::Categorical(CategoricalDimension::new(values)))
            }
        }
    }

    /// Fixed single value.
    pub fn constant(value: ParameterValue) -> Self {
        HyperparameterDimension::Float(NumericalDimension {
            kind: NumericKind::Float,
            definition: DimensionDefinition::explicit(vec![value]),
        })
    }

    pub fn build(&self, strategy: SearchStrategyKind) -> Result<DimensionSpace> {
        match self {
            HyperparameterDimension::Float(d) | HyperparameterDimension::Integer(d) => d.build(strategy),
            HyperparameterDimension::Categorical(d) => Ok(d.build(strategy)),
        }
    }

    pub fn as_categorical(&self) -> Option<&CategoricalDimension> {
        match self {
            HyperparameterDimension::Categorical(d) => Some(d),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn floats(values: &[ParameterValue]) -> Vec<f64> {
        values.iter().filter_map(|v| v.as_float()).collect()
    }

    #[test]
    fn test_linear_float_grid() {
        let grid = build_float_grid(0.0, 1.0, 5, Scaling::Linear).unwrap();
        assert_eq!(grid, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(build_float_grid(2.0, 2.0, 7, Scaling::Logarithmic).unwrap(), vec![2.0]);
        assert_eq!(build_float_grid(1.0, 9.0, 1, Scaling::Linear).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_log_float_grid_hits_bounds() {
        let grid = build_float_grid(0.001, 10.0, 5, Scaling::Logarithmic).unwrap();
        assert_eq!(grid.len(), 5);
        assert_eq!(grid[0], 0.001);
        assert_eq!(grid[4], 10.0);
        assert!((grid[2] - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_log_integer_grid_dedup() {
        let grid = build_integer_grid(1, 10, 8, Scaling::Logarithmic).unwrap();
        assert!(grid.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(grid.first(), Some(&1));
        assert_eq!(grid.last(), Some(&10));
        assert!(grid.len() < 8);
    }

    #[test]
    fn test_linear_integer_grid() {
        assert_eq!(build_integer_grid(1, 3, 10, Scaling::Linear).unwrap(), vec![1, 2, 3]);
        assert_eq!(build_integer_grid(0, 100, 3, Scaling::Linear).unwrap(), vec![0, 50, 100]);
    }

    #[test]
    fn test_missing_range_rejected_at_construction() {
        let definition = DimensionDefinition {
            grid_mode: Some(SearchMode::Range),
            random_mode: Some(SearchMode::Explicit),
            values: DimensionValues::List(vec![ParameterValue::Float(1.0)]),
            range: None,
        };
        assert!(matches!(HyperparameterDimension::float(definition), Err(PrepError::ConfigError(_))));
    }

    #[test]
    fn test_document_parsing() {
        let definition: DimensionDefinition = serde_json::from_str(
            r#"{"gridMode": "RANGE", "randomMode": "RANGE",
                "range": {"min": 0, "max": 1, "scaling": "LINEAR", "nbValues": 5}}"#,
        )
        .unwrap();
        let dim = HyperparameterDimension::float(definition).unwrap();
        let grid = dim.build(SearchStrategyKind::Grid).unwrap();
        assert_eq!(floats(grid.as_values().unwrap()), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(
            dim.build(SearchStrategyKind::Random).unwrap(),
            DimensionSpace::Distribution(Distribution::Uniform { low: 0.0, high: 1.0 })
        );
        assert_eq!(
            dim.build(SearchStrategyKind::Bayesian).unwrap(),
            DimensionSpace::Prior(Prior::Real { low: 0.0, high: 1.0, log: false })
        );
    }

    #[test]
    fn test_categorical_enabled_values() {
        let definition: DimensionDefinition = serde_json::from_str(
            r#"{"values": {"rbf": {"enabled": true}, "linear": {"enabled": false}, "poly": {"enabled": true}}}"#,
        )
        .unwrap();
        let dim = HyperparameterDimension::categorical(definition).unwrap();
        let values = dim.build(SearchStrategyKind::Grid).unwrap();
        assert_eq!(values.as_values().unwrap(), &[ParameterValue::from("poly"), ParameterValue::from("rbf")]);
    }

    #[test]
    fn test_integer_log_distribution_bounds() {
        let dist = Distribution::IntLogUniform { low: 1, high: 100 };
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        for _ in 0..200 {
            let v = dist.sample(&mut rng).as_int().unwrap();
            assert!((1..=100).contains(&v));
        }
    }

    #[test]
    fn test_prior_unit_mapping() {
        let prior = Prior::Real { low: 1.0, high: 100.0, log: true };
        assert!((prior.to_unit(&ParameterValue::Float(10.0)).unwrap() - 0.5).abs() < 1e-12);
        let cat = Prior::Categorical(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(cat.to_unit(&"c".into()).unwrap(), 1.0);
        assert!(cat.to_unit(&"z".into()).is_err());
    }
}
