//! Hyperparameter spaces: named dimensions, conditional dimensions and the
//! enrichment rules applied to every point before it reaches an estimator.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::index::sample;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::bayesian::{BayesianSettings, ConditionalOptimizer, SequentialOptimizer};
use super::dimension::{DimensionSpace, HyperparameterDimension, Prior};
use super::value::{format_point, HyperparamPoint, ParameterValue, SearchStrategyKind};
use crate::error::{PrepError, Result};

/// Explicit value lists keyed by parameter name.
pub type ParameterGrid = BTreeMap<String, Vec<ParameterValue>>;

/// Predicate on another parameter's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    Equals { param: String, value: ParameterValue },
    /// Also holds when `param` is absent.
    NotEquals { param: String, value: ParameterValue },
}

impl Activation {
    pub fn equals(param: &str, value: impl Into<ParameterValue>) -> Self {
        Activation::Equals { param: param.to_string(), value: value.into() }
    }

    pub fn not_equals(param: &str, value: impl Into<ParameterValue>) -> Self {
        Activation::NotEquals { param: param.to_string(), value: value.into() }
    }

    pub fn param(&self) -> &str {
        match self {
            Activation::Equals { param, .. } | Activation::NotEquals { param, .. } => param,
        }
    }

    pub fn is_active(&self, point: &HyperparamPoint) -> bool {
        self.accepts(point.get(self.param()))
    }

    fn accepts(&self, value: Option<&ParameterValue>) -> bool {
        match self {
            Activation::Equals { value: expected, .. } => value == Some(expected),
            Activation::NotEquals { value: excluded, .. } => value != Some(excluded),
        }
    }
}

/// A dimension that only exists while `activation` holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalDimension {
    pub name: String,
    pub dimension: HyperparameterDimension,
    pub activation: Activation,
}

/// Rewrites applied to a point, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EnrichRule {
    /// `target = source * factor`
    DeriveScaled { source: String, target: String, factor: i64 },
    /// Remove `param` when `activation` does not hold.
    DropUnless { param: String, activation: Activation },
    /// Replace `param == marker` with the value of `custom_param`, then
    /// remove `custom_param`.
    ResolveCustom { param: String, custom_param: String, marker: ParameterValue },
}

/// What a space renders to for one strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchSpace {
    Grids(Vec<ParameterGrid>),
    /// Finite lists or distributions to draw i.i.d. from.
    Distributions(BTreeMap<String, DimensionSpace>),
    Priors(BTreeMap<String, Prior>),
}

#[derive(Debug, Clone, Default)]
pub struct HyperparametersSpace {
    dimensions: Vec<(String, HyperparameterDimension)>,
    conditionals: Vec<ConditionalDimension>,
    rules: Vec<EnrichRule>,
    fixed_grid: Option<Vec<ParameterGrid>>,
    random_state: Option<u64>,
}

impl HyperparametersSpace {
    pub fn new(dimensions: Vec<(String, HyperparameterDimension)>) -> Self {
        Self {
            dimensions,
            ..Default::default()
        }
    }

    /// Space whose only rendering is a precomputed list of grids.
    pub fn fixed_grid(grids: Vec<ParameterGrid>) -> Self {
        Self {
            fixed_grid: Some(grids),
            ..Default::default()
        }
    }

    pub fn with_conditional(mut self, name: &str, dimension: HyperparameterDimension, activation: Activation) -> Self {
        self.conditionals.push(ConditionalDimension {
            name: name.to_string(),
            dimension,
            activation,
        });
        self
    }

    pub fn with_rule(mut self, rule: EnrichRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn set_random_state(&mut self, random_state: u64) {
        self.random_state = Some(random_state);
    }

    pub fn random_state(&self) -> Option<u64> {
        self.random_state
    }

    pub fn dimensions(&self) -> &[(String, HyperparameterDimension)] {
        &self.dimensions
    }

    pub fn conditionals(&self) -> &[ConditionalDimension] {
        &self.conditionals
    }

    pub fn is_conditional(&self, name: &str) -> bool {
        self.conditionals.iter().any(|c| c.name == name)
    }

    pub fn build_space(&self, strategy: SearchStrategyKind) -> Result<SearchSpace> {
        if let Some(grids) = &self.fixed_grid {
            return match strategy {
                SearchStrategyKind::Grid => Ok(SearchSpace::Grids(grids.clone())),
                other => Err(PrepError::ConfigError(format!(
                    "Strategy {} is not supported on a fixed grid, only GRID is",
                    other.name()
                ))),
            };
        }
        match strategy {
            SearchStrategyKind::Grid => Ok(SearchSpace::Grids(self.build_grids()?)),
            SearchStrategyKind::Random => {
                let mut out = BTreeMap::new();
                for (name, dim) in self.all_dimensions() {
                    out.insert(name.to_string(), dim.build(strategy)?);
                }
                Ok(SearchSpace::Distributions(out))
            }
            SearchStrategyKind::Bayesian => {
                let mut out = BTreeMap::new();
                for (name, dim) in self.all_dimensions() {
                    out.insert(name.to_string(), bayesian_prior(dim)?);
                }
                Ok(SearchSpace::Priors(out))
            }
        }
    }

    fn all_dimensions(&self) -> impl Iterator<Item = (&str, &HyperparameterDimension)> {
        self.dimensions
            .iter()
            .map(|(n, d)| (n.as_str(), d))
            .chain(self.conditionals.iter().map(|c| (c.name.as_str(), &c.dimension)))
    }

    fn grid_values(dim: &HyperparameterDimension) -> Result<Vec<ParameterValue>> {
        match dim.build(SearchStrategyKind::Grid)? {
            DimensionSpace::Values(values) => Ok(values),
            other => Err(PrepError::ConfigError(format!("Grid dimension rendered as {:?}", other))),
        }
    }

    /// One grid per combination of conditional activations. Grids where a
    /// conditional is inactive come before the ones where it is active.
    fn build_grids(&self) -> Result<Vec<ParameterGrid>> {
        let mut base = ParameterGrid::new();
        for (name, dim) in &self.dimensions {
            base.insert(name.clone(), Self::grid_values(dim)?);
        }

        let mut merged: BTreeSet<&str> = BTreeSet::new();
        let mut custom_values: BTreeMap<&str, Vec<ParameterValue>> = BTreeMap::new();
        for rule in &self.rules {
            if let EnrichRule::ResolveCustom { custom_param, .. } = rule {
                if let Some(cond) = self.conditionals.iter().find(|c| &c.name == custom_param) {
                    custom_values.insert(custom_param.as_str(), Self::grid_values(&cond.dimension)?);
                    merged.insert(custom_param.as_str());
                }
            }
        }

        let mut grids = vec![base];
        for cond in self.conditionals.iter().filter(|c| !merged.contains(c.name.as_str())) {
            let mut values = Self::grid_values(&cond.dimension)?;
            if let Some(resolved) = self.resolve_custom_grid(&cond.name, &values, &custom_values) {
                values = resolved;
            }
            grids = grids
                .into_iter()
                .flat_map(|grid| split_grid(grid, cond, &values))
                .collect();
        }

        // a custom parameter attached to a primary dimension
        for rule in &self.rules {
            if let EnrichRule::ResolveCustom { param, custom_param, marker } = rule {
                if self.is_conditional(param) {
                    continue;
                }
                for grid in grids.iter_mut() {
                    if let Some(values) = grid.get(param).cloned() {
                        grid.insert(param.clone(), merge_custom(&values, marker, custom_values.get(custom_param.as_str())));
                    }
                }
            }
        }
        Ok(grids)
    }

    fn resolve_custom_grid(
        &self,
        name: &str,
        values: &[ParameterValue],
        custom_values: &BTreeMap<&str, Vec<ParameterValue>>,
    ) -> Option<Vec<ParameterValue>> {
        self.rules.iter().find_map(|rule| match rule {
            EnrichRule::ResolveCustom { param, custom_param, marker } if param == name => {
                Some(merge_custom(values, marker, custom_values.get(custom_param.as_str())))
            }
            _ => None,
        })
    }

    /// Every point of every grid, enriched. Keys vary in sorted order with
    /// the last key changing fastest.
    pub fn grid_points(&self) -> Result<Vec<HyperparamPoint>> {
        let grids = match self.build_space(SearchStrategyKind::Grid)? {
            SearchSpace::Grids(grids) => grids,
            _ => Vec::new(),
        };
        Ok(grids
            .iter()
            .flat_map(cartesian_product)
            .map(|p| self.enrich(p))
            .collect())
    }

    /// Apply the enrichment rules in order.
    pub fn enrich(&self, mut point: HyperparamPoint) -> HyperparamPoint {
        for rule in &self.rules {
            match rule {
                EnrichRule::DeriveScaled { source, target, factor } => {
                    let derived = match point.get(source) {
                        Some(ParameterValue::Int(v)) => Some(ParameterValue::Int(v * factor)),
                        Some(ParameterValue::Float(v)) => Some(ParameterValue::Float(v * *factor as f64)),
                        _ => None,
                    };
                    if let Some(v) = derived {
                        point.insert(target.clone(), v);
                    }
                }
                EnrichRule::DropUnless { param, activation } => {
                    if !activation.is_active(&point) {
                        point.remove(param);
                    }
                }
                EnrichRule::ResolveCustom { param, custom_param, marker } => {
                    if point.get(param) == Some(marker) {
                        match point.get(custom_param).cloned() {
                            Some(custom) => {
                                point.insert(param.clone(), custom);
                            }
                            None => {
                                point.remove(param);
                            }
                        }
                    }
                    point.remove(custom_param);
                }
            }
        }
        point
    }

    /// Undo custom resolution so a point reads in the optimizer's terms:
    /// a numeric `param` becomes `marker` plus `custom_param`.
    pub fn restore(&self, point: &HyperparamPoint) -> HyperparamPoint {
        let mut restored = point.clone();
        for rule in self.rules.iter().rev() {
            if let EnrichRule::ResolveCustom { param, custom_param, marker } = rule {
                if let Some(value) = restored.get(param).cloned() {
                    if value.is_numeric() {
                        restored.insert(custom_param.clone(), value);
                        restored.insert(param.clone(), marker.clone());
                    }
                }
            }
        }
        restored
    }

    /// `n` enriched random points. A fully finite space is sampled without
    /// replacement; otherwise every dimension is drawn independently.
    pub fn get_random_parameters(&self, n: usize) -> Result<Vec<HyperparamPoint>> {
        let space = match self.build_space(SearchStrategyKind::Random)? {
            SearchSpace::Distributions(space) => space,
            SearchSpace::Grids(_) | SearchSpace::Priors(_) => {
                return Err(PrepError::ConfigError("Random search needs distributions".to_string()))
            }
        };
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.random_state.unwrap_or(0));

        // Finite spaces draw from the partitioned grids, so inactive
        // combinations never collapse into duplicates after enrichment.
        if space.values().all(|d| d.as_values().is_some()) {
            let mut seen = BTreeSet::new();
            let all: Vec<HyperparamPoint> = self
                .grid_points()?
                .into_iter()
                .filter(|p| seen.insert(format_point(p)))
                .collect();
            let take = if n > all.len() {
                warn!(
                    requested = n,
                    available = all.len(),
                    "Fewer candidates than requested, sampling the whole grid"
                );
                all.len()
            } else {
                n
            };
            let points: Vec<HyperparamPoint> = sample(&mut rng, all.len(), take)
                .into_iter()
                .map(|i| all[i].clone())
                .collect();
            debug!(count = points.len(), "Drew random hyperparameter points");
            return Ok(points);
        }

        let mut points = Vec::with_capacity(n);
        for _ in 0..n {
            let mut point = HyperparamPoint::new();
            for (name, dim) in &space {
                let value = match dim {
                    DimensionSpace::Values(values) if values.is_empty() => continue,
                    DimensionSpace::Values(values) => values[rand::Rng::gen_range(&mut rng, 0..values.len())].clone(),
                    DimensionSpace::Distribution(d) => d.sample(&mut rng),
                    DimensionSpace::Prior(p) => p.sample(&mut rng),
                };
                point.insert(name.clone(), value);
            }
            points.push(point);
        }
        debug!(count = points.len(), "Drew random hyperparameter points");
        Ok(points.into_iter().map(|p| self.enrich(p)).collect())
    }

    /// Primary optimizer over the unconditional dimensions plus one optimizer
    /// per conditional dimension.
    pub fn get_optimizer(&self, settings: BayesianSettings) -> Result<ConditionalOptimizer> {
        if self.fixed_grid.is_some() {
            return Err(PrepError::ConfigError(
                "Strategy BAYESIAN is not supported on a fixed grid, only GRID is".to_string(),
            ));
        }
        let seed = self.random_state.unwrap_or(0);
        let mut primary_dims = Vec::with_capacity(self.dimensions.len());
        for (name, dim) in &self.dimensions {
            primary_dims.push((name.clone(), bayesian_prior(dim)?));
        }
        let primary = SequentialOptimizer::new(primary_dims, settings.clone(), seed)?;
        let mut conditionals = Vec::with_capacity(self.conditionals.len());
        for cond in &self.conditionals {
            let optimizer = SequentialOptimizer::new(
                vec![(cond.name.clone(), bayesian_prior(&cond.dimension)?)],
                settings.clone(),
                seed,
            )?;
            conditionals.push((cond.clone(), optimizer));
        }
        Ok(ConditionalOptimizer::new(self.clone(), primary, conditionals))
    }
}

fn bayesian_prior(dim: &HyperparameterDimension) -> Result<Prior> {
    match dim.build(SearchStrategyKind::Bayesian)? {
        DimensionSpace::Prior(prior) => Ok(prior),
        DimensionSpace::Values(values) => Ok(Prior::Categorical(values)),
        DimensionSpace::Distribution(d) => Err(PrepError::ConfigError(format!(
            "Bayesian dimension rendered as distribution {:?}",
            d
        ))),
    }
}

/// Custom values first, then the non-marker choices.
fn merge_custom(
    values: &[ParameterValue],
    marker: &ParameterValue,
    custom: Option<&Vec<ParameterValue>>,
) -> Vec<ParameterValue> {
    let mut out = Vec::with_capacity(values.len());
    if values.contains(marker) {
        if let Some(custom) = custom {
            out.extend(custom.iter().cloned());
        }
    }
    out.extend(values.iter().filter(|v| *v != marker).cloned());
    out
}

/// Split `grid` on the activation of `cond`: the inactive part stays as is,
/// the active part gains the conditional values.
fn split_grid(grid: ParameterGrid, cond: &ConditionalDimension, values: &[ParameterValue]) -> Vec<ParameterGrid> {
    let param = cond.activation.param();
    match grid.get(param) {
        None => {
            if cond.activation.accepts(None) {
                let mut active = grid;
                active.insert(cond.name.clone(), values.to_vec());
                vec![active]
            } else {
                vec![grid]
            }
        }
        Some(choices) => {
            let (on, off): (Vec<_>, Vec<_>) = choices.iter().cloned().partition(|v| cond.activation.accepts(Some(v)));
            let mut out = Vec::with_capacity(2);
            if !off.is_empty() {
                let mut inactive = grid.clone();
                inactive.insert(param.to_string(), off);
                out.push(inactive);
            }
            if !on.is_empty() {
                let mut active = grid;
                active.insert(param.to_string(), on);
                active.insert(cond.name.clone(), values.to_vec());
                out.push(active);
            }
            out
        }
    }
}

/// Points of one grid, keys sorted, last key fastest.
pub fn cartesian_product(grid: &ParameterGrid) -> Vec<HyperparamPoint> {
    let mut points = vec![HyperparamPoint::new()];
    for (name, values) in grid {
        let mut next = Vec::with_capacity(points.len() * values.len());
        for point in &points {
            for value in values {
                let mut p = point.clone();
                p.insert(name.clone(), value.clone());
                next.push(p);
            }
        }
        points = next;
    }
    points
}

/// Tree ensembles: `min_samples_split` follows `min_samples_leaf`.
pub fn trees(dimensions: Vec<(String, HyperparameterDimension)>) -> HyperparametersSpace {
    HyperparametersSpace::new(dimensions).with_rule(EnrichRule::DeriveScaled {
        source: "min_samples_leaf".to_string(),
        target: "min_samples_split".to_string(),
        factor: 3,
    })
}

/// SGD regression: `epsilon` only applies to the huber loss.
pub fn sgd_regression(
    dimensions: Vec<(String, HyperparameterDimension)>,
    epsilon: HyperparameterDimension,
) -> HyperparametersSpace {
    let huber = Activation::equals("loss", "huber");
    HyperparametersSpace::new(dimensions)
        .with_conditional("epsilon", epsilon, huber.clone())
        .with_rule(EnrichRule::DropUnless {
            param: "epsilon".to_string(),
            activation: huber,
        })
}

/// SVM: no `gamma` for the linear kernel; `gamma = "custom"` stands for the
/// value of `custom_gamma`.
pub fn svm(
    dimensions: Vec<(String, HyperparameterDimension)>,
    gamma: HyperparameterDimension,
    custom_gamma: HyperparameterDimension,
) -> HyperparametersSpace {
    let uses_gamma = Activation::not_equals("kernel", "linear");
    HyperparametersSpace::new(dimensions)
        .with_conditional("gamma", gamma, uses_gamma.clone())
        .with_conditional("custom_gamma", custom_gamma, Activation::equals("gamma", "custom"))
        .with_rule(EnrichRule::DropUnless {
            param: "gamma".to_string(),
            activation: uses_gamma,
        })
        .with_rule(EnrichRule::ResolveCustom {
            param: "gamma".to_string(),
            custom_param: "custom_gamma".to_string(),
            marker: ParameterValue::from("custom"),
        })
}

/// A space that is a fixed list of grids; only grid search applies.
pub struct GridHyperparametersSpace;

impl GridHyperparametersSpace {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(grids: Vec<ParameterGrid>) -> HyperparametersSpace {
        HyperparametersSpace::fixed_grid(grids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::dimension::{DimensionDefinition, Scaling};

    fn categorical(values: &[(&str, bool)]) -> HyperparameterDimension {
        HyperparameterDimension::categorical(DimensionDefinition::categorical(values)).unwrap()
    }

    fn c_dim() -> HyperparameterDimension {
        HyperparameterDimension::float(DimensionDefinition::explicit(vec![1.0.into(), 10.0.into()])).unwrap()
    }

    fn svm_space() -> HyperparametersSpace {
        svm(
            vec![
                ("C".to_string(), c_dim()),
                ("kernel".to_string(), categorical(&[("linear", true), ("rbf", true)])),
            ],
            categorical(&[("auto", true), ("custom", true), ("scale", false)]),
            HyperparameterDimension::float(DimensionDefinition::explicit(vec![0.1.into(), 0.7.into()])).unwrap(),
        )
    }

    fn point(pairs: &[(&str, ParameterValue)]) -> HyperparamPoint {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_svm_grids_partitioned_on_kernel() {
        let grids = match svm_space().build_space(SearchStrategyKind::Grid).unwrap() {
            SearchSpace::Grids(g) => g,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(grids.len(), 2);
        assert_eq!(grids[0]["kernel"], vec![ParameterValue::from("linear")]);
        assert!(!grids[0].contains_key("gamma"));
        assert_eq!(
            grids[1]["gamma"],
            vec![ParameterValue::Float(0.1), ParameterValue::Float(0.7), ParameterValue::from("auto")]
        );
        assert!(!grids[1].contains_key("custom_gamma"));
        assert_eq!(svm_space().grid_points().unwrap().len(), 2 + 2 * 3);
    }

    #[test]
    fn test_svm_enrichment() {
        let space = svm_space();
        let linear = space.enrich(point(&[("kernel", "linear".into()), ("gamma", "auto".into())]));
        assert!(!linear.contains_key("gamma"));

        let custom = space.enrich(point(&[
            ("kernel", "rbf".into()),
            ("gamma", "custom".into()),
            ("custom_gamma", 0.7.into()),
        ]));
        assert_eq!(custom["gamma"], ParameterValue::Float(0.7));
        assert!(!custom.contains_key("custom_gamma"));

        let restored = space.restore(&custom);
        assert_eq!(restored["gamma"], ParameterValue::from("custom"));
        assert_eq!(restored["custom_gamma"], ParameterValue::Float(0.7));
    }

    #[test]
    fn test_sgd_grids_and_enrichment() {
        let space = sgd_regression(
            vec![("loss".to_string(), categorical(&[("huber", true), ("squared_loss", true)]))],
            HyperparameterDimension::float(DimensionDefinition::range(0.01, 1.0, Scaling::Logarithmic, 3)).unwrap(),
        );
        let points = space.grid_points().unwrap();
        assert_eq!(points.len(), 1 + 3);
        assert!(points.iter().all(|p| p.contains_key("epsilon") == (p["loss"] == ParameterValue::from("huber"))));
        let enriched = space.enrich(point(&[("loss", "squared_loss".into()), ("epsilon", 0.1.into())]));
        assert!(!enriched.contains_key("epsilon"));
    }

    #[test]
    fn test_trees_derive_min_samples_split() {
        let space = trees(vec![(
            "min_samples_leaf".to_string(),
            HyperparameterDimension::integer(DimensionDefinition::explicit(vec![2i64.into()])).unwrap(),
        )]);
        let points = space.grid_points().unwrap();
        assert_eq!(points[0]["min_samples_split"], ParameterValue::Int(6));
    }

    #[test]
    fn test_random_parameters_seeded() {
        let mut space = svm_space();
        space.set_random_state(42);
        let a = space.get_random_parameters(5).unwrap();
        let b = space.get_random_parameters(5).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        for p in &a {
            assert!(!p.contains_key("custom_gamma"));
            if p["kernel"] == ParameterValue::from("linear") {
                assert!(!p.contains_key("gamma"));
            }
        }
        // linear: 2 C values; rbf: 2 C values times (auto + 2 custom gammas)
        let all = space.get_random_parameters(100).unwrap();
        assert_eq!(all.len(), 8);
        let distinct: BTreeSet<String> = all.iter().map(format_point).collect();
        assert_eq!(distinct.len(), 8);
    }

    #[test]
    fn test_random_parameters_are_distinct_after_enrichment() {
        let mut space = sgd_regression(
            vec![("loss".to_string(), categorical(&[("huber", true), ("squared_loss", true)]))],
            HyperparameterDimension::float(DimensionDefinition::explicit(vec![0.1.into(), 0.2.into(), 0.3.into()]))
                .unwrap(),
        );
        for seed in 0..20 {
            space.set_random_state(seed);
            let points = space.get_random_parameters(4).unwrap();
            let distinct: BTreeSet<String> = points.iter().map(format_point).collect();
            assert_eq!(distinct.len(), 4, "seed {}", seed);
        }
    }

    #[test]
    fn test_fixed_grid_only_supports_grid() {
        let mut grid = ParameterGrid::new();
        grid.insert("alpha".to_string(), vec![1.0.into(), 2.0.into()]);
        let space = GridHyperparametersSpace::new(vec![grid]);
        assert_eq!(space.grid_points().unwrap().len(), 2);
        assert!(matches!(space.build_space(SearchStrategyKind::Random), Err(PrepError::ConfigError(_))));
    }

    #[test]
    fn test_cartesian_order_last_key_fastest() {
        let mut grid = ParameterGrid::new();
        grid.insert("a".to_string(), vec![1i64.into(), 2i64.into()]);
        grid.insert("b".to_string(), vec!["x".into(), "y".into()]);
        let points = cartesian_product(&grid);
        assert_eq!(points[1]["a"], ParameterValue::Int(1));
        assert_eq!(points[1]["b"], ParameterValue::from("y"));
    }
}
