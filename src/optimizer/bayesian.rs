//! Sequential model-based optimization over priors, and its conditional
//! decomposition for spaces with entangled dimensions.

use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::dimension::Prior;
use super::gaussian_process::{AcquisitionFunction, GaussianProcess, KernelType};
use super::space::{ConditionalDimension, HyperparametersSpace};
use super::value::HyperparamPoint;
use crate::error::{PrepError, Result};

/// Knobs of the sequential optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BayesianSettings {
    /// Observations needed before the surrogate takes over from random draws.
    pub n_initial_points: usize,
    /// Random candidates scored by the acquisition function per ask.
    pub n_candidates: usize,
    pub noise: f64,
    pub kernel: KernelType,
    pub acquisition: AcquisitionFunction,
}

impl Default for BayesianSettings {
    fn default() -> Self {
        Self {
            n_initial_points: 10,
            n_candidates: 1000,
            noise: 1e-6,
            kernel: KernelType::default(),
            acquisition: AcquisitionFunction::EI,
        }
    }
}

impl BayesianSettings {
    pub fn with_initial_points(mut self, n: usize) -> Self {
        self.n_initial_points = n;
        self
    }

    pub fn with_candidates(mut self, n: usize) -> Self {
        self.n_candidates = n.max(1);
        self
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_kernel(mut self, kernel: KernelType) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_acquisition(mut self, acquisition: AcquisitionFunction) -> Self {
        self.acquisition = acquisition;
        self
    }
}

/// Ask/tell optimizer over a fixed list of priors. Minimizes.
#[derive(Debug, Clone)]
pub struct SequentialOptimizer {
    dims: Vec<(String, Prior)>,
    settings: BayesianSettings,
    rng: Xoshiro256PlusPlus,
    xs: Vec<Vec<f64>>,
    ys: Vec<f64>,
}

impl SequentialOptimizer {
    pub fn new(dims: Vec<(String, Prior)>, settings: BayesianSettings, seed: u64) -> Result<Self> {
        for (name, prior) in &dims {
            let empty = matches!(prior, Prior::Categorical(values) if values.is_empty());
            let inverted = match prior {
                Prior::Real { low, high, .. } => low > high,
                Prior::Integer { low, high, .. } => low > high,
                Prior::Categorical(_) => false,
            };
            if empty || inverted {
                return Err(PrepError::ConfigError(format!("Dimension {} has an empty prior", name)));
            }
        }
        Ok(Self {
            dims,
            settings,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            xs: Vec::new(),
            ys: Vec::new(),
        })
    }

    pub fn dimension_names(&self) -> impl Iterator<Item = &str> {
        self.dims.iter().map(|(n, _)| n.as_str())
    }

    pub fn tell_count(&self) -> usize {
        self.ys.len()
    }

    /// Lowest told value and the point it came from.
    pub fn best(&self) -> Option<(Vec<f64>, f64)> {
        self.ys
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, y)| (self.xs[i].clone(), *y))
    }

    fn draw(&mut self) -> HyperparamPoint {
        let rng = &mut self.rng;
        self.dims
            .iter()
            .map(|(name, prior)| (name.clone(), prior.sample(rng)))
            .collect()
    }

    fn to_unit(&self, point: &HyperparamPoint) -> Result<Vec<f64>> {
        self.dims
            .iter()
            .map(|(name, prior)| {
                let value = point
                    .get(name)
                    .ok_or_else(|| PrepError::ConfigError(format!("Point has no value for {}", name)))?;
                prior.to_unit(value)
            })
            .collect()
    }

    /// `n` points to evaluate next.
    pub fn ask(&mut self, n: usize) -> Result<Vec<HyperparamPoint>> {
        if self.dims.is_empty() {
            return Ok(vec![HyperparamPoint::new(); n]);
        }
        if self.ys.len() < self.settings.n_initial_points {
            return Ok((0..n).map(|_| self.draw()).collect());
        }

        let width = self.dims.len();
        let x = Array2::from_shape_vec((self.xs.len(), width), self.xs.concat())?;
        let y = Array1::from_vec(self.ys.clone());
        let mut gp = GaussianProcess::new(self.settings.kernel.clone()).with_noise(self.settings.noise);
        gp.fit(x, &y)?;
        let best = self.ys.iter().copied().fold(f64::INFINITY, f64::min);

        let n_candidates = self.settings.n_candidates.max(n);
        let mut candidates = Vec::with_capacity(n_candidates);
        let mut units = Vec::with_capacity(n_candidates * width);
        for _ in 0..n_candidates {
            let point = self.draw();
            units.extend(self.to_unit(&point)?);
            candidates.push(point);
        }
        let grid = Array2::from_shape_vec((n_candidates, width), units)?;
        let (mean, var) = gp.predict(&grid)?;

        let mut ranked: Vec<(f64, usize)> = (0..n_candidates)
            .map(|i| (self.settings.acquisition.evaluate(mean[i], var[i], best), i))
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut chosen: Vec<HyperparamPoint> = Vec::with_capacity(n);
        for (_, i) in ranked {
            if chosen.len() == n {
                break;
            }
            if !chosen.contains(&candidates[i]) {
                chosen.push(candidates[i].clone());
            }
        }
        while chosen.len() < n {
            chosen.push(self.draw());
        }
        debug!(asked = n, observations = self.ys.len(), best, "Surrogate proposal");
        Ok(chosen)
    }

    /// Record observed values for points carrying every dimension.
    pub fn tell(&mut self, points: &[HyperparamPoint], values: &[f64]) -> Result<()> {
        if points.len() != values.len() {
            return Err(PrepError::ShapeError {
                expected: format!("{} values", points.len()),
                actual: format!("{} values", values.len()),
            });
        }
        for (point, value) in points.iter().zip(values) {
            let x = self.to_unit(point)?;
            self.xs.push(x);
            self.ys.push(*value);
        }
        Ok(())
    }
}

/// A primary optimizer over the unconditional dimensions plus one optimizer
/// per conditional dimension, asked only when its activation holds.
#[derive(Debug, Clone)]
pub struct ConditionalOptimizer {
    space: HyperparametersSpace,
    primary: SequentialOptimizer,
    conditionals: Vec<(ConditionalDimension, SequentialOptimizer)>,
}

impl ConditionalOptimizer {
    pub fn new(
        space: HyperparametersSpace,
        primary: SequentialOptimizer,
        conditionals: Vec<(ConditionalDimension, SequentialOptimizer)>,
    ) -> Self {
        Self {
            space,
            primary,
            conditionals,
        }
    }

    /// `n` enriched points ready for an estimator.
    pub fn ask(&mut self, n: usize) -> Result<Vec<HyperparamPoint>> {
        let base = self.primary.ask(n)?;
        let mut points = Vec::with_capacity(base.len());
        for mut point in base {
            // declaration order lets a conditional depend on an earlier one
            for (cond, optimizer) in self.conditionals.iter_mut() {
                if !cond.activation.is_active(&point) {
                    continue;
                }
                let drawn = optimizer.ask(1)?;
                if let Some(value) = drawn.first().and_then(|p| p.get(&cond.name)) {
                    point.insert(cond.name.clone(), value.clone());
                }
            }
            points.push(self.space.enrich(point));
        }
        Ok(points)
    }

    /// Strip conditional values whose activation does not hold. Conditionals
    /// are checked in declaration order, so a dimension gated on a stripped
    /// one is stripped too.
    fn active_point(&self, point: &HyperparamPoint) -> HyperparamPoint {
        let mut active = self.space.restore(point);
        for (cond, _) in &self.conditionals {
            if !cond.activation.is_active(&active) {
                active.remove(&cond.name);
            }
        }
        active
    }

    /// Route observations: the primary optimizer sees every point, each
    /// conditional optimizer only the points where its dimension is active.
    pub fn tell(&mut self, points: &[HyperparamPoint], values: &[f64]) -> Result<()> {
        if points.len() != values.len() {
            return Err(PrepError::ShapeError {
                expected: format!("{} values", points.len()),
                actual: format!("{} values", values.len()),
            });
        }
        let restored: Vec<HyperparamPoint> = points.iter().map(|p| self.active_point(p)).collect();
        self.primary.tell(&restored, values)?;

        for (cond, optimizer) in self.conditionals.iter_mut() {
            let mut routed_points = Vec::new();
            let mut routed_values = Vec::new();
            for (point, value) in restored.iter().zip(values) {
                if let Some(v) = point.get(&cond.name) {
                    let mut single = HyperparamPoint::new();
                    single.insert(cond.name.clone(), v.clone());
                    routed_points.push(single);
                    routed_values.push(*value);
                }
            }
            if !routed_points.is_empty() {
                optimizer.tell(&routed_points, &routed_values)?;
            }
        }
        Ok(())
    }

    pub fn primary_tell_count(&self) -> usize {
        self.primary.tell_count()
    }

    pub fn conditional_tell_count(&self, name: &str) -> Option<usize> {
        self.conditionals
            .iter()
            .find(|(c, _)| c.name == name)
            .map(|(_, o)| o.tell_count())
    }

    pub fn conditional_names(&self) -> Vec<&str> {
        self.conditionals.iter().map(|(c, _)| c.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::dimension::{DimensionDefinition, HyperparameterDimension, Scaling};
    use crate::optimizer::space::{sgd_regression, svm};
    use crate::optimizer::value::ParameterValue;

    fn quadratic_optimizer() -> SequentialOptimizer {
        SequentialOptimizer::new(
            vec![("x".to_string(), Prior::Real { low: -2.0, high: 2.0, log: false })],
            BayesianSettings::default().with_initial_points(4).with_candidates(200),
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_startup_then_surrogate() {
        let mut opt = quadratic_optimizer();
        for _ in 0..12 {
            let points = opt.ask(1).unwrap();
            let x = points[0]["x"].as_float().unwrap();
            assert!((-2.0..=2.0).contains(&x));
            opt.tell(&points, &[(x - 0.5) * (x - 0.5)]).unwrap();
        }
        assert_eq!(opt.tell_count(), 12);
        let (_, best) = opt.best().unwrap();
        assert!(best < 1.0);
    }

    #[test]
    fn test_batch_ask_is_distinct() {
        let mut opt = quadratic_optimizer();
        for _ in 0..4 {
            let points = opt.ask(1).unwrap();
            let x = points[0]["x"].as_float().unwrap();
            opt.tell(&points, &[x * x]).unwrap();
        }
        let batch = opt.ask(3).unwrap();
        assert_eq!(batch.len(), 3);
        assert_ne!(batch[0], batch[1]);
    }

    #[test]
    fn test_tell_requires_every_dimension() {
        let mut opt = quadratic_optimizer();
        let err = opt.tell(&[HyperparamPoint::new()], &[1.0]);
        assert!(matches!(err, Err(PrepError::ConfigError(_))));
    }

    #[test]
    fn test_sgd_epsilon_only_drawn_for_huber() {
        let space = sgd_regression(
            vec![(
                "loss".to_string(),
                HyperparameterDimension::categorical(DimensionDefinition::categorical(&[
                    ("huber", true),
                    ("squared_loss", true),
                ]))
                .unwrap(),
            )],
            HyperparameterDimension::float(DimensionDefinition::range(0.01, 1.0, Scaling::Logarithmic, 3)).unwrap(),
        );
        let mut opt = space.get_optimizer(BayesianSettings::default()).unwrap();
        let points = opt.ask(8).unwrap();
        for p in &points {
            let huber = p["loss"] == ParameterValue::from("huber");
            assert_eq!(p.contains_key("epsilon"), huber);
        }
        let huber_count = points.iter().filter(|p| p.contains_key("epsilon")).count();
        opt.tell(&points, &vec![0.5; points.len()]).unwrap();
        assert_eq!(opt.primary_tell_count(), 8);
        assert_eq!(opt.conditional_tell_count("epsilon"), Some(huber_count));
    }

    #[test]
    fn test_svm_custom_gamma_routing() {
        let space = svm(
            vec![(
                "kernel".to_string(),
                HyperparameterDimension::categorical(DimensionDefinition::categorical(&[
                    ("linear", true),
                    ("rbf", true),
                ]))
                .unwrap(),
            )],
            HyperparameterDimension::categorical(DimensionDefinition::categorical(&[
                ("custom", true),
                ("scale", true),
            ]))
            .unwrap(),
            HyperparameterDimension::float(DimensionDefinition::range(0.001, 1.0, Scaling::Logarithmic, 4)).unwrap(),
        );
        let mut opt = space.get_optimizer(BayesianSettings::default()).unwrap();
        let mut point = HyperparamPoint::new();
        point.insert("kernel".to_string(), "rbf".into());
        point.insert("gamma".to_string(), ParameterValue::Float(0.1));
        opt.tell(&[point], &[0.2]).unwrap();
        assert_eq!(opt.conditional_tell_count("gamma"), Some(1));
        assert_eq!(opt.conditional_tell_count("custom_gamma"), Some(1));
        assert_eq!(opt.conditional_names(), vec!["gamma", "custom_gamma"]);
    }

    #[test]
    fn test_inactive_gamma_is_not_routed() {
        let space = svm(
            vec![(
                "kernel".to_string(),
                HyperparameterDimension::categorical(DimensionDefinition::categorical(&[
                    ("linear", true),
                    ("rbf", true),
                ]))
                .unwrap(),
            )],
            HyperparameterDimension::categorical(DimensionDefinition::categorical(&[
                ("custom", true),
                ("scale", true),
            ]))
            .unwrap(),
            HyperparameterDimension::float(DimensionDefinition::range(0.001, 1.0, Scaling::Logarithmic, 4)).unwrap(),
        );
        let mut opt = space.get_optimizer(BayesianSettings::default()).unwrap();
        let points: Vec<HyperparamPoint> = ["linear", "linear", "rbf", "linear"]
            .iter()
            .map(|kernel| {
                let mut p = HyperparamPoint::new();
                p.insert("kernel".to_string(), (*kernel).into());
                p.insert("gamma".to_string(), ParameterValue::Float(0.1));
                p
            })
            .collect();
        opt.tell(&points, &[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(opt.primary_tell_count(), 4);
        assert_eq!(opt.conditional_tell_count("gamma"), Some(1));
        assert_eq!(opt.conditional_tell_count("custom_gamma"), Some(1));
    }
}
