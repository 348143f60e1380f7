//! Integration test: cross-validated search runner with a test-double estimator

use std::sync::Arc;

use kolosal_prep::optimizer::{
    DimensionDefinition, GridHyperparametersSpace, HyperparamPoint, HyperparameterDimension, HyperparametersSpace,
    ParameterGrid, ParameterValue, Scaling, SearchStrategyKind,
};
use kolosal_prep::search::{CustomScorer, Estimator, KFold, Metric, SearchRunner, SearchSettings};
use kolosal_prep::{PrepError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Predicts `slope * x0`; a negative slope fails to fit.
#[derive(Debug, Clone)]
struct SlopeRegressor {
    slope: f64,
}

impl Estimator for SlopeRegressor {
    fn fit(&mut self, _x: ArrayView2<f64>, _y: ArrayView1<f64>, _w: Option<ArrayView1<f64>>) -> Result<()> {
        if self.slope < 0.0 {
            return Err(PrepError::ComputationError("negative slope".to_string()));
        }
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        Ok(x.column(0).mapv(|v| v * self.slope))
    }

    fn get_params(&self) -> HyperparamPoint {
        let mut params = HyperparamPoint::new();
        params.insert("slope".to_string(), ParameterValue::Float(self.slope));
        params
    }

    fn set_params(&mut self, params: &HyperparamPoint) -> Result<()> {
        if let Some(slope) = params.get("slope").and_then(|v| v.as_float()) {
            self.slope = slope;
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn data() -> (Array2<f64>, Array1<f64>, Array1<f64>) {
    let x = Array2::from_shape_fn((40, 1), |(i, _)| i as f64 / 4.0);
    let y = x.column(0).mapv(|v| 2.0 * v);
    let w = Array1::from_iter((0..40).map(|i| 1.0 + (i % 3) as f64));
    (x, y, w)
}

fn slope_grid(slopes: &[f64]) -> HyperparametersSpace {
    let mut grid = ParameterGrid::new();
    grid.insert("slope".to_string(), slopes.iter().map(|s| ParameterValue::Float(*s)).collect());
    GridHyperparametersSpace::new(vec![grid])
}

fn slope(estimator: &dyn Estimator) -> f64 {
    estimator.get_params()["slope"].as_float().unwrap()
}

#[test]
fn test_grid_search_finds_true_slope() {
    init_tracing();
    let (x, y, w) = data();
    let settings = SearchSettings::default().with_threads(3).with_metric(Metric::Rmse);
    let mut runner = SearchRunner::new(
        Box::new(SlopeRegressor { slope: 0.0 }),
        slope_grid(&[0.5, 1.0, 2.0, 3.0, -1.0]),
        settings,
    )
    .unwrap();
    let best = runner
        .get_best_estimator(&x, &y, Some(&w), &KFold::new(4).with_shuffle(5))
        .unwrap();
    assert_eq!(slope(best.as_ref()), 2.0);
    assert_eq!(runner.failures().len(), 1);

    let info = runner.get_score_info();
    assert!(info.used_grid_search);
    assert_eq!(info.grid_size, 4);
    assert_eq!(info.grid_best_score, Some(0.0));
    let json = serde_json::to_value(&info).unwrap();
    assert!(json["gridCells"][0]["scoreStd"].is_number());
}

#[test]
fn test_custom_scorer_direction() {
    let (x, y, _) = data();
    // Mean absolute error declared lower-is-better.
    let scorer = CustomScorer::new(
        Arc::new(|t: ArrayView1<f64>, p: ArrayView1<f64>, _w: Option<ArrayView1<f64>>| -> Result<f64> {
            Ok(t.iter().zip(p.iter()).map(|(a, b)| (a - b).abs()).sum::<f64>() / t.len() as f64)
        }),
        false,
    );
    let settings = SearchSettings::default()
        .with_metric(Metric::Custom)
        .with_custom_metric_gib(false);
    let mut runner = SearchRunner::with_scorer(
        Box::new(SlopeRegressor { slope: 0.0 }),
        slope_grid(&[1.0, 2.0, 4.0]),
        Arc::new(scorer),
        settings,
    );
    let best = runner.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap();
    assert_eq!(slope(best.as_ref()), 2.0);
    let best_result = runner.best_result().unwrap();
    assert_eq!(best_result.test_score_mean, 0.0);
    assert!(runner.aggregated_results().iter().all(|r| r.test_score_mean >= 0.0));
}

fn slope_space() -> HyperparametersSpace {
    let dim = HyperparameterDimension::float(DimensionDefinition::range(0.1, 4.0, Scaling::Linear, 5)).unwrap();
    HyperparametersSpace::new(vec![("slope".to_string(), dim)])
}

#[test]
fn test_bayesian_search_respects_n_iter() {
    let (x, y, _) = data();
    let settings = SearchSettings::default()
        .with_strategy(SearchStrategyKind::Bayesian)
        .with_metric(Metric::Mae)
        .with_threads(2)
        .with_n_iter(7);
    let mut runner = SearchRunner::new(Box::new(SlopeRegressor { slope: 0.0 }), slope_space(), settings).unwrap();
    assert_eq!(runner.get_experiments_count().unwrap(), Some(7));
    runner.get_best_estimator(&x, &y, None, &KFold::new(3)).unwrap();
    assert_eq!(runner.aggregated_results().len(), 7);
}

#[test]
fn test_random_search_timeout() {
    init_tracing();
    let (x, y, _) = data();
    let settings = SearchSettings::default()
        .with_strategy(SearchStrategyKind::Random)
        .with_metric(Metric::Mae)
        .with_threads(2)
        .with_timeout_minutes(0.001);
    let mut runner = SearchRunner::new(Box::new(SlopeRegressor { slope: 0.0 }), slope_space(), settings).unwrap();
    assert_eq!(runner.get_experiments_count().unwrap(), None);
    let best = runner.get_best_estimator(&x, &y, None, &KFold::new(2)).unwrap();
    assert!(slope(best.as_ref()) > 0.0);
    assert!(!runner.aggregated_results().is_empty());
}
