//! The estimator contract the search fits and scores.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::{PrepError, Result};
use crate::optimizer::HyperparamPoint;

/// A learning algorithm driven by the search.
///
/// Implementations are cloned once per split evaluation, so `fit` never
/// runs twice on the same instance concurrently.
pub trait Estimator: Send + Sync {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>, sample_weight: Option<ArrayView1<f64>>) -> Result<()>;

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>>;

    /// Class probabilities, one column per class index.
    fn predict_proba(&self, _x: ArrayView2<f64>) -> Result<Array2<f64>> {
        Err(PrepError::ConfigError(format!(
            "Estimator {} does not predict probabilities",
            self.name()
        )))
    }

    fn get_params(&self) -> HyperparamPoint;

    fn set_params(&mut self, params: &HyperparamPoint) -> Result<()>;

    /// Whether `fit` honours sample weights. Scoring always uses them.
    fn supports_sample_weight(&self) -> bool {
        true
    }

    /// Fresh unfitted copy carrying the same parameters.
    fn clone_box(&self) -> Box<dyn Estimator>;

    fn name(&self) -> String {
        "estimator".to_string()
    }
}

impl Clone for Box<dyn Estimator> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl std::fmt::Debug for dyn Estimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Estimator")
            .field("name", &self.name())
            .field("params", &self.get_params())
            .finish()
    }
}
