//! Gaussian process surrogate used by the sequential optimizer.
//!
//! Inputs live in the unit hypercube produced by [`Prior::to_unit`]; outputs
//! are normalized before fitting and denormalized on prediction.
//!
//! [`Prior::to_unit`]: super::dimension::Prior::to_unit

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{PrepError, Result};

const JITTER: f64 = 1e-10;

/// Covariance function of the surrogate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelType {
    /// Squared exponential
    RBF { length_scale: f64 },
    /// Matern with nu in {0.5, 1.5, 2.5}
    Matern { nu: f64, length_scale: f64 },
    RationalQuadratic { length_scale: f64, alpha: f64 },
}

impl Default for KernelType {
    fn default() -> Self {
        KernelType::Matern { nu: 2.5, length_scale: 1.0 }
    }
}

impl KernelType {
    fn value(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        let dist_sq: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
        match *self {
            KernelType::RBF { length_scale } => (-0.5 * dist_sq / (length_scale * length_scale)).exp(),
            KernelType::Matern { nu, length_scale } => {
                let r = dist_sq.sqrt() / length_scale;
                if r < 1e-12 {
                    return 1.0;
                }
                if (nu - 0.5).abs() < 1e-6 {
                    (-r).exp()
                } else if (nu - 1.5).abs() < 1e-6 {
                    let s = 3.0_f64.sqrt() * r;
                    (1.0 + s) * (-s).exp()
                } else {
                    let s = 5.0_f64.sqrt() * r;
                    (1.0 + s + s * s / 3.0) * (-s).exp()
                }
            }
            KernelType::RationalQuadratic { length_scale, alpha } => {
                (1.0 + dist_sq / (2.0 * alpha * length_scale * length_scale)).powf(-alpha)
            }
        }
    }

    fn matrix(&self, x1: &Array2<f64>, x2: &Array2<f64>) -> Array2<f64> {
        Array2::from_shape_fn((x1.nrows(), x2.nrows()), |(i, j)| self.value(x1.row(i), x2.row(j)))
    }
}

/// Score used to rank candidates; higher is more promising. The objective
/// is always minimized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum AcquisitionFunction {
    /// Expected improvement
    #[default]
    EI,
    /// Probability of improvement
    PI,
    /// Lower confidence bound
    LCB { kappa: f64 },
}

impl AcquisitionFunction {
    pub fn evaluate(&self, mean: f64, var: f64, best: f64) -> f64 {
        let std = var.sqrt().max(JITTER);
        match *self {
            AcquisitionFunction::EI => {
                let improvement = best - mean;
                let z = improvement / std;
                improvement * normal_cdf(z) + std * normal_pdf(z)
            }
            AcquisitionFunction::PI => normal_cdf((best - mean) / std),
            AcquisitionFunction::LCB { kappa } => -(mean - kappa * std),
        }
    }
}

#[derive(Debug, Clone)]
struct Fitted {
    x: Array2<f64>,
    chol: Array2<f64>,
    alpha: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct GaussianProcess {
    kernel: KernelType,
    noise: f64,
    fitted: Option<Fitted>,
    y_mean: f64,
    y_std: f64,
}

impl GaussianProcess {
    pub fn new(kernel: KernelType) -> Self {
        Self {
            kernel,
            noise: 1e-6,
            fitted: None,
            y_mean: 0.0,
            y_std: 1.0,
        }
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.max(JITTER);
        self
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn fit(&mut self, x: Array2<f64>, y: &Array1<f64>) -> Result<()> {
        if x.nrows() != y.len() {
            return Err(PrepError::ShapeError {
                expected: format!("{} targets", x.nrows()),
                actual: format!("{} targets", y.len()),
            });
        }
        if y.is_empty() {
            return Err(PrepError::ComputationError("Cannot fit a surrogate on no observations".to_string()));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(PrepError::ComputationError("Surrogate targets must be finite".to_string()));
        }

        self.y_mean = y.mean().unwrap_or(0.0);
        self.y_std = y.std(0.0);
        if self.y_std < JITTER {
            self.y_std = 1.0;
        }
        let y_norm = y.mapv(|v| (v - self.y_mean) / self.y_std);

        let mut k = self.kernel.matrix(&x, &x);
        for i in 0..k.nrows() {
            k[[i, i]] += self.noise;
        }
        let chol = cholesky(&k);
        let z = solve_lower(&chol, y_norm.view());
        let alpha = solve_upper_transposed(&chol, z.view());
        self.fitted = Some(Fitted { x, chol, alpha });
        Ok(())
    }

    /// Posterior mean and variance at each row of `x`.
    pub fn predict(&self, x: &Array2<f64>) -> Result<(Array1<f64>, Array1<f64>)> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or_else(|| PrepError::ComputationError("Surrogate used before fit".to_string()))?;
        let k_star = self.kernel.matrix(x, &fitted.x);
        let mean = k_star.dot(&fitted.alpha).mapv(|m| m * self.y_std + self.y_mean);
        let var = Array1::from_shape_fn(x.nrows(), |i| {
            let v = solve_lower(&fitted.chol, k_star.row(i));
            let prior = self.kernel.value(x.row(i), x.row(i));
            (prior - v.dot(&v)).max(JITTER) * self.y_std * self.y_std
        });
        Ok((mean, var))
    }
}

fn cholesky(a: &Array2<f64>) -> Array2<f64> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[[i, k]] * l[[j, k]]).sum();
            if i == j {
                l[[i, i]] = (a[[i, i]] - sum).max(JITTER).sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }
    l
}

/// Solve `L x = b`.
fn solve_lower(l: &Array2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let mut x = Array1::<f64>::zeros(b.len());
    for i in 0..b.len() {
        let sum: f64 = (0..i).map(|j| l[[i, j]] * x[j]).sum();
        x[i] = (b[i] - sum) / l[[i, i]];
    }
    x
}

/// Solve `L^T x = b`.
fn solve_upper_transposed(l: &Array2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let sum: f64 = ((i + 1)..n).map(|j| l[[j, i]] * x[j]).sum();
        x[i] = (b[i] - sum) / l[[i, i]];
    }
    x
}

fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

fn normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Abramowitz and Stegun 7.1.26
fn erf(x: f64) -> f64 {
    const A: [f64; 5] = [0.254829592, -0.284496736, 1.421413741, -1.453152027, 1.061405429];
    const P: f64 = 0.3275911;
    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = A.iter().rev().fold(0.0, |acc, a| acc * t + a) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_interpolates_observations() {
        let mut gp = GaussianProcess::new(KernelType::RBF { length_scale: 0.3 });
        let x = array![[0.0], [0.5], [1.0]];
        let y = array![1.0, 0.0, 1.0];
        gp.fit(x.clone(), &y).unwrap();
        let (mean, var) = gp.predict(&x).unwrap();
        for i in 0..3 {
            assert!((mean[i] - y[i]).abs() < 1e-3);
            assert!(var[i] < 1e-3);
        }
    }

    #[test]
    fn test_unfitted_predict_is_error() {
        let gp = GaussianProcess::new(KernelType::default());
        assert!(gp.predict(&array![[0.1]]).is_err());
    }

    #[test]
    fn test_expected_improvement_prefers_low_mean() {
        let ei = AcquisitionFunction::EI;
        assert!(ei.evaluate(0.0, 0.1, 1.0) > ei.evaluate(2.0, 0.1, 1.0));
        assert!(ei.evaluate(1.0, 1.0, 1.0) > ei.evaluate(1.0, 0.01, 1.0));
    }

    #[test]
    fn test_erf_reference_values() {
        assert!(erf(0.0).abs() < 1e-8);
        assert!((erf(1.0) - 0.842_700_79).abs() < 1e-6);
        assert!((erf(-1.0) + 0.842_700_79).abs() < 1e-6);
    }
}
