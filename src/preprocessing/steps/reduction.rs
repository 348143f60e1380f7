//! Dimensionality reduction and clustering-based outlier detection.
//!
//! PCA extracts eigenvectors of the covariance matrix by power iteration
//! with deflation; the mini-cluster KMeans uses k-means++ seeding. Both are
//! seeded so a fit is reproducible.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PrepError, Result};
use crate::frame::{ColumnValues, MultiFrame};
use crate::preprocessing::resources::ResourceStore;
use crate::preprocessing::step::{PreprocessingStep, StepContext};

const POWER_MAX_ITER: usize = 300;
const POWER_TOL: f64 = 1e-10;

/// How a PCA is fitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaSettings {
    /// Keep the fewest components whose explained variance reaches this ratio
    pub kept_variance: Option<f64>,
    pub max_components: Option<usize>,
    /// Scale columns to unit variance before projecting
    pub normalize: bool,
    /// Divide each projected column by the square root of its variance
    pub whiten: bool,
    pub random_state: u64,
}

impl Default for PcaSettings {
    fn default() -> Self {
        Self {
            kept_variance: None,
            max_components: None,
            normalize: true,
            whiten: false,
            random_state: 1337,
        }
    }
}

impl PcaSettings {
    pub fn with_kept_variance(mut self, kept_variance: f64) -> Self {
        self.kept_variance = Some(kept_variance);
        self
    }

    pub fn with_whiten(mut self, whiten: bool) -> Self {
        self.whiten = whiten;
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }
}

/// Fitted PCA projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaModel {
    pub input_names: Vec<String>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    /// One row per component
    pub components: Array2<f64>,
    pub explained_variance: Vec<f64>,
    pub explained_variance_ratio: Vec<f64>,
    pub whiten: bool,
}

impl PcaModel {
    pub fn fit(x: &Array2<f64>, input_names: Vec<String>, settings: &PcaSettings) -> Result<Self> {
        let (n, d) = x.dim();
        if n < 2 {
            return Err(PrepError::DataError("PCA requires at least 2 samples".to_string()));
        }
        if d == 0 {
            return Err(PrepError::DataError("PCA requires at least 1 feature".to_string()));
        }

        let means = x.mean_axis(Axis(0)).map(|m| m.to_vec()).unwrap_or_else(|| vec![0.0; d]);
        let scales: Vec<f64> = if settings.normalize {
            x.std_axis(Axis(0), 1.0).iter().map(|s| if *s > 0.0 { *s } else { 1.0 }).collect()
        } else {
            vec![1.0; d]
        };
        let centered = standardize(x, &means, &scales);
        let cov = centered.t().dot(&centered) / (n as f64 - 1.0);
        let total_variance: f64 = cov.diag().sum();
        if total_variance <= 0.0 {
            return Err(PrepError::DataError("PCA: every input column is constant".to_string()));
        }

        let limit = settings.max_components.unwrap_or(n.min(d)).min(d).max(1);
        let (eigenvalues, vectors) = power_iteration(cov, limit, settings.kept_variance, total_variance, settings.random_state);

        let k = eigenvalues.len();
        let mut components = Array2::zeros((k, d));
        for (c, v) in vectors.iter().enumerate() {
            components.row_mut(c).assign(v);
        }
        let ratio = eigenvalues.iter().map(|e| e / total_variance).collect();
        debug!(components = k, inputs = d, "PCA fitted");
        Ok(Self {
            input_names,
            means,
            scales,
            components,
            explained_variance: eigenvalues,
            explained_variance_ratio: ratio,
            whiten: settings.whiten,
        })
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    /// Keep only the first `k` components.
    pub fn truncate(&mut self, k: usize) {
        let k = k.min(self.n_components());
        self.components = self.components.slice(ndarray::s![..k, ..]).to_owned();
        self.explained_variance.truncate(k);
        self.explained_variance_ratio.truncate(k);
    }

    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.means.len() {
            return Err(PrepError::ShapeError {
                expected: format!("{} PCA input columns", self.means.len()),
                actual: format!("{} columns", x.ncols()),
            });
        }
        let mut projected = standardize(x, &self.means, &self.scales).dot(&self.components.t());
        if self.whiten {
            for (mut col, var) in projected.axis_iter_mut(Axis(1)).zip(&self.explained_variance) {
                let inv = if *var > 0.0 { 1.0 / var.sqrt() } else { 0.0 };
                col.mapv_inplace(|v| v * inv);
            }
        }
        Ok(projected)
    }
}

fn standardize(x: &Array2<f64>, means: &[f64], scales: &[f64]) -> Array2<f64> {
    let means = Array1::from_vec(means.to_vec());
    let scales = Array1::from_vec(scales.to_vec());
    (x - &means) / &scales
}

/// Top eigenpairs of a symmetric matrix. Stops early once the explained
/// ratio reaches `kept_variance` or the remaining spectrum is empty.
fn power_iteration(
    mut work: Array2<f64>,
    k: usize,
    kept_variance: Option<f64>,
    total_variance: f64,
    seed: u64,
) -> (Vec<f64>, Vec<Array1<f64>>) {
    let d = work.nrows();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut eigenvalues = Vec::with_capacity(k);
    let mut eigenvectors = Vec::with_capacity(k);
    let mut explained = 0.0;

    for _ in 0..k {
        let mut v: Array1<f64> = (0..d).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let norm = v.dot(&v).sqrt().max(1e-12);
        v /= norm;

        let mut eigenvalue = 0.0;
        for _ in 0..POWER_MAX_ITER {
            let w = work.dot(&v);
            eigenvalue = v.dot(&w);
            let w_norm = w.dot(&w).sqrt().max(1e-12);
            let next = w / w_norm;
            let diff = (&next - &v).mapv(|x| x * x).sum().sqrt();
            v = next;
            if diff < POWER_TOL {
                break;
            }
        }
        eigenvalue = eigenvalue.max(0.0);
        if !eigenvalues.is_empty() && eigenvalue <= 1e-12 * total_variance {
            break;
        }

        // deterministic sign: largest coordinate positive
        let pivot = v.iter().copied().fold(0.0f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
        if pivot < 0.0 {
            v.mapv_inplace(|x| -x);
        }

        for i in 0..d {
            for j in 0..d {
                work[[i, j]] -= eigenvalue * v[i] * v[j];
            }
        }
        explained += eigenvalue / total_variance;
        eigenvalues.push(eigenvalue);
        eigenvectors.push(v);

        if let Some(kept) = kept_variance {
            if explained >= kept {
                break;
            }
        }
    }
    (eigenvalues, eigenvectors)
}

/// KMeans with k-means++ seeding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansModel {
    pub n_clusters: usize,
    pub max_iter: usize,
    pub tol: f64,
    pub random_state: u64,
    centroids: Option<Array2<f64>>,
}

impl KMeansModel {
    pub fn new(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            max_iter: 300,
            tol: 1e-4,
            random_state: 42,
            centroids: None,
        }
    }

    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }

    fn kmeans_pp_init(x: &Array2<f64>, k: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
        let n_samples = x.nrows();
        let mut centroids = Array2::zeros((k, x.ncols()));

        let first = (rng.next_u64() as usize) % n_samples;
        centroids.row_mut(0).assign(&x.row(first));

        for c in 1..k {
            let dists: Vec<f64> = (0..n_samples)
                .map(|i| {
                    (0..c)
                        .map(|j| euclidean_sq(&x.row(i), &centroids.row(j)))
                        .fold(f64::MAX, f64::min)
                })
                .collect();

            // weighted draw proportional to D²
            let total: f64 = dists.iter().sum();
            if total <= 0.0 {
                let idx = (rng.next_u64() as usize) % n_samples;
                centroids.row_mut(c).assign(&x.row(idx));
                continue;
            }
            let r = (rng.next_u64() as f64 / u64::MAX as f64) * total;
            let mut cumulative = 0.0;
            let mut chosen = n_samples - 1;
            for (i, &d) in dists.iter().enumerate() {
                cumulative += d;
                if cumulative >= r {
                    chosen = i;
                    break;
                }
            }
            centroids.row_mut(c).assign(&x.row(chosen));
        }
        centroids
    }

    fn nearest(centroids: &Array2<f64>, x: &Array2<f64>) -> Vec<usize> {
        (0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let row = x.row(i);
                let mut best_c = 0;
                let mut best_dist = f64::MAX;
                for (c, centroid) in centroids.outer_iter().enumerate() {
                    let d = euclidean_sq(&row, &centroid);
                    if d < best_dist {
                        best_dist = d;
                        best_c = c;
                    }
                }
                best_c
            })
            .collect()
    }

    /// Fit and return the training labels.
    pub fn fit_predict(&mut self, x: &Array2<f64>) -> Result<Vec<usize>> {
        let n_samples = x.nrows();
        if n_samples < self.n_clusters || self.n_clusters == 0 {
            return Err(PrepError::ComputationError(format!(
                "KMeans: n_samples ({}) < n_clusters ({})",
                n_samples, self.n_clusters
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.random_state);
        let mut centroids = Self::kmeans_pp_init(x, self.n_clusters, &mut rng);
        let mut labels = vec![usize::MAX; n_samples];

        for _ in 0..self.max_iter {
            let new_labels = Self::nearest(&centroids, x);
            let changed = new_labels.iter().zip(&labels).filter(|(a, b)| a != b).count();
            labels = new_labels;

            let mut new_centroids = Array2::zeros(centroids.dim());
            let mut counts = vec![0usize; self.n_clusters];
            for (i, &c) in labels.iter().enumerate() {
                counts[c] += 1;
                let mut row = new_centroids.row_mut(c);
                row += &x.row(i);
            }
            for (c, count) in counts.iter().enumerate() {
                if *count > 0 {
                    new_centroids.row_mut(c).mapv_inplace(|v| v / *count as f64);
                } else {
                    // empty cluster, reseed
                    let idx = (rng.next_u64() as usize) % n_samples;
                    new_centroids.row_mut(c).assign(&x.row(idx));
                }
            }

            let shift = (&centroids - &new_centroids).mapv(|v| v * v).sum().sqrt();
            centroids = new_centroids;
            if changed == 0 || shift < self.tol {
                break;
            }
        }

        self.centroids = Some(centroids);
        Ok(labels)
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<usize>> {
        let centroids = self
            .centroids
            .as_ref()
            .ok_or_else(|| PrepError::not_fitted("clustering_outliers", "kmeans"))?;
        Ok(Self::nearest(centroids, x))
    }
}

fn euclidean_sq(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Project a named output frame into `factor_<i>` columns of a new frame.
pub struct PcaStep {
    settings: PcaSettings,
    input_name: String,
    output_name: String,
    model: Option<PcaModel>,
}

impl PcaStep {
    pub fn new(settings: PcaSettings, input_name: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            settings,
            input_name: input_name.into(),
            output_name: output_name.into(),
            model: None,
        }
    }
}

impl PreprocessingStep for PcaStep {
    fn name(&self) -> String {
        format!("PcaStep ({} -> {})", self.input_name, self.output_name)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        self.model = resources.pca()?.get(&self.output_name).cloned();
        Ok(())
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let source = ctx.output.frame(&self.input_name)?;
        let x = source.as_dense_array()?;
        debug!(rows = x.nrows(), cols = x.ncols(), "Starting PCA fit");
        let model = PcaModel::fit(&x, source.columns(), &self.settings)?;
        ctx.resources.pca()?.insert(self.output_name.clone(), model.clone());
        self.model = Some(model);
        self.process(ctx)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| PrepError::not_fitted("pca", &self.output_name))?;
        let source = ctx.output.frame(&self.input_name)?;
        let projected = model.transform(&source.as_dense_array()?)?;
        let names = (0..projected.ncols()).map(|i| format!("factor_{}", i)).collect();
        let mut out = MultiFrame::new(source.index().to_vec());
        out.append_dense("pca_out", projected, names)?;
        ctx.output.frames.insert(self.output_name.clone(), out);
        Ok(())
    }
}

/// Everything needed to flag outliers on new rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierModel {
    pub pca: PcaModel,
    pub mini_kmeans: KMeansModel,
    pub outlier_labels: Vec<usize>,
}

/// Flag rows falling in tiny KMeans mini-clusters, publish the mask under
/// `outlier_name` and drop those rows.
pub struct OutlierDetection {
    kept_variance: f64,
    min_n: usize,
    min_cum_ratio: f64,
    outlier_name: String,
    random_state: u64,
    model: Option<OutlierModel>,
}

impl OutlierDetection {
    pub fn new(kept_variance: f64, min_n: usize, min_cum_ratio: f64) -> Self {
        Self {
            kept_variance,
            min_n,
            min_cum_ratio,
            outlier_name: "OUTLIERS".to_string(),
            random_state: 1337,
            model: None,
        }
    }

    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }

    /// Mini-clusters by ascending size; a cluster is an outlier when its
    /// running share of rows is below `min_cum_ratio` or it holds fewer
    /// than `min_n` rows.
    fn find_outliers(&self, labels: &[usize]) -> Vec<usize> {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for l in labels {
            *counts.entry(*l).or_insert(0) += 1;
        }
        let mut by_size: Vec<(usize, usize)> = counts.into_iter().collect();
        by_size.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        let total = labels.len() as f64;
        let mut cum_ratio = 0.0;
        let mut outliers = Vec::new();
        for (label, count) in by_size {
            cum_ratio += count as f64 / total;
            if cum_ratio < self.min_cum_ratio || count < self.min_n {
                outliers.push(label);
            }
        }
        outliers.sort_unstable();
        outliers
    }

    fn apply(&self, ctx: &mut StepContext<'_>, mask: Vec<bool>) -> Result<()> {
        let flags = mask.iter().map(|m| if *m { 1.0 } else { 0.0 }).collect();
        let mut outliers = MultiFrame::new(ctx.mf.index().to_vec());
        outliers.append_columns("outliers_block", vec![("data".to_string(), ColumnValues::Numeric(flags))], true)?;
        ctx.output.frames.insert(self.outlier_name.clone(), outliers);

        let dropped = mask.iter().filter(|m| **m).count();
        if dropped > 0 {
            info!(rows = dropped, "Outliers detection: dropping rows");
            ctx.drop_rows(&mask);
        }
        Ok(())
    }
}

impl PreprocessingStep for OutlierDetection {
    fn name(&self) -> String {
        "OutlierDetection".to_string()
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        self.model = resources.clustering_outliers()?.get(&self.outlier_name).cloned();
        Ok(())
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let x = ctx.mf.as_dense_array()?;
        let settings = PcaSettings::default()
            .with_kept_variance(self.kept_variance)
            .with_random_state(self.random_state);
        let pca = PcaModel::fit(&x, ctx.mf.columns(), &settings)?;
        let reduced = pca.transform(&x)?;

        let n_clusters = 3usize.max((reduced.nrows() as f64).cbrt() as usize);
        debug!(clusters = n_clusters, rows = reduced.nrows(), "Outliers detection: cubic-root kmeans");
        let mut mini_kmeans = KMeansModel::new(n_clusters).with_random_state(self.random_state);
        let labels = mini_kmeans.fit_predict(&reduced)?;
        let outlier_labels = self.find_outliers(&labels);
        info!(clusters = outlier_labels.len(), "Outliers detection: mini-clusters flagged as outliers");

        let mask = labels.iter().map(|l| outlier_labels.binary_search(l).is_ok()).collect();
        self.apply(ctx, mask)?;

        let model = OutlierModel { pca, mini_kmeans, outlier_labels };
        ctx.resources.clustering_outliers()?.insert(self.outlier_name.clone(), model.clone());
        self.model = Some(model);

        if ctx.mf.height() == 0 {
            return Err(PrepError::DroppedMultiframe(
                "Outliers detection: all rows have been dropped. Check mini-cluster size threshold".to_string(),
            ));
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| PrepError::not_fitted("clustering_outliers", &self.outlier_name))?;
        let reduced = model.pca.transform(&ctx.mf.as_dense_array()?)?;
        let labels = model.mini_kmeans.predict(&reduced)?;
        let mask = labels.iter().map(|l| model.outlier_labels.binary_search(l).is_ok()).collect();
        self.apply(ctx, mask)
    }
}
