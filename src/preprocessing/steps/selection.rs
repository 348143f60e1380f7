//! Supervised feature selection on the final training frame.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PrepError, Result};
use crate::frame::{BlockData, ColumnValues, MultiFrame};
use crate::preprocessing::params::{FeatureSelectionParams, PredictionType, SelectionMethod};
use crate::preprocessing::resources::ResourceStore;
use crate::preprocessing::step::{PreprocessingStep, StepContext};

use super::reduction::{PcaModel, PcaSettings};

const MODEL_KEY: &str = "selection";

/// What a fitted selection does to a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "selection_params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureSelectionModel {
    NoOp,
    Drop { kept_columns: Vec<String> },
    Pca(PcaModel),
}

impl FeatureSelectionModel {
    pub fn transform(&self, mf: &mut MultiFrame) -> Result<()> {
        match self {
            FeatureSelectionModel::NoOp => Ok(()),
            FeatureSelectionModel::Drop { kept_columns } => {
                mf.select_columns(kept_columns);
                Ok(())
            }
            FeatureSelectionModel::Pca(model) => {
                let projected = model.transform(&mf.as_dense_array()?)?;
                let names = (0..projected.ncols()).map(|i| format!("principal_component:{}", i)).collect();
                mf.select_columns(&[]);
                mf.append_dense("pca_features", projected, names)
            }
        }
    }
}

/// Visit every stored value of the exported columns as `(column, row, value)`.
fn for_each_value(mf: &MultiFrame, mut f: impl FnMut(usize, usize, f64)) -> Result<()> {
    let mut offset = 0;
    for block in mf.blocks().filter(|b| b.keep) {
        match &block.data {
            BlockData::Sparse { matrix, .. } => {
                for r in 0..matrix.nrows() {
                    for (c, v) in matrix.row(r) {
                        f(offset + c, r, v);
                    }
                }
            }
            BlockData::Dense { array, .. } => {
                for ((r, c), v) in array.indexed_iter() {
                    f(offset + c, r, *v);
                }
            }
            BlockData::Columns(cols) => {
                for (c, (name, values)) in cols.iter().enumerate() {
                    match values {
                        ColumnValues::Numeric(v) => v.iter().enumerate().for_each(|(r, x)| f(offset + c, r, *x)),
                        ColumnValues::Text(_) => {
                            return Err(PrepError::DataError(format!(
                                "Feature selection needs numeric columns, {} is not",
                                name
                            )))
                        }
                    }
                }
            }
        }
        offset += block.data.ncols();
    }
    Ok(())
}

fn top_names(names: Vec<String>, scores: Vec<f64>, n: usize) -> Vec<String> {
    let mut scored: Vec<(String, f64)> = names.into_iter().zip(scores).collect();
    let key = |s: f64| if s.is_nan() { f64::NEG_INFINITY } else { s };
    scored.sort_by(|a, b| key(b.1).total_cmp(&key(a.1)));
    scored.into_iter().take(n).map(|(name, _)| name).collect()
}

/// |pearson(column, target)| with the population std of the column and the
/// sample std of the target. Constant columns score 0.
fn regression_correlations(mf: &MultiFrame, target: &[f64]) -> Result<Vec<f64>> {
    let n_cols = mf.shape().1;
    let n = target.len() as f64;
    let t_mean = target.iter().sum::<f64>() / n;
    let t_std = (target.iter().map(|t| (t - t_mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
    let mut sum = vec![0.0; n_cols];
    let mut sq = vec![0.0; n_cols];
    let mut xy = vec![0.0; n_cols];
    for_each_value(mf, |c, r, v| {
        sum[c] += v;
        sq[c] += v * v;
        xy[c] += v * target[r];
    })?;
    Ok((0..n_cols)
        .map(|c| {
            let s_mean = sum[c] / n;
            let s_std = (sq[c] / n - s_mean * s_mean).max(0.0).sqrt();
            if s_std == 0.0 {
                0.0
            } else {
                ((xy[c] / n - t_mean * s_mean) / (s_std * t_std)).abs()
            }
        })
        .collect())
}

/// One-way ANOVA F statistic of each column against the class labels.
fn anova_f_scores(mf: &MultiFrame, target: &[f64]) -> Result<Vec<f64>> {
    let n_cols = mf.shape().1;
    let mut classes: BTreeMap<i64, usize> = BTreeMap::new();
    for t in target {
        let next = classes.len();
        classes.entry(*t as i64).or_insert(next);
    }
    let groups: Vec<usize> = target.iter().map(|t| classes[&(*t as i64)]).collect();
    let k = classes.len();
    let n = target.len();
    let mut group_sizes = vec![0.0; k];
    groups.iter().for_each(|g| group_sizes[*g] += 1.0);

    let mut group_sums = vec![vec![0.0; n_cols]; k];
    let mut sq = vec![0.0; n_cols];
    for_each_value(mf, |c, r, v| {
        group_sums[groups[r]][c] += v;
        sq[c] += v * v;
    })?;

    Ok((0..n_cols)
        .map(|c| {
            let total: f64 = (0..k).map(|g| group_sums[g][c]).sum();
            let ss_total = sq[c] - total * total / n as f64;
            let ss_between: f64 = (0..k)
                .filter(|g| group_sizes[*g] > 0.0)
                .map(|g| group_sums[g][c].powi(2) / group_sizes[g])
                .sum::<f64>()
                - total * total / n as f64;
            let ss_within = (ss_total - ss_between).max(0.0);
            let df_between = k as f64 - 1.0;
            let df_within = n as f64 - k as f64;
            (ss_between / df_between) / (ss_within / df_within)
        })
        .collect())
}

/// Selects features on TRAIN and replays the selection afterwards.
pub struct FeatureSelectionStep {
    params: FeatureSelectionParams,
    prediction_type: PredictionType,
    model: Option<FeatureSelectionModel>,
}

impl FeatureSelectionStep {
    pub fn new(params: FeatureSelectionParams, prediction_type: PredictionType) -> Self {
        Self {
            params,
            prediction_type,
            model: None,
        }
    }

    fn fit(&self, mf: &MultiFrame, target: Option<&[f64]>) -> Result<FeatureSelectionModel> {
        let needs_target = || {
            target.ok_or_else(|| PrepError::DataError("Feature selection by correlation needs a target".to_string()))
        };
        match self.params.method {
            SelectionMethod::None => Ok(FeatureSelectionModel::NoOp),
            SelectionMethod::Lasso | SelectionMethod::RandomForest => Err(PrepError::ConfigError(format!(
                "Feature selection method {:?} needs a learning algorithm and is not available",
                self.params.method
            ))),
            SelectionMethod::Correlation => {
                let params = self.params.correlation_params.as_ref().ok_or_else(|| {
                    PrepError::ConfigError("Correlation feature selection needs correlation_params".to_string())
                })?;
                let target = needs_target()?;
                let names = mf.columns();
                let kept = if self.prediction_type == PredictionType::Regression {
                    let scores = regression_correlations(mf, target)?;
                    let (in_range, filtered): (Vec<_>, Vec<_>) = names
                        .into_iter()
                        .zip(scores)
                        .partition(|(_, c)| params.min_abs_correlation < *c && *c < params.max_abs_correlation);
                    info!(
                        filtered = filtered.len(),
                        min = params.min_abs_correlation,
                        max = params.max_abs_correlation,
                        "Filtered features because of the correlation range"
                    );
                    let (names, scores) = in_range.into_iter().unzip();
                    top_names(names, scores, params.n_features)
                } else {
                    let scores = anova_f_scores(mf, target)?;
                    top_names(names, scores, params.n_features)
                };
                if kept.is_empty() {
                    return Err(PrepError::DataError(
                        "No columns left after reduction because threshold was too high. Adjust in parameters."
                            .to_string(),
                    ));
                }
                Ok(FeatureSelectionModel::Drop { kept_columns: kept })
            }
            SelectionMethod::Pca => {
                let params = self.params.pca_params.as_ref().ok_or_else(|| {
                    PrepError::ConfigError("PCA feature selection needs pca_params".to_string())
                })?;
                let x = mf.as_dense_array()?;
                let settings = PcaSettings::default().with_normalize(false).with_whiten(true);
                let mut model = PcaModel::fit(&x, mf.columns(), &settings)?;
                let mut cumulative = 0.0;
                let first_above = model.explained_variance_ratio.iter().position(|r| {
                    cumulative += r;
                    cumulative > params.variance_proportion
                });
                let n_var = match first_above {
                    Some(0) | None => model.n_components(),
                    Some(i) => i,
                };
                model.truncate(params.n_features.min(n_var));
                if model.n_components() == 0 {
                    return Err(PrepError::DataError("PCA feature selection kept no component".to_string()));
                }
                Ok(FeatureSelectionModel::Pca(model))
            }
        }
    }
}

impl PreprocessingStep for FeatureSelectionStep {
    fn name(&self) -> String {
        format!("FeatureSelectionStep ({:?})", self.params.method)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        self.model = resources.feature_selection()?.get(MODEL_KEY).cloned();
        Ok(())
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let target = ctx.output.target.as_ref().map(|t| t.to_f64_vec());
        if let Some(t) = &target {
            if t.len() != ctx.mf.height() {
                return Err(PrepError::ShapeError {
                    expected: format!("{} target values", ctx.mf.height()),
                    actual: format!("{} target values", t.len()),
                });
            }
        }
        let model = self.fit(ctx.mf, target.as_deref())?;
        debug!(model = ?std::mem::discriminant(&model), "Feature selection fitted");
        ctx.resources.feature_selection()?.insert(MODEL_KEY.to_string(), model.clone());
        self.model = Some(model);
        self.process(ctx)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| PrepError::not_fitted("feature_selection", MODEL_KEY))?;
        model.transform(ctx.mf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::InputFrame;
    use crate::preprocessing::output::SideSeries;
    use crate::preprocessing::params::{CorrelationParams, PcaSelectionParams};
    use crate::preprocessing::steps::testing::Harness;

    fn harness(target: Vec<f64>) -> Harness {
        let n = target.len();
        let mut h = Harness::new(InputFrame::new(vec![("t".into(), ColumnValues::Numeric(target.clone()))]).unwrap());
        let signal: Vec<f64> = target.iter().map(|t| 2.0 * t + 1.0).collect();
        let noise: Vec<f64> = (0..n).map(|i| ((i * 7) % 5) as f64).collect();
        h.mf.append_columns(
            "num",
            vec![
                ("signal".into(), ColumnValues::Numeric(signal)),
                ("noise".into(), ColumnValues::Numeric(noise)),
                ("constant".into(), ColumnValues::Numeric(vec![3.0; n])),
            ],
            true,
        )
        .unwrap();
        h.output.target = Some(SideSeries::new((0..n).collect(), ColumnValues::Numeric(target)).unwrap());
        h
    }

    fn correlation(n_features: usize, min: f64) -> FeatureSelectionParams {
        FeatureSelectionParams {
            method: SelectionMethod::Correlation,
            correlation_params: Some(CorrelationParams {
                n_features,
                min_abs_correlation: min,
                max_abs_correlation: 1.1,
            }),
            pca_params: None,
        }
    }

    #[test]
    fn test_regression_correlation_keeps_signal() {
        let mut h = harness(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        h.run(&mut FeatureSelectionStep::new(correlation(1, 0.0), PredictionType::Regression)).unwrap();
        assert_eq!(h.mf.columns(), vec!["signal"]);
        assert_eq!(
            h.resources.feature_selection().unwrap()[MODEL_KEY],
            FeatureSelectionModel::Drop { kept_columns: vec!["signal".into()] }
        );
    }

    #[test]
    fn test_empty_selection_is_an_error() {
        let mut h = harness(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let err = h
            .run(&mut FeatureSelectionStep::new(correlation(2, 1.05), PredictionType::Regression))
            .unwrap_err();
        assert!(err.to_string().contains("No columns left"));
    }

    #[test]
    fn test_classification_anova() {
        let mut h = harness(vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        h.run(&mut FeatureSelectionStep::new(correlation(1, 0.0), PredictionType::BinaryClassification))
            .unwrap();
        assert_eq!(h.mf.columns(), vec!["signal"]);
    }

    #[test]
    fn test_pca_selection_and_replay() {
        let mut h = harness(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let params = FeatureSelectionParams {
            method: SelectionMethod::Pca,
            correlation_params: None,
            pca_params: Some(PcaSelectionParams { n_features: 1, variance_proportion: 0.9 }),
        };
        let mut step = FeatureSelectionStep::new(params, PredictionType::Regression);
        h.run(&mut step).unwrap();
        assert_eq!(h.mf.columns(), vec!["principal_component:0"]);

        let mut replay = harness(vec![1.0, 2.0, 3.0]);
        replay.resources = std::mem::take(&mut h.resources);
        replay.replay(&mut step).unwrap();
        assert_eq!(replay.mf.shape(), (3, 1));
    }

    #[test]
    fn test_learning_methods_rejected() {
        let mut h = harness(vec![1.0, 2.0]);
        let params = FeatureSelectionParams { method: SelectionMethod::Lasso, ..Default::default() };
        let err = h.run(&mut FeatureSelectionStep::new(params, PredictionType::Regression)).unwrap_err();
        assert!(matches!(err, PrepError::ConfigError(_)));
    }

    #[test]
    fn test_replay_before_fit() {
        let mut h = harness(vec![1.0, 2.0]);
        let err = h
            .replay(&mut FeatureSelectionStep::new(FeatureSelectionParams::default(), PredictionType::Regression))
            .unwrap_err();
        assert!(matches!(err, PrepError::ResourceNotFitted { .. }));
    }
}
