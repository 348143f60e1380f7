//! Numeric feature handling: rescaling, binarization, quantile binning and
//! generated numeric features.

use std::collections::BTreeMap;

use serde_json::json;
use tracing::debug;

use crate::error::{PrepError, Result};
use crate::frame::ColumnValues;
use crate::preprocessing::collector::quantile_sorted;
use crate::preprocessing::output::FitReport;
use crate::preprocessing::resources::{BinarizeThreshold, RescaleFactors, ResourceStore};
use crate::preprocessing::step::{PreprocessingStep, StepContext};

use super::add_column_to_builder;

/// Rescale one column of a block in place.
pub struct RescalingProcessor {
    block: String,
    column: String,
    factors: RescaleFactors,
}

impl RescalingProcessor {
    pub fn from_minmax(block: impl Into<String>, column: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            block: block.into(),
            column: column.into(),
            factors: RescaleFactors::from_scale(min, max - min),
        }
    }

    pub fn from_avgstd(block: impl Into<String>, column: impl Into<String>, mean: f64, std: f64) -> Self {
        Self {
            block: block.into(),
            column: column.into(),
            factors: RescaleFactors::from_scale(mean, std),
        }
    }
}

impl PreprocessingStep for RescalingProcessor {
    fn name(&self) -> String {
        format!("RescalingProcessor ({})", self.column)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        resources.rescalers()?.entry(self.column.clone()).or_insert(self.factors);
        Ok(())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let values = ctx.mf.col_as_values(&self.block, &self.column)?.to_f64_vec();
        debug!(
            column = %self.column,
            shift = self.factors.shift,
            inv_scale = self.factors.inv_scale,
            "Rescaling"
        );
        let rescaled = values.into_iter().map(|v| self.factors.apply(v)).collect();
        ctx.mf.replace_column(&self.block, &self.column, ColumnValues::Numeric(rescaled))
    }
}

/// 1 when the value is strictly above the threshold.
pub struct BinarizeSeries {
    in_block: String,
    column: String,
    out_block: String,
    threshold: f64,
}

impl BinarizeSeries {
    pub fn new(in_block: impl Into<String>, column: impl Into<String>, out_block: impl Into<String>, threshold: f64) -> Self {
        Self {
            in_block: in_block.into(),
            column: column.into(),
            out_block: out_block.into(),
            threshold,
        }
    }

    fn output_name(&self) -> String {
        format!("{}:above:{}", self.column, self.threshold)
    }
}

impl PreprocessingStep for BinarizeSeries {
    fn name(&self) -> String {
        format!("BinarizeSeries (col={}, thresh={})", self.column, self.threshold)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        let entry = BinarizeThreshold {
            output_name: format!("{}:{}", self.out_block, self.output_name()),
            threshold: self.threshold,
        };
        resources.binarized()?.entry(self.column.clone()).or_insert(entry);
        Ok(())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let values = ctx.mf.col_as_values(&self.in_block, &self.column)?.to_f64_vec();
        let above = values
            .into_iter()
            .map(|v| if v > self.threshold { 1.0 } else { 0.0 })
            .collect();
        let row_ids = ctx.row_ids();
        add_column_to_builder(
            ctx,
            &self.out_block,
            &self.output_name(),
            &self.column,
            &row_ids,
            ColumnValues::Numeric(above),
        )
    }
}

/// Equal-frequency bins learned at fit time; values outside the bounds get -1.
pub struct QuantileBinSeries {
    in_block: String,
    column: String,
    out_block: String,
    nb_bins: usize,
}

impl QuantileBinSeries {
    pub fn new(in_block: impl Into<String>, column: impl Into<String>, out_block: impl Into<String>, nb_bins: usize) -> Self {
        Self {
            in_block: in_block.into(),
            column: column.into(),
            out_block: out_block.into(),
            nb_bins,
        }
    }

    fn bounds(&self, values: &[f64]) -> Result<Vec<f64>> {
        let mut present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        present.sort_by(|a, b| a.total_cmp(b));
        let bounds: Vec<f64> = (0..=self.nb_bins)
            .map(|i| quantile_sorted(&present, i as f64 / self.nb_bins as f64))
            .collect();
        let increasing = bounds.windows(2).all(|w| w[0] < w[1]);
        if self.nb_bins == 0 || present.is_empty() || !increasing {
            return Err(PrepError::DataError(format!(
                "Could not cut feature {} in {} quantiles. It might be too skewed or not have enough values.",
                self.column, self.nb_bins
            )));
        }
        Ok(bounds)
    }

    fn emit(&self, ctx: &mut StepContext<'_>, values: &[f64], bounds: &[f64]) -> Result<()> {
        let binned = values.iter().map(|&v| bin_of(v, bounds)).collect();
        let row_ids = ctx.row_ids();
        add_column_to_builder(
            ctx,
            &self.out_block,
            &format!("{}:quantile:{}", self.column, self.nb_bins),
            &self.column,
            &row_ids,
            ColumnValues::Numeric(binned),
        )
    }
}

/// Right-closed bins, the first one also closed on the left.
fn bin_of(v: f64, bounds: &[f64]) -> f64 {
    if v.is_nan() || bounds.is_empty() || v < bounds[0] || v > bounds[bounds.len() - 1] {
        return -1.0;
    }
    if v == bounds[0] {
        return 0.0;
    }
    let pos = bounds.partition_point(|b| *b < v);
    (pos - 1) as f64
}

impl PreprocessingStep for QuantileBinSeries {
    fn name(&self) -> String {
        format!("QuantileBinSeries (col={}, nb={})", self.column, self.nb_bins)
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let values = ctx.mf.col_as_values(&self.in_block, &self.column)?.to_f64_vec();
        let bounds = self.bounds(&values)?;
        self.emit(ctx, &values, &bounds)?;
        ctx.resources.quantile_binner()?.insert(self.column.clone(), bounds);
        Ok(())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let bounds = ctx
            .resources
            .quantile_binner()?
            .get(&self.column)
            .cloned()
            .ok_or_else(|| PrepError::not_fitted("quantile_binner", &self.column))?;
        let values = ctx.mf.col_as_values(&self.in_block, &self.column)?.to_f64_vec();
        self.emit(ctx, &values, &bounds)
    }
}

/// `x^2`, `sqrt(x)` and `log(x)` of each feature. Undefined results are 0.
pub struct NumericalDerivativesGenerator {
    in_block: String,
    out_block: String,
    features: Vec<String>,
}

impl NumericalDerivativesGenerator {
    pub fn new(in_block: impl Into<String>, out_block: impl Into<String>, features: Vec<String>) -> Self {
        Self {
            in_block: in_block.into(),
            out_block: out_block.into(),
            features,
        }
    }
}

fn zero_if_nan(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v
    }
}

impl PreprocessingStep for NumericalDerivativesGenerator {
    fn name(&self) -> String {
        format!("NumericalDerivativesGenerator ({})", self.out_block)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        let derivatives = resources.derivatives()?;
        for feature in &self.features {
            derivatives.register(feature);
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let row_ids = ctx.row_ids();
        for feature in &self.features {
            let values = ctx.mf.col_as_values(&self.in_block, feature)?.to_f64_vec();
            let square = values.iter().map(|v| v.powi(2)).collect();
            let sqrt = values.iter().map(|v| zero_if_nan(v.sqrt())).collect();
            let log = values.iter().map(|v| zero_if_nan((v + 0.00000001).ln())).collect();
            add_column_to_builder(ctx, &self.out_block, &format!("{}^2", feature), feature, &row_ids, ColumnValues::Numeric(square))?;
            add_column_to_builder(ctx, &self.out_block, &format!("sqrt({})", feature), feature, &row_ids, ColumnValues::Numeric(sqrt))?;
            add_column_to_builder(ctx, &self.out_block, &format!("log({})", feature), feature, &row_ids, ColumnValues::Numeric(log))?;
        }
        ctx.flush(&self.out_block)
    }
}

/// Standardize every column of a block with moments learned at fit time.
pub struct BlockStdRescaling {
    block: String,
}

impl BlockStdRescaling {
    pub fn new(block: impl Into<String>) -> Self {
        Self { block: block.into() }
    }
}

impl PreprocessingStep for BlockStdRescaling {
    fn name(&self) -> String {
        format!("BlockStdRescaling ({})", self.block)
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let block = ctx.mf.get_block(&self.block)?;
        let mut fitted = BTreeMap::new();
        for name in block.column_names() {
            let values = ctx.mf.col_as_values(&self.block, &name)?.to_f64_vec();
            let stats = crate::preprocessing::collector::numeric_stats(&values);
            let std = stats.std.unwrap_or(f64::NAN);
            fitted.insert(name, RescaleFactors::from_scale(stats.average.unwrap_or(0.0), std));
        }
        let generic = ctx.resources.rescalers()?;
        for (name, factors) in &fitted {
            generic.insert(name.clone(), *factors);
        }
        ctx.resources.block_std_rescaler()?.insert(self.block.clone(), fitted);
        self.process(ctx)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let fitted = ctx
            .resources
            .block_std_rescaler()?
            .get(&self.block)
            .cloned()
            .ok_or_else(|| PrepError::not_fitted("block_std_rescaler", &self.block))?;
        for name in ctx.mf.get_block(&self.block)?.column_names() {
            if let Some(factors) = fitted.get(&name) {
                let values = ctx.mf.col_as_values(&self.block, &name)?.to_f64_vec();
                let rescaled = values.into_iter().map(|v| factors.apply(v)).collect();
                ctx.mf.replace_column(&self.block, &name, ColumnValues::Numeric(rescaled))?;
            }
        }
        Ok(())
    }
}

/// `a+b` and `a-b` for every pair of features.
pub struct PairwiseLinearCombinationsGenerator {
    in_block: String,
    out_block: String,
    features: Vec<String>,
    built: usize,
}

impl PairwiseLinearCombinationsGenerator {
    pub fn new(in_block: impl Into<String>, out_block: impl Into<String>, features: Vec<String>) -> Self {
        Self {
            in_block: in_block.into(),
            out_block: out_block.into(),
            features,
            built: 0,
        }
    }
}

impl PreprocessingStep for PairwiseLinearCombinationsGenerator {
    fn name(&self) -> String {
        format!("PairwiseLinearCombinationsGenerator ({})", self.out_block)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        if self.features.len() < 2 {
            return Err(PrepError::ConfigError(
                "Pairwise combinations need at least two features".to_string(),
            ));
        }
        let row_ids = ctx.row_ids();
        let columns = self
            .features
            .iter()
            .map(|f| ctx.mf.col_as_values(&self.in_block, f).map(|c| c.to_f64_vec()))
            .collect::<Result<Vec<_>>>()?;
        self.built = 0;
        let builder = ctx.mf.get_df_builder(&self.out_block);
        for i1 in 0..self.features.len() {
            let (f1, s1) = (&self.features[i1], &columns[i1]);
            if s1.iter().any(|v| v.is_nan()) {
                return Err(PrepError::DataError(format!("Feature {} has missing values after imputation", f1)));
            }
            for i2 in (i1 + 1)..self.features.len() {
                let (f2, s2) = (&self.features[i2], &columns[i2]);
                if f1 == f2 {
                    continue;
                }
                let sum = s1.iter().zip(s2).map(|(a, b)| a + b).collect();
                let diff = s1.iter().zip(s2).map(|(a, b)| a - b).collect();
                builder.add_column(format!("{}+{}", f1, f2), &row_ids, ColumnValues::Numeric(sum))?;
                builder.add_column(format!("{}-{}", f1, f2), &row_ids, ColumnValues::Numeric(diff))?;
                self.built += 2;
            }
        }
        ctx.flush(&self.out_block)
    }

    fn report_fit(&self, report: &mut FitReport, _resources: &mut ResourceStore) -> Result<()> {
        report.insert(
            "pairwise_linear",
            json!({"input_features": self.features.len(), "built_features": self.built}),
        );
        Ok(())
    }
}

/// Degree-2, interaction-only polynomial expansion: the constant, each
/// feature, then every pairwise product.
pub struct AllInteractionFeaturesGenerator {
    in_block: String,
    out_block: String,
    features: Vec<String>,
    built: usize,
}

impl AllInteractionFeaturesGenerator {
    pub fn new(in_block: impl Into<String>, out_block: impl Into<String>, features: Vec<String>) -> Self {
        Self {
            in_block: in_block.into(),
            out_block: out_block.into(),
            features,
            built: 0,
        }
    }

    fn terms(&self) -> Vec<Vec<usize>> {
        let n = self.features.len();
        let mut terms = vec![Vec::new()];
        terms.extend((0..n).map(|i| vec![i]));
        for i in 0..n {
            for j in (i + 1)..n {
                terms.push(vec![i, j]);
            }
        }
        terms
    }
}

impl PreprocessingStep for AllInteractionFeaturesGenerator {
    fn name(&self) -> String {
        format!("AllInteractionFeaturesGenerator ({})", self.out_block)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let inputs = self
            .features
            .iter()
            .map(|f| ctx.mf.col_as_values(&self.in_block, f).map(|c| c.to_f64_vec()))
            .collect::<Result<Vec<_>>>()?;
        let height = ctx.mf.height();
        let terms = self.terms();
        let columns: Vec<(String, ColumnValues)> = terms
            .iter()
            .map(|term| {
                let factors: Vec<&str> = term.iter().map(|&i| self.features[i].as_str()).collect();
                let values = (0..height)
                    .map(|r| term.iter().map(|&i| inputs[i][r]).product::<f64>())
                    .collect();
                (format!("poly_int:{}", factors.join(" * ")), ColumnValues::Numeric(values))
            })
            .collect();
        self.built = columns.len();
        ctx.mf.append_columns(&self.out_block, columns, true)
    }

    fn report_fit(&self, report: &mut FitReport, _resources: &mut ResourceStore) -> Result<()> {
        report.insert(
            "polynomial_interactions",
            json!({"input_features": self.features.len(), "built_features": self.built}),
        );
        Ok(())
    }
}
