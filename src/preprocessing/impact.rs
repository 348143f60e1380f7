//! Impact coding: categorical levels replaced by their smoothed effect on
//! the target.
//!
//! A level seen `n` times gets `λ·level_stat + (1 − λ)·global_stat` with
//! `λ = n / (n + m)`, so rare levels fall back towards the global value.
//! Levels unseen at fit time get the global value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::collector::deterministic_value_counts;
use super::output::FitReport;
use super::resources::ResourceStore;
use super::step::{PreprocessingStep, StepContext};
use super::steps::{add_column_to_builder, source_column};
use crate::error::{PrepError, Result};
use crate::frame::{format_number, ColumnValues};

pub const DEFAULT_SMOOTHING: f64 = 10.0;
/// Label standing for a missing value, which is a level of its own.
pub const NULL_LEVEL: &str = "__NULL__";
const REPORTED_LEVELS: usize = 100;

/// How the target is rescaled before a continuous coder averages it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetRescaling {
    Standard,
    MinMax,
}

/// Fitted encodings of one column, one row of `encodings` per level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactTable {
    pub output_names: Vec<String>,
    pub levels: Vec<String>,
    pub counts: Vec<usize>,
    pub encodings: Vec<Vec<f64>>,
    pub defaults: Vec<f64>,
}

impl ImpactTable {
    pub fn encode(&self, label: Option<&str>) -> &[f64] {
        let label = label.unwrap_or(NULL_LEVEL);
        match self.levels.iter().position(|l| l == label) {
            Some(p) => &self.encodings[p],
            None => &self.defaults,
        }
    }

    /// One output column per encoded statistic.
    pub fn transform(&self, labels: &[Option<String>]) -> Vec<Vec<f64>> {
        let lookup: BTreeMap<&str, usize> =
            self.levels.iter().enumerate().map(|(i, l)| (l.as_str(), i)).collect();
        let mut columns = vec![Vec::with_capacity(labels.len()); self.output_names.len()];
        for label in labels {
            let key = label.as_deref().unwrap_or(NULL_LEVEL);
            let row = lookup.get(key).map(|p| &self.encodings[*p]).unwrap_or(&self.defaults);
            for (col, v) in columns.iter_mut().zip(row) {
                col.push(*v);
            }
        }
        columns
    }
}

fn smoothing_weight(count: usize, m: f64) -> f64 {
    count as f64 / (count as f64 + m)
}

/// Which statistic of the target a level is coded with.
#[derive(Debug, Clone, PartialEq)]
pub enum ImpactCoder {
    /// Smoothed frequency of each target class but the last one seen.
    Categorical { m: f64 },
    /// Smoothed mean of the target.
    Continuous { m: f64, rescaling: Option<TargetRescaling> },
}

impl ImpactCoder {
    pub fn categorical() -> Self {
        ImpactCoder::Categorical { m: DEFAULT_SMOOTHING }
    }

    pub fn continuous(rescaling: Option<TargetRescaling>) -> Self {
        ImpactCoder::Continuous { m: DEFAULT_SMOOTHING, rescaling }
    }

    pub fn fit(&self, labels: &[Option<String>], target: &[f64]) -> Result<ImpactTable> {
        if labels.len() != target.len() {
            return Err(PrepError::ShapeError {
                expected: format!("{} target values", labels.len()),
                actual: format!("{} target values", target.len()),
            });
        }
        if labels.is_empty() {
            return Err(PrepError::DataError("Cannot impact code an empty column".to_string()));
        }
        let labels: Vec<String> = labels
            .iter()
            .map(|l| l.clone().unwrap_or_else(|| NULL_LEVEL.to_string()))
            .collect();
        let counts = deterministic_value_counts(
            &labels.iter().cloned().map(Some).collect::<Vec<_>>(),
            true,
        );
        match self {
            ImpactCoder::Categorical { m } => Ok(categorical_table(&labels, target, counts, *m)),
            ImpactCoder::Continuous { m, rescaling } => {
                let target = rescale_target(target, *rescaling);
                Ok(continuous_table(&labels, &target, counts, *m))
            }
        }
    }
}

fn rescale_target(target: &[f64], rescaling: Option<TargetRescaling>) -> Vec<f64> {
    let n = target.len() as f64;
    match rescaling {
        Some(TargetRescaling::Standard) if target.len() > 1 => {
            let mean = target.iter().sum::<f64>() / n;
            let std = (target.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
            if std == 0.0 {
                return target.to_vec();
            }
            target.iter().map(|t| (t - mean) / std).collect()
        }
        Some(TargetRescaling::MinMax) => {
            let min = target.iter().copied().fold(f64::INFINITY, f64::min);
            let max = target.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if min == max {
                return target.to_vec();
            }
            target.iter().map(|t| (t - min) / (max - min)).collect()
        }
        _ => target.to_vec(),
    }
}

fn categorical_table(labels: &[String], target: &[f64], counts: Vec<(String, usize)>, m: f64) -> ImpactTable {
    let mut classes: Vec<f64> = Vec::new();
    for t in target {
        if !classes.contains(t) {
            classes.push(*t);
        }
    }
    // The last class is implied by the others.
    classes.pop();

    let n = target.len() as f64;
    let mut table = ImpactTable {
        output_names: classes.iter().map(|c| format!("impact:{}", format_number(*c))).collect(),
        ..Default::default()
    };
    let ratios: Vec<f64> = classes
        .iter()
        .map(|c| target.iter().filter(|t| *t == c).count() as f64 / n)
        .collect();

    let mut positives: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (label, t) in labels.iter().zip(target) {
        let entry = positives.entry(label.as_str()).or_insert_with(|| vec![0; classes.len()]);
        if let Some(k) = classes.iter().position(|c| c == t) {
            entry[k] += 1;
        }
    }

    for (level, count) in counts {
        let lambda = smoothing_weight(count, m);
        let row = positives
            .get(level.as_str())
            .map(|pos| {
                pos.iter()
                    .zip(&ratios)
                    .map(|(p, r)| lambda * (*p as f64 / count as f64) + (1.0 - lambda) * r)
                    .collect()
            })
            .unwrap_or_else(|| ratios.clone());
        table.levels.push(level);
        table.counts.push(count);
        table.encodings.push(row);
    }
    table.defaults = ratios;
    table
}

fn continuous_table(labels: &[String], target: &[f64], counts: Vec<(String, usize)>, m: f64) -> ImpactTable {
    let global_mean = target.iter().sum::<f64>() / target.len() as f64;
    let mut sums: BTreeMap<&str, f64> = BTreeMap::new();
    for (label, t) in labels.iter().zip(target) {
        *sums.entry(label.as_str()).or_insert(0.0) += t;
    }
    let mut table = ImpactTable {
        output_names: vec!["impact".to_string()],
        defaults: vec![global_mean],
        ..Default::default()
    };
    for (level, count) in counts {
        let lambda = smoothing_weight(count, m);
        let level_mean = sums.get(level.as_str()).copied().unwrap_or(0.0) / count as f64;
        table.encodings.push(vec![lambda * level_mean + (1.0 - lambda) * global_mean]);
        table.levels.push(level);
        table.counts.push(count);
    }
    table
}

/// Impact codes one column against the target side channel.
pub struct ImpactCodingStep {
    input_block: Option<String>,
    column: String,
    coder: ImpactCoder,
    output_block: String,
    table: Option<ImpactTable>,
}

impl ImpactCodingStep {
    pub fn new(
        input_block: Option<String>,
        column: impl Into<String>,
        coder: ImpactCoder,
        output_block: impl Into<String>,
    ) -> Self {
        Self {
            input_block,
            column: column.into(),
            coder,
            output_block: output_block.into(),
            table: None,
        }
    }
}

impl PreprocessingStep for ImpactCodingStep {
    fn name(&self) -> String {
        format!("ImpactCodingStep ({})", self.column)
    }

    fn init_resources(&mut self, resources: &mut ResourceStore) -> Result<()> {
        self.table = resources.impact_coded()?.get(&self.column).cloned();
        Ok(())
    }

    fn fit_and_process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let labels = source_column(ctx, self.input_block.as_deref(), &self.column)?.to_text_vec();
        let target = ctx
            .output
            .target
            .as_ref()
            .ok_or_else(|| PrepError::DataError(format!("Impact coding {} needs a target", self.column)))?
            .realign(&ctx.row_ids())?
            .to_f64_vec();
        // Rows without a target are dropped later on, they must not weigh on the fit.
        let (labels, target): (Vec<_>, Vec<_>) =
            labels.into_iter().zip(target).filter(|(_, t)| !t.is_nan()).unzip();
        let table = self.coder.fit(&labels, &target)?;
        debug!(column = %self.column, levels = table.levels.len(), "Impact coder fitted");
        ctx.resources.impact_coded()?.insert(self.column.clone(), table.clone());
        self.table = Some(table);
        self.process(ctx)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| PrepError::not_fitted("impact_coded", &self.column))?;
        let labels = source_column(ctx, self.input_block.as_deref(), &self.column)?.to_text_vec();
        let row_ids = ctx.row_ids();
        let columns = table.transform(&labels);
        let names = table.output_names.clone();
        for (name, values) in names.iter().zip(columns) {
            add_column_to_builder(
                ctx,
                &self.output_block,
                name,
                &self.column,
                &row_ids,
                ColumnValues::Numeric(values),
            )?;
        }
        ctx.flush(&self.output_block)
    }

    fn report_fit(&self, report: &mut FitReport, _resources: &mut ResourceStore) -> Result<()> {
        let Some(table) = &self.table else {
            return Ok(());
        };
        // Only single-statistic tables are reported.
        if table.output_names.len() != 1 {
            return Ok(());
        }
        let n = table.levels.len().min(REPORTED_LEVELS);
        report.insert_in(
            "impact",
            &self.column,
            json!({
                "values": &table.levels[..n],
                "counts": &table.counts[..n],
                "impacts": table.encodings[..n].iter().map(|e| e[0]).collect::<Vec<_>>(),
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::InputFrame;
    use crate::preprocessing::output::SideSeries;
    use crate::preprocessing::steps::testing::Harness;

    fn labels(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }

    #[test]
    fn test_continuous_smoothing() {
        let l = labels(&[Some("a"), Some("a"), Some("b"), None]);
        let table = ImpactCoder::continuous(None).fit(&l, &[10.0, 20.0, 0.0, 2.0]).unwrap();
        assert_eq!(table.output_names, vec!["impact"]);
        assert_eq!(table.defaults, vec![8.0]);
        // a: λ = 2/12, mean 15
        let a = table.encode(Some("a"))[0];
        assert!((a - (2.0 / 12.0 * 15.0 + 10.0 / 12.0 * 8.0)).abs() < 1e-12);
        let null = table.encode(None)[0];
        assert!((null - (1.0 / 11.0 * 2.0 + 10.0 / 11.0 * 8.0)).abs() < 1e-12);
        assert_eq!(table.encode(Some("unseen")), &[8.0]);
    }

    #[test]
    fn test_categorical_drops_last_class() {
        let l = labels(&[Some("x"), Some("y"), Some("x"), Some("y")]);
        let table = ImpactCoder::categorical().fit(&l, &[0.0, 1.0, 2.0, 0.0]).unwrap();
        assert_eq!(table.output_names, vec!["impact:0", "impact:1"]);
        assert_eq!(table.defaults, vec![0.5, 0.25]);
        let x = table.encode(Some("x"));
        let lambda = 2.0 / 12.0;
        assert!((x[0] - (lambda * 0.5 + (1.0 - lambda) * 0.5)).abs() < 1e-12);
        assert!((x[1] - (1.0 - lambda) * 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_minmax_rescaling() {
        let l = labels(&[Some("a"), Some("b")]);
        let table = ImpactCoder::continuous(Some(TargetRescaling::MinMax)).fit(&l, &[5.0, 15.0]).unwrap();
        assert_eq!(table.defaults, vec![0.5]);
    }

    #[test]
    fn test_step_fit_and_replay() {
        let input = InputFrame::new(vec![(
            "city".into(),
            ColumnValues::Text(vec![Some("Paris".into()), Some("Lyon".into()), Some("Paris".into())]),
        )])
        .unwrap();
        let mut h = Harness::new(input);
        h.output.target = Some(SideSeries::new(vec![0, 1, 2], ColumnValues::Numeric(vec![1.0, 0.0, 1.0])).unwrap());
        let mut step = ImpactCodingStep::new(None, "city", ImpactCoder::categorical(), "impact:city");
        h.run(&mut step).unwrap();
        assert_eq!(h.mf.columns(), vec!["impact:city:impact:1"]);
        assert_eq!(h.mapping.per_column_original("impact:city", "impact:city:impact:1"), "city");

        let mut report = FitReport::default();
        step.report_fit(&mut report, &mut h.resources).unwrap();
        assert_eq!(report.get("impact").unwrap()["city"]["values"], json!(["Paris", "Lyon"]));

        let replay = InputFrame::new(vec![("city".into(), ColumnValues::Text(vec![Some("Nice".into())]))]).unwrap();
        h.replay_on(replay);
        let mut fresh = ImpactCodingStep::new(None, "city", ImpactCoder::categorical(), "impact:city");
        h.replay(&mut fresh).unwrap();
        let out = h.mf.col_as_values("impact:city", "impact:city:impact:1").unwrap();
        assert_eq!(out.to_f64_vec(), vec![2.0 / 3.0]);
    }
}
