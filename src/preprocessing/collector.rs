//! Feature analysis over the training frame.
//!
//! The collector computes every statistic the pipeline steps need (impute
//! values, rescaling moments, category vocabularies, vector lengths) so that
//! steps never compute statistics themselves. Its output is persisted as
//! `collector_data.json` and reloaded verbatim when replaying.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::params::{DummyClip, DummyDrop, FeatureRole, FeatureType, ImputeWith, MissingHandling, PerFeatureParams, PreprocessingParams};
use crate::error::{PrepError, Result};
use crate::frame::{format_number, ColumnValues, InputFrame};

/// Category label used for missing values when imputing with a new category.
pub const NULL_CATEGORY: &str = "NULL_Value";
/// Label of the missing-value level in category statistics.
pub const NA_LABEL: &str = "N/A";

/// Which roles get analysed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorMode {
    Prediction,
    Clustering,
}

impl CollectorMode {
    fn needs_analysis(&self, params: &PerFeatureParams) -> bool {
        match self {
            CollectorMode::Prediction => matches!(params.role, FeatureRole::Input | FeatureRole::Weight),
            CollectorMode::Clustering => matches!(params.role, FeatureRole::Input | FeatureRole::Profiling),
        }
    }
}

/// Resolved imputation value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImputeValue {
    Number(f64),
    Text(String),
}

impl ImputeValue {
    pub fn as_text(&self) -> String {
        match self {
            ImputeValue::Number(v) => format_number(*v),
            ImputeValue::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub median: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std: Option<f64>,
    #[serde(default, rename = "mostFrequentValue", skip_serializing_if = "Option::is_none")]
    pub most_frequent_value: Option<String>,
    #[serde(default, rename = "leastFrequentValue", skip_serializing_if = "Option::is_none")]
    pub least_frequent_value: Option<String>,
}

/// Analysis of a single column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureAnalysis {
    pub stats: FeatureStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_impute_with_value: Option<ImputeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_possible_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_possible_counts: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropped_modality: Option<String>,
    /// Training rows had missing values after imputation.
    #[serde(default)]
    pub category_has_missing: bool,
    /// The vocabulary lost levels to clipping.
    #[serde(default)]
    pub category_clipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_length: Option<usize>,
    #[serde(default)]
    pub is_vector: bool,
}

impl FeatureAnalysis {
    pub fn stat(&self, name: &str, value: Option<f64>) -> Result<f64> {
        value.ok_or_else(|| PrepError::DataError(format!("Missing statistic {} for an empty column", name)))
    }

    pub fn impute_number(&self, column: &str) -> Result<f64> {
        match &self.missing_impute_with_value {
            Some(ImputeValue::Number(v)) => Ok(*v),
            Some(ImputeValue::Text(s)) => s.trim().parse::<f64>().map_err(|_| {
                PrepError::ConfigError(format!("Impute value {} of column {} is not numeric", s, column))
            }),
            None => Err(PrepError::ConfigError(format!(
                "Column {} is imputed but has no imputation value",
                column
            ))),
        }
    }

    pub fn impute_text(&self, column: &str) -> Result<String> {
        self.missing_impute_with_value
            .as_ref()
            .map(|v| v.as_text())
            .ok_or_else(|| PrepError::ConfigError(format!("Column {} is imputed but has no imputation value", column)))
    }

    pub fn possible_values(&self) -> &[String] {
        self.category_possible_values.as_deref().unwrap_or(&[])
    }
}

/// Collector output: a fixed feature order plus per-column analyses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorData {
    pub feature_order: Vec<String>,
    pub per_feature: BTreeMap<String, FeatureAnalysis>,
}

impl CollectorData {
    pub fn feature(&self, name: &str) -> Result<&FeatureAnalysis> {
        self.per_feature
            .get(name)
            .ok_or_else(|| PrepError::ColumnNotFound(format!("{} (no feature analysis)", name)))
    }
}

/// Computes [`CollectorData`] from a training frame.
pub struct PreprocessingDataCollector<'a> {
    frame: &'a InputFrame,
    params: &'a PreprocessingParams,
    mode: CollectorMode,
}

impl<'a> PreprocessingDataCollector<'a> {
    pub fn new(frame: &'a InputFrame, params: &'a PreprocessingParams, mode: CollectorMode) -> Self {
        Self { frame, params, mode }
    }

    pub fn build(&self) -> Result<CollectorData> {
        let mut data = CollectorData::default();
        for (name, params) in &self.params.per_feature {
            data.feature_order.push(name.clone());
            if let Some(column) = self.frame.get_column(name) {
                let analysis = self.analyse(name, params, column)?;
                data.per_feature.insert(name.clone(), analysis);
            }
        }
        Ok(data)
    }

    fn analyse(&self, name: &str, params: &PerFeatureParams, column: &ColumnValues) -> Result<FeatureAnalysis> {
        info!(feature = name, kind = ?params.feature_type, "Analysing feature");
        let mut out = FeatureAnalysis::default();
        if !self.mode.needs_analysis(params) {
            return Ok(out);
        }
        let impute = params.missing_handling == Some(MissingHandling::Impute);

        match params.feature_type {
            FeatureType::Numeric => {
                let values = column.to_f64_vec();
                if values.iter().any(|v| v.is_infinite()) {
                    return Err(PrepError::DataError(format!(
                        "Numeric feature '{}' contains Infinity values",
                        name
                    )));
                }
                out.stats = numeric_stats(&values);
                if impute {
                    if out.stats.min.is_none() {
                        return Err(PrepError::DataError(format!("Numeric feature {} is empty", name)));
                    }
                    out.missing_impute_with_value = match params.missing_impute_with {
                        Some(ImputeWith::Mean) => out.stats.average.map(ImputeValue::Number),
                        Some(ImputeWith::Median) => out.stats.median.map(ImputeValue::Number),
                        Some(ImputeWith::Constant) => Some(ImputeValue::Number(constant_number(name, params)?)),
                        other => {
                            return Err(PrepError::ConfigError(format!(
                                "Imputation method {:?} is not valid for numeric feature {}",
                                other, name
                            )))
                        }
                    };
                }
            }
            FeatureType::Category => {
                let labels = column.to_text_vec();
                let counts = deterministic_value_counts(&labels, true);
                let (most, least) = match (counts.first(), counts.last()) {
                    (Some(first), Some(last)) => (first.0.clone(), last.0.clone()),
                    _ => (NULL_CATEGORY.to_string(), NULL_CATEGORY.to_string()),
                };
                out.stats.most_frequent_value = Some(most.clone());
                out.stats.least_frequent_value = Some(least);

                let mut labels = labels;
                if impute {
                    match params.missing_impute_with {
                        Some(ImputeWith::Mode) => out.missing_impute_with_value = Some(ImputeValue::Text(most)),
                        Some(ImputeWith::Constant) => {
                            out.missing_impute_with_value = Some(ImputeValue::Text(constant_text(name, params)?))
                        }
                        Some(ImputeWith::CreateCategory) => {
                            out.missing_impute_with_value = Some(ImputeValue::Text(NULL_CATEGORY.to_string()));
                            for l in labels.iter_mut().filter(|l| l.is_none()) {
                                *l = Some(NULL_CATEGORY.to_string());
                            }
                        }
                        _ => return Err(PrepError::ConfigError("Unknown imputation method".to_string())),
                    }
                }
                self.clip_categories(name, params, &labels, &mut out)?;
            }
            FeatureType::Text => {
                out.missing_impute_with_value = Some(ImputeValue::Text(String::new()));
            }
            FeatureType::Vector => {
                out.is_vector = true;
                let first = column.to_text_vec().into_iter().flatten().next().ok_or_else(|| {
                    PrepError::DataError(format!("Invalid vector data in column '{}': no value", name))
                })?;
                let parsed: Value = serde_json::from_str(&first)
                    .map_err(|e| PrepError::DataError(format!("Invalid vector data in column '{}': {}", name, e)))?;
                let length = parsed
                    .as_array()
                    .map(|a| a.len())
                    .ok_or_else(|| PrepError::DataError(format!("Invalid vector data in column '{}': not an array", name)))?;
                out.vector_length = Some(length);

                if impute {
                    match params.missing_impute_with {
                        Some(ImputeWith::Mode) => {
                            let counts = deterministic_value_counts(&column.to_text_vec(), true);
                            out.missing_impute_with_value = counts.first().map(|(v, _)| ImputeValue::Text(v.clone()));
                        }
                        Some(ImputeWith::Constant) => {
                            let constant = constant_text(name, params)?;
                            let cells = vec![constant; length];
                            out.missing_impute_with_value = Some(ImputeValue::Text(format!("[{}]", cells.join(","))));
                        }
                        _ => {}
                    }
                }
            }
            FeatureType::Image => {}
        }
        Ok(out)
    }

    fn clip_categories(
        &self,
        name: &str,
        params: &PerFeatureParams,
        labels: &[Option<String>],
        out: &mut FeatureAnalysis,
    ) -> Result<()> {
        let stats = deterministic_value_counts_with_na(labels);
        let distinct = stats.len();
        let safety = || {
            params.max_cat_safety.ok_or_else(|| {
                PrepError::ConfigError(format!("Column {} needs max_cat_safety for category clipping", name))
            })
        };

        let mut candidates: Vec<(Option<String>, usize)> = match params.dummy_clip {
            DummyClip::MaxNbCategories => {
                let to_take = params.max_nb_categories.unwrap_or(50);
                stats.iter().take(to_take + 1).cloned().collect()
            }
            DummyClip::MinSamples => {
                let min_samples = params.min_samples.ok_or_else(|| {
                    PrepError::ConfigError(format!("Column {} needs min_samples for category clipping", name))
                })?;
                stats.iter().take(safety()?).filter(|(_, c)| *c >= min_samples).cloned().collect()
            }
            DummyClip::CumulativeProportion => {
                let proportion = params.cumulative_proportion.ok_or_else(|| {
                    PrepError::ConfigError(format!("Column {} needs cumulative_proportion for category clipping", name))
                })?;
                let limit = (proportion * labels.len() as f64) as usize;
                let mut running = 0;
                stats
                    .iter()
                    .take(safety()?)
                    .filter(|(_, c)| {
                        running += c;
                        running <= limit
                    })
                    .cloned()
                    .collect()
            }
        };

        if candidates.len() == distinct && params.dummy_drop == DummyDrop::Drop {
            if let Some((dropped, _)) = candidates.pop() {
                out.dropped_modality = Some(dropped.unwrap_or_else(|| NA_LABEL.to_string()));
            }
        }

        out.category_has_missing = stats.iter().any(|(v, _)| v.is_none());
        let kept_non_null = candidates.iter().filter(|(v, _)| v.is_some()).count()
            + usize::from(out.dropped_modality.is_some() && out.dropped_modality.as_deref() != Some(NA_LABEL));
        out.category_clipped = kept_non_null < stats.iter().filter(|(v, _)| v.is_some()).count();

        let candidates: Vec<(String, usize)> = candidates
            .into_iter()
            .filter_map(|(v, c)| v.map(|v| (v, c)))
            .collect();
        out.category_possible_values = Some(candidates.iter().map(|(v, _)| v.clone()).collect());
        out.category_possible_counts = Some(candidates.iter().map(|(_, c)| *c).collect());
        Ok(())
    }
}

fn constant_number(name: &str, params: &PerFeatureParams) -> Result<f64> {
    match &params.impute_constant_value {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| PrepError::ConfigError(format!("Invalid impute constant for {}", name))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| PrepError::ConfigError(format!("Impute constant {} for {} is not numeric", s, name))),
        _ => Err(PrepError::ConfigError(format!(
            "Column {} imputes a constant but impute_constant_value is missing",
            name
        ))),
    }
}

fn constant_text(name: &str, params: &PerFeatureParams) -> Result<String> {
    match &params.impute_constant_value {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.as_f64().map(format_number).unwrap_or_else(|| n.to_string())),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        _ => Err(PrepError::ConfigError(format!(
            "Column {} imputes a constant but impute_constant_value is missing",
            name
        ))),
    }
}

/// Linear-interpolated quantile of sorted values.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Moments of the non-missing values. The std is the sample std.
pub fn numeric_stats(values: &[f64]) -> FeatureStats {
    let mut present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if present.is_empty() {
        return FeatureStats::default();
    }
    present.sort_by(|a, b| a.total_cmp(b));
    let n = present.len() as f64;
    let mean = present.iter().sum::<f64>() / n;
    let std = if present.len() > 1 {
        (present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        f64::NAN
    };
    FeatureStats {
        min: present.first().copied(),
        average: Some(mean),
        median: Some(quantile_sorted(&present, 0.5)),
        max: present.last().copied(),
        p99: Some(quantile_sorted(&present, 0.99)),
        std: if std.is_nan() { None } else { Some(std) },
        ..Default::default()
    }
}

fn count_labels(labels: &[Option<String>]) -> Vec<(Option<String>, usize)> {
    let mut counts: HashMap<Option<&str>, usize> = HashMap::new();
    for l in labels {
        *counts.entry(l.as_deref()).or_insert(0) += 1;
    }
    let mut out: Vec<(Option<String>, usize)> =
        counts.into_iter().map(|(k, v)| (k.map(|s| s.to_string()), v)).collect();
    // count descending, then label descending with missing last among ties
    out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    out
}

/// Value counts of the present labels in a deterministic order.
pub fn deterministic_value_counts(labels: &[Option<String>], dropna: bool) -> Vec<(String, usize)> {
    count_labels(labels)
        .into_iter()
        .filter(|(v, _)| !dropna || v.is_some())
        .map(|(v, c)| (v.unwrap_or_else(|| NA_LABEL.to_string()), c))
        .collect()
}

fn deterministic_value_counts_with_na(labels: &[Option<String>]) -> Vec<(Option<String>, usize)> {
    count_labels(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessing::params::{CategoryHandling, NumericalHandling};

    fn frame() -> InputFrame {
        InputFrame::new(vec![
            ("num".into(), ColumnValues::Numeric(vec![1.0, 2.0, f64::NAN, 5.0])),
            (
                "cat".into(),
                ColumnValues::Text(vec![Some("a".into()), Some("b".into()), Some("a".into()), None]),
            ),
            ("vec".into(), ColumnValues::Text(vec![None, Some("[1,2,3]".into()), None, None])),
        ])
        .unwrap()
    }

    fn params() -> PreprocessingParams {
        PreprocessingParams::default()
            .with_feature(
                "num",
                PerFeatureParams::new(FeatureRole::Input, FeatureType::Numeric)
                    .with_numerical_handling(NumericalHandling::Regular)
                    .with_missing(MissingHandling::Impute, Some(ImputeWith::Median)),
            )
            .with_feature(
                "cat",
                PerFeatureParams::new(FeatureRole::Input, FeatureType::Category)
                    .with_category_handling(CategoryHandling::Dummify)
                    .with_missing(MissingHandling::Impute, Some(ImputeWith::Mode)),
            )
            .with_feature("vec", PerFeatureParams::new(FeatureRole::Input, FeatureType::Vector))
            .with_feature("absent", PerFeatureParams::new(FeatureRole::Input, FeatureType::Numeric))
    }

    #[test]
    fn test_numeric_stats() {
        let frame = frame();
        let params = params();
        let data = PreprocessingDataCollector::new(&frame, &params, CollectorMode::Prediction)
            .build()
            .unwrap();
        let num = data.feature("num").unwrap();
        assert_eq!(num.stats.min, Some(1.0));
        assert_eq!(num.stats.max, Some(5.0));
        assert_eq!(num.stats.median, Some(2.0));
        assert!((num.stats.average.unwrap() - 8.0 / 3.0).abs() < 1e-12);
        assert_eq!(num.missing_impute_with_value, Some(ImputeValue::Number(2.0)));
    }

    #[test]
    fn test_feature_order_lists_every_declared_column() {
        let frame = frame();
        let params = params();
        let data = PreprocessingDataCollector::new(&frame, &params, CollectorMode::Prediction)
            .build()
            .unwrap();
        assert_eq!(data.feature_order, vec!["absent", "cat", "num", "vec"]);
        assert!(!data.per_feature.contains_key("absent"));
    }

    #[test]
    fn test_category_vocabulary() {
        let frame = frame();
        let params = params();
        let data = PreprocessingDataCollector::new(&frame, &params, CollectorMode::Prediction)
            .build()
            .unwrap();
        let cat = data.feature("cat").unwrap();
        assert_eq!(cat.stats.most_frequent_value.as_deref(), Some("a"));
        assert_eq!(cat.possible_values(), &["a".to_string(), "b".to_string()]);
        assert!(cat.category_has_missing);
        assert!(!cat.category_clipped);
        assert_eq!(cat.impute_text("cat").unwrap(), "a");
    }

    #[test]
    fn test_dropped_modality() {
        let frame = frame();
        let mut params = params();
        if let Some(p) = params.per_feature.get_mut("cat") {
            p.missing_handling = Some(MissingHandling::None);
            p.dummy_drop = DummyDrop::Drop;
        }
        let data = PreprocessingDataCollector::new(&frame, &params, CollectorMode::Prediction)
            .build()
            .unwrap();
        let cat = data.feature("cat").unwrap();
        // counts a:2, b:1, missing:1 -> missing sorts last and is the dropped level
        assert_eq!(cat.dropped_modality.as_deref(), Some(NA_LABEL));
        assert_eq!(cat.possible_values(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_max_nb_categories_clips() {
        let labels: Vec<Option<String>> = ["x", "x", "y", "z", "w"].iter().map(|s| Some(s.to_string())).collect();
        let frame = InputFrame::new(vec![("c".into(), ColumnValues::Text(labels))]).unwrap();
        let mut p = PerFeatureParams::new(FeatureRole::Input, FeatureType::Category)
            .with_category_handling(CategoryHandling::Dummify);
        p.max_nb_categories = Some(1);
        let params = PreprocessingParams::default().with_feature("c", p);
        let data = PreprocessingDataCollector::new(&frame, &params, CollectorMode::Prediction)
            .build()
            .unwrap();
        let c = data.feature("c").unwrap();
        assert_eq!(c.possible_values().len(), 2);
        assert_eq!(c.possible_values()[0], "x");
        assert!(c.category_clipped);
    }

    #[test]
    fn test_infinity_rejected() {
        let frame = InputFrame::new(vec![("n".into(), ColumnValues::Numeric(vec![1.0, f64::INFINITY]))]).unwrap();
        let params = PreprocessingParams::default()
            .with_feature("n", PerFeatureParams::new(FeatureRole::Input, FeatureType::Numeric));
        let err = PreprocessingDataCollector::new(&frame, &params, CollectorMode::Prediction)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("'n' contains Infinity"));
    }

    #[test]
    fn test_empty_numeric_impute_fails() {
        let frame = InputFrame::new(vec![("n".into(), ColumnValues::Numeric(vec![f64::NAN, f64::NAN]))]).unwrap();
        let params = PreprocessingParams::default().with_feature(
            "n",
            PerFeatureParams::new(FeatureRole::Input, FeatureType::Numeric)
                .with_missing(MissingHandling::Impute, Some(ImputeWith::Mean)),
        );
        let err = PreprocessingDataCollector::new(&frame, &params, CollectorMode::Prediction)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Numeric feature n is empty"));
    }

    #[test]
    fn test_vector_length_and_constant_impute() {
        let frame = frame();
        let mut params = params();
        if let Some(p) = params.per_feature.get_mut("vec") {
            p.missing_handling = Some(MissingHandling::Impute);
            p.missing_impute_with = Some(ImputeWith::Constant);
            p.impute_constant_value = Some(Value::String("0".into()));
        }
        let data = PreprocessingDataCollector::new(&frame, &params, CollectorMode::Prediction)
            .build()
            .unwrap();
        let v = data.feature("vec").unwrap();
        assert_eq!(v.vector_length, Some(3));
        assert_eq!(v.impute_text("vec").unwrap(), "[0,0,0]");
    }

    #[test]
    fn test_profiling_only_in_clustering() {
        let frame = frame();
        let params = PreprocessingParams::default()
            .with_feature("num", PerFeatureParams::new(FeatureRole::Profiling, FeatureType::Numeric));
        let pred = PreprocessingDataCollector::new(&frame, &params, CollectorMode::Prediction)
            .build()
            .unwrap();
        assert_eq!(pred.feature("num").unwrap().stats.min, None);
        let clus = PreprocessingDataCollector::new(&frame, &params, CollectorMode::Clustering)
            .build()
            .unwrap();
        assert_eq!(clus.feature("num").unwrap().stats.min, Some(1.0));
    }

    #[test]
    fn test_quantile() {
        assert_eq!(quantile_sorted(&[1.0, 2.0, 3.0, 4.0], 0.5), 2.5);
        assert_eq!(quantile_sorted(&[1.0], 0.99), 1.0);
    }
}
