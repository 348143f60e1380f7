//! Parameter documents driving the collector and the pipeline handlers.
//!
//! These mirror the JSON documents produced by the modelling front end.
//! Unknown handling names are rejected at deserialization time, which is
//! where configuration errors surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PrepError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureRole {
    Input,
    Target,
    Weight,
    Profiling,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureType {
    Numeric,
    Category,
    Text,
    Vector,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissingHandling {
    None,
    Impute,
    DropRow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImputeWith {
    Mean,
    Median,
    Mode,
    Constant,
    CreateCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NumericalHandling {
    Regular,
    FlagPresence,
    Binarize,
    QuantileBin,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rescaling {
    #[default]
    None,
    Minmax,
    Avgstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CategoryHandling {
    Dummify,
    Impact,
    Hashing,
    FlagPresence,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DummyClip {
    #[default]
    MaxNbCategories,
    MinSamples,
    CumulativeProportion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DummyDrop {
    #[default]
    None,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdMode {
    Median,
    Mean,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TextHandling {
    TokenizeHashing,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VectorHandling {
    Unfold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageHandling {
    Custom,
}

/// Settings of one column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerFeatureParams {
    pub role: FeatureRole,
    #[serde(rename = "type")]
    pub feature_type: FeatureType,
    #[serde(default)]
    pub missing_handling: Option<MissingHandling>,
    #[serde(default)]
    pub missing_impute_with: Option<ImputeWith>,
    #[serde(default)]
    pub impute_constant_value: Option<Value>,

    #[serde(default)]
    pub numerical_handling: Option<NumericalHandling>,
    #[serde(default)]
    pub rescaling: Rescaling,
    #[serde(default)]
    pub generate_derivative: bool,
    #[serde(default)]
    pub binarize_threshold_mode: Option<ThresholdMode>,
    #[serde(default)]
    pub binarize_constant_threshold: Option<f64>,
    #[serde(default)]
    pub quantile_bin_nb_bins: Option<f64>,

    #[serde(default)]
    pub category_handling: Option<CategoryHandling>,
    #[serde(default)]
    pub dummy_clip: DummyClip,
    #[serde(default)]
    pub max_nb_categories: Option<usize>,
    #[serde(default)]
    pub min_samples: Option<usize>,
    #[serde(default)]
    pub max_cat_safety: Option<usize>,
    #[serde(default)]
    pub cumulative_proportion: Option<f64>,
    #[serde(default)]
    pub dummy_drop: DummyDrop,
    #[serde(default)]
    pub nb_bins_hashing: Option<usize>,
    #[serde(default)]
    pub hash_whole_categories: Option<bool>,

    #[serde(default)]
    pub text_handling: Option<TextHandling>,
    #[serde(default, rename = "hashSize")]
    pub hash_size: Option<usize>,

    #[serde(default)]
    pub vector_handling: Option<VectorHandling>,
    #[serde(default)]
    pub image_handling: Option<ImageHandling>,

    #[serde(default, rename = "customHandlingCode")]
    pub custom_handling_code: Option<String>,
    #[serde(default, rename = "customProcessorWantsMatrix")]
    pub custom_processor_wants_matrix: bool,
    #[serde(default, rename = "isSpecialFeature")]
    pub is_special_feature: bool,
    #[serde(default)]
    pub managed_folder_id: Option<String>,
}

impl PerFeatureParams {
    /// Minimal settings for a column; everything else takes its default.
    pub fn new(role: FeatureRole, feature_type: FeatureType) -> Self {
        Self {
            role,
            feature_type,
            missing_handling: None,
            missing_impute_with: None,
            impute_constant_value: None,
            numerical_handling: None,
            rescaling: Rescaling::None,
            generate_derivative: false,
            binarize_threshold_mode: None,
            binarize_constant_threshold: None,
            quantile_bin_nb_bins: None,
            category_handling: None,
            dummy_clip: DummyClip::MaxNbCategories,
            max_nb_categories: None,
            min_samples: None,
            max_cat_safety: None,
            cumulative_proportion: None,
            dummy_drop: DummyDrop::None,
            nb_bins_hashing: None,
            hash_whole_categories: None,
            text_handling: None,
            hash_size: None,
            vector_handling: None,
            image_handling: None,
            custom_handling_code: None,
            custom_processor_wants_matrix: false,
            is_special_feature: false,
            managed_folder_id: None,
        }
    }

    pub fn with_missing(mut self, handling: MissingHandling, impute_with: Option<ImputeWith>) -> Self {
        self.missing_handling = Some(handling);
        self.missing_impute_with = impute_with;
        self
    }

    pub fn with_numerical_handling(mut self, handling: NumericalHandling) -> Self {
        self.numerical_handling = Some(handling);
        self
    }

    pub fn with_category_handling(mut self, handling: CategoryHandling) -> Self {
        self.category_handling = Some(handling);
        self
    }

    pub fn with_rescaling(mut self, rescaling: Rescaling) -> Self {
        self.rescaling = rescaling;
        self
    }

    pub fn with_dummy_drop(mut self, drop: DummyDrop) -> Self {
        self.dummy_drop = drop;
        self
    }

    pub fn with_impute_constant(mut self, value: Value) -> Self {
        self.impute_constant_value = Some(value);
        self
    }

    pub fn with_custom_code(mut self, code: impl Into<String>, wants_matrix: bool) -> Self {
        self.custom_handling_code = Some(code.into());
        self.custom_processor_wants_matrix = wants_matrix;
        self
    }

    pub fn missing_handling_or(&self, default: MissingHandling) -> MissingHandling {
        self.missing_handling.unwrap_or(default)
    }

    pub(crate) fn custom_code(&self, column: &str) -> Result<&str> {
        self.custom_handling_code.as_deref().ok_or_else(|| {
            PrepError::ConfigError(format!("Column {} uses custom handling without code", column))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationBehavior {
    #[default]
    Disabled,
    EnabledManual,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationToggle {
    #[serde(default)]
    pub behavior: GenerationBehavior,
}

impl GenerationToggle {
    pub fn is_enabled(&self) -> bool {
        self.behavior == GenerationBehavior::EnabledManual
    }
}

/// A user-declared pairwise interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub column_1: String,
    pub column_2: String,
    #[serde(default)]
    pub rescale: bool,
    #[serde(default = "default_max_features")]
    pub max_features: usize,
}

fn default_max_features() -> usize {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualInteractions {
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureGeneration {
    #[serde(default)]
    pub pairwise_linear: GenerationToggle,
    #[serde(default)]
    pub polynomial_combinations: GenerationToggle,
    #[serde(default)]
    pub manual_interactions: ManualInteractions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceParams {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub kept_variance: f64,
}

impl Default for ReduceParams {
    fn default() -> Self {
        Self {
            enabled: false,
            kept_variance: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutlierMethod {
    #[default]
    None,
    Drop,
    Cluster,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutliersParams {
    #[serde(default)]
    pub method: OutlierMethod,
    #[serde(default = "default_min_n")]
    pub min_n: usize,
    #[serde(default = "default_min_cum_ratio")]
    pub min_cum_ratio: f64,
}

fn default_min_n() -> usize {
    2
}

fn default_min_cum_ratio() -> f64 {
    0.01
}

impl Default for OutliersParams {
    fn default() -> Self {
        Self {
            method: OutlierMethod::None,
            min_n: default_min_n(),
            min_cum_ratio: default_min_cum_ratio(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionMethod {
    #[default]
    None,
    Correlation,
    Pca,
    Lasso,
    RandomForest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationParams {
    pub n_features: usize,
    #[serde(default)]
    pub min_abs_correlation: f64,
    #[serde(default = "default_max_abs_correlation")]
    pub max_abs_correlation: f64,
}

fn default_max_abs_correlation() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaSelectionParams {
    pub n_features: usize,
    pub variance_proportion: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureSelectionParams {
    #[serde(default)]
    pub method: SelectionMethod,
    #[serde(default)]
    pub correlation_params: Option<CorrelationParams>,
    #[serde(default)]
    pub pca_params: Option<PcaSelectionParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRemapping {
    pub source_value: String,
    pub mapped_value: i64,
}

/// Preprocessing document: per-column settings plus global generation options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessingParams {
    pub per_feature: BTreeMap<String, PerFeatureParams>,
    #[serde(default)]
    pub feature_generation: FeatureGeneration,
    #[serde(default)]
    pub reduce: ReduceParams,
    #[serde(default)]
    pub outliers: OutliersParams,
    #[serde(default)]
    pub feature_selection_params: FeatureSelectionParams,
    #[serde(default)]
    pub target_remapping: Vec<TargetRemapping>,
    #[serde(default, rename = "preprocessingFitSampleSeed")]
    pub preprocessing_fit_sample_seed: Option<u64>,
}

impl PreprocessingParams {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn feature(&self, name: &str) -> Result<&PerFeatureParams> {
        self.per_feature
            .get(name)
            .ok_or_else(|| PrepError::ConfigError(format!("No preprocessing settings for column {}", name)))
    }

    pub fn with_feature(mut self, name: impl Into<String>, params: PerFeatureParams) -> Self {
        self.per_feature.insert(name.into(), params);
        self
    }

    pub fn with_target_remapping(mut self, classes: &[&str]) -> Self {
        self.target_remapping = classes
            .iter()
            .enumerate()
            .map(|(i, c)| TargetRemapping {
                source_value: c.to_string(),
                mapped_value: i as i64,
            })
            .collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictionType {
    BinaryClassification,
    Multiclass,
    Regression,
    Clustering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WeightMethod {
    #[default]
    NoWeighting,
    SampleWeight,
    ClassWeight,
    ClassAndSampleWeight,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightParams {
    #[serde(default)]
    pub weight_method: WeightMethod,
    #[serde(default)]
    pub sample_weight_variable: Option<String>,
}

/// Task-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreParams {
    pub prediction_type: PredictionType,
    #[serde(default)]
    pub target_variable: Option<String>,
    #[serde(default)]
    pub prediction_variable: Option<String>,
    #[serde(default)]
    pub proba_columns: Option<Vec<String>>,
    #[serde(default)]
    pub weight: WeightParams,
}

impl CoreParams {
    pub fn new(prediction_type: PredictionType) -> Self {
        Self {
            prediction_type,
            target_variable: None,
            prediction_variable: None,
            proba_columns: None,
            weight: WeightParams::default(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_variable = Some(target.into());
        self
    }

    pub fn with_sample_weight(mut self, column: impl Into<String>) -> Self {
        self.weight = WeightParams {
            weight_method: WeightMethod::SampleWeight,
            sample_weight_variable: Some(column.into()),
        };
        self
    }

    pub fn sample_weight_variable(&self) -> Option<&str> {
        self.weight.sample_weight_variable.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document() {
        let doc = r#"{
            "per_feature": {
                "age": {"role": "INPUT", "type": "NUMERIC", "missing_handling": "IMPUTE",
                        "missing_impute_with": "MEAN", "numerical_handling": "REGULAR", "rescaling": "AVGSTD"},
                "city": {"role": "INPUT", "type": "CATEGORY", "category_handling": "DUMMIFY",
                         "missing_handling": "NONE", "dummy_drop": "DROP"}
            },
            "feature_generation": {"pairwise_linear": {"behavior": "ENABLED_MANUAL"}},
            "target_remapping": [{"sourceValue": "no", "mappedValue": 0}]
        }"#;
        let params = PreprocessingParams::from_json(doc).unwrap();
        let age = params.feature("age").unwrap();
        assert_eq!(age.rescaling, Rescaling::Avgstd);
        assert_eq!(age.missing_impute_with, Some(ImputeWith::Mean));
        assert_eq!(params.feature("city").unwrap().dummy_drop, DummyDrop::Drop);
        assert!(params.feature_generation.pairwise_linear.is_enabled());
        assert!(!params.feature_generation.polynomial_combinations.is_enabled());
        assert_eq!(params.target_remapping[0].mapped_value, 0);
    }

    #[test]
    fn test_unknown_handling_rejected() {
        let doc = r#"{"per_feature": {"a": {"role": "INPUT", "type": "NUMERIC", "numerical_handling": "MAGIC"}}}"#;
        assert!(PreprocessingParams::from_json(doc).is_err());
    }

    #[test]
    fn test_core_params() {
        let core: CoreParams = serde_json::from_str(
            r#"{"prediction_type": "REGRESSION", "target_variable": "y",
                "weight": {"weightMethod": "SAMPLE_WEIGHT", "sampleWeightVariable": "w"}}"#,
        )
        .unwrap();
        assert_eq!(core.prediction_type, PredictionType::Regression);
        assert_eq!(core.sample_weight_variable(), Some("w"));
    }
}
