//! Builds the step sequence of a preprocessing pipeline from the settings
//! documents and the collector output, and persists what a fit produced.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::collector::{CollectorData, FeatureAnalysis, ImputeValue, NA_LABEL};
use super::custom::{CustomCodeRegistry, CustomPreprocessingStep, FileFunctionPreprocessing};
use super::impact::{ImpactCoder, ImpactCodingStep, TargetRescaling};
use super::output::{FitReport, MlAssertionParams, SpecialOutput};
use super::params::{
    CategoryHandling, CoreParams, DummyDrop, FeatureRole, FeatureType, ImageHandling, MissingHandling,
    NumericalHandling, OutlierMethod, PerFeatureParams, PredictionType, PreprocessingParams, Rescaling,
    SelectionMethod, TextHandling, ThresholdMode, VectorHandling,
};
use super::pipeline::PreprocessingPipeline;
use super::resources::ResourceStore;
use super::step::PreprocessingStep;
use super::steps::*;
use crate::error::{PrepError, Result};

pub const COLLECTOR_DATA_FILE: &str = "collector_data.json";
pub const REPORT_FILE: &str = "preprocessing_report.json";

const NUM_IMPUTED: &str = "NUM_IMPUTED";
const CAT_IMPUTED: &str = "CAT_IMPUTED";
const VECTOR_IMPUTED: &str = "VECTOR_IMPUTED";
/// Placeholder category of missing values kept as a level of their own.
const NA_PLACEHOLDER: &str = "_NA_";
const DEFAULT_SEED: u64 = 1337;

type Steps = Vec<Box<dyn PreprocessingStep>>;

/// Which side channels a pipeline extracts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    pub with_target: bool,
    pub with_prediction: bool,
    pub allow_empty_mf: bool,
}

impl PipelineOptions {
    /// Supervised fit: the target (and sample weight) go to side channels.
    pub fn training() -> Self {
        Self {
            with_target: true,
            ..Self::default()
        }
    }

    /// Scoring: no target is expected.
    pub fn scoring() -> Self {
        Self::default()
    }

    pub fn with_prediction(mut self, with_prediction: bool) -> Self {
        self.with_prediction = with_prediction;
        self
    }

    pub fn with_allow_empty_mf(mut self, allow_empty_mf: bool) -> Self {
        self.allow_empty_mf = allow_empty_mf;
        self
    }
}

/// Turns settings into steps, for one prediction type.
#[derive(Debug)]
pub struct PreprocessingHandler {
    core_params: CoreParams,
    params: PreprocessingParams,
    collector: CollectorData,
    data_path: Option<PathBuf>,
    registry: CustomCodeRegistry,
    assertions: Option<Vec<MlAssertionParams>>,
}

impl PreprocessingHandler {
    /// Validates the target remapping against the prediction type.
    pub fn build(
        core_params: CoreParams,
        params: PreprocessingParams,
        collector: CollectorData,
        data_path: Option<PathBuf>,
        registry: CustomCodeRegistry,
    ) -> Result<Self> {
        let handler = Self {
            core_params,
            params,
            collector,
            data_path,
            registry,
            assertions: None,
        };
        handler.target_map()?;
        Ok(handler)
    }

    /// Rebuild a handler from a model folder written by [`save_data`](Self::save_data).
    pub fn load(
        core_params: CoreParams,
        params: PreprocessingParams,
        data_path: impl Into<PathBuf>,
        registry: CustomCodeRegistry,
    ) -> Result<Self> {
        let data_path = data_path.into();
        let text = fs::read_to_string(data_path.join(COLLECTOR_DATA_FILE))?;
        let collector: CollectorData = serde_json::from_str(&text)?;
        Self::build(core_params, params, collector, Some(data_path), registry)
    }

    pub fn with_assertions(mut self, assertions: Vec<MlAssertionParams>) -> Self {
        self.assertions = Some(assertions);
        self
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.core_params.prediction_type
    }

    pub fn collector_data(&self) -> &CollectorData {
        &self.collector
    }

    pub fn data_path(&self) -> Option<&Path> {
        self.data_path.as_deref()
    }

    /// Class label to index, for classification only.
    pub fn target_map(&self) -> Result<Option<BTreeMap<String, i64>>> {
        let map: BTreeMap<String, i64> = self
            .params
            .target_remapping
            .iter()
            .map(|t| (t.source_value.clone(), t.mapped_value))
            .collect();
        match self.core_params.prediction_type {
            PredictionType::BinaryClassification if map.len() != 2 => Err(PrepError::ConfigError(format!(
                "This is not a binary classification, found {} classes",
                map.len()
            ))),
            PredictionType::Multiclass if map.len() <= 2 => Err(PrepError::ConfigError(format!(
                "This is not multiclass, found {} classes",
                map.len()
            ))),
            PredictionType::BinaryClassification | PredictionType::Multiclass => Ok(Some(map)),
            PredictionType::Regression | PredictionType::Clustering => Ok(None),
        }
    }

    fn impact_coder(&self, feature: &PerFeatureParams) -> ImpactCoder {
        match self.core_params.prediction_type {
            PredictionType::Regression => ImpactCoder::continuous(match feature.rescaling {
                Rescaling::None => None,
                Rescaling::Minmax => Some(TargetRescaling::MinMax),
                Rescaling::Avgstd => Some(TargetRescaling::Standard),
            }),
            _ => ImpactCoder::categorical(),
        }
    }

    /// The ordered step list.
    pub fn preprocessing_steps(&self, options: PipelineOptions) -> Result<Steps> {
        match self.core_params.prediction_type {
            PredictionType::Clustering => self.clustering_steps(),
            _ => self.prediction_steps(options),
        }
    }

    /// Steps wrapped in a pipeline whose resources are initialized.
    pub fn build_pipeline(&self, options: PipelineOptions) -> Result<PreprocessingPipeline> {
        let resources = match &self.data_path {
            Some(path) => ResourceStore::with_data_path(path),
            None => ResourceStore::in_memory(),
        };
        let mut pipeline = PreprocessingPipeline::new(self.preprocessing_steps(options)?, resources);
        pipeline.init_resources()?;
        Ok(pipeline)
    }

    /// Write the collector data and every fitted resource to the model folder.
    pub fn save_data(&self, pipeline: &PreprocessingPipeline) -> Result<()> {
        let dir = self.require_data_path()?;
        fs::create_dir_all(dir)?;
        fs::write(dir.join(COLLECTOR_DATA_FILE), serde_json::to_vec_pretty(&self.collector)?)?;
        pipeline.resources().save(dir)?;
        info!(path = %dir.display(), "Saved preprocessing data");
        Ok(())
    }

    /// Collect the fit report and write it as `preprocessing_report.json`.
    pub fn report(&self, pipeline: &mut PreprocessingPipeline) -> Result<FitReport> {
        let report = pipeline.report_fit()?;
        let dir = self.require_data_path()?;
        fs::create_dir_all(dir)?;
        fs::write(dir.join(REPORT_FILE), serde_json::to_vec_pretty(&report)?)?;
        Ok(report)
    }

    fn require_data_path(&self) -> Result<&Path> {
        self.data_path
            .as_deref()
            .ok_or_else(|| PrepError::ConfigError("The preprocessing handler has no data path".to_string()))
    }

    /// Features of the given roles and type, in collector order.
    fn selected<'a>(
        &'a self,
        roles: &'a [FeatureRole],
        feature_type: FeatureType,
    ) -> impl Iterator<Item = Result<(&'a str, &'a PerFeatureParams)>> + 'a {
        self.collector.feature_order.iter().filter_map(move |name| match self.params.feature(name) {
            Ok(p) if roles.contains(&p.role) && p.feature_type == feature_type => Some(Ok((name.as_str(), p))),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    }

    fn analysis(&self, column: &str) -> Result<&FeatureAnalysis> {
        self.collector.feature(column)
    }

    fn custom_step(&self, column: &str, feature: &PerFeatureParams) -> Result<Box<dyn PreprocessingStep>> {
        let factory = self.registry.processor(feature.custom_code(column)?, column)?;
        Ok(Box::new(
            CustomPreprocessingStep::new(column, factory, feature.custom_processor_wants_matrix)
                .fit_only(feature.is_special_feature),
        ))
    }

    fn numerical_steps(&self, roles: &[FeatureRole]) -> Result<Steps> {
        let mut steps: Steps = Vec::new();

        // Rows are only dropped in this first pass.
        for item in self.selected(roles, FeatureType::Numeric) {
            let (column, feature) = item?;
            let method = feature.numerical_handling.unwrap_or(NumericalHandling::Regular);
            if method != NumericalHandling::FlagPresence && feature.missing_handling == Some(MissingHandling::DropRow) {
                steps.push(Box::new(SingleColumnDropNaRows::new(column)));
            }
        }

        let mut imputer_map: Vec<(String, Option<ImputeValue>)> = Vec::new();
        let mut derivatives = Vec::new();
        let mut rescalers: Steps = Vec::new();
        let mut combination_candidates = Vec::new();
        let mut binarizers: Steps = Vec::new();
        let mut quantizers: Steps = Vec::new();

        for item in self.selected(roles, FeatureType::Numeric) {
            let (column, feature) = item?;
            let analysis = self.analysis(column)?;
            let is_impute = feature.missing_handling == Some(MissingHandling::Impute);
            let impute_value = || -> Result<Option<ImputeValue>> {
                Ok(Some(ImputeValue::Number(analysis.impute_number(column)?)))
            };

            match feature.numerical_handling.unwrap_or(NumericalHandling::Regular) {
                NumericalHandling::Regular => {
                    if is_impute {
                        imputer_map.push((column.to_string(), impute_value()?));
                        combination_candidates.push(column.to_string());
                    } else {
                        // Missing values are dropped by the first pass or kept as NaN.
                        imputer_map.push((column.to_string(), None));
                    }
                    if feature.generate_derivative {
                        derivatives.push(column.to_string());
                    }
                    let stats = &analysis.stats;
                    match feature.rescaling {
                        Rescaling::None => {}
                        Rescaling::Minmax => rescalers.push(Box::new(RescalingProcessor::from_minmax(
                            NUM_IMPUTED,
                            column,
                            analysis.stat("min", stats.min)?,
                            analysis.stat("max", stats.max)?,
                        ))),
                        Rescaling::Avgstd => rescalers.push(Box::new(RescalingProcessor::from_avgstd(
                            NUM_IMPUTED,
                            column,
                            analysis.stat("average", stats.average)?,
                            stats.std.unwrap_or(0.0),
                        ))),
                    }
                }
                NumericalHandling::FlagPresence => steps.push(Box::new(FlagMissingValue::new(column, "num_flagonly"))),
                NumericalHandling::Binarize => {
                    if !is_impute {
                        return Err(PrepError::ConfigError(format!(
                            "'Impute' is the only supported missing handling method for binarization of {}",
                            column
                        )));
                    }
                    let threshold = match feature.binarize_threshold_mode {
                        Some(ThresholdMode::Median) => analysis.stat("median", analysis.stats.median)?,
                        Some(ThresholdMode::Mean) => analysis.stat("average", analysis.stats.average)?,
                        _ => feature.binarize_constant_threshold.ok_or_else(|| {
                            PrepError::ConfigError(format!("No binarization threshold for column {}", column))
                        })?,
                    };
                    imputer_map.push((column.to_string(), impute_value()?));
                    binarizers.push(Box::new(BinarizeSeries::new(NUM_IMPUTED, column, "num_binarized", threshold)));
                }
                NumericalHandling::QuantileBin => {
                    if !is_impute {
                        return Err(PrepError::ConfigError(format!(
                            "'Impute' is the only supported missing handling method for quantile binning of {}",
                            column
                        )));
                    }
                    let nb_bins = feature.quantile_bin_nb_bins.ok_or_else(|| {
                        PrepError::ConfigError(format!("No number of quantile bins for column {}", column))
                    })? as usize;
                    imputer_map.push((column.to_string(), impute_value()?));
                    quantizers.push(Box::new(QuantileBinSeries::new(NUM_IMPUTED, column, "num_quantized", nb_bins)));
                }
                NumericalHandling::Custom => steps.push(self.custom_step(column, feature)?),
            }
        }

        steps.push(Box::new(MultipleImputeMissingFromInput::new(imputer_map, NUM_IMPUTED, true, false)));
        steps.extend(rescalers);
        if !binarizers.is_empty() {
            steps.extend(binarizers);
            steps.push(Box::new(FlushDfBuilder::new("num_binarized")));
        }
        if !quantizers.is_empty() {
            steps.extend(quantizers);
            steps.push(Box::new(FlushDfBuilder::new("num_quantized")));
        }
        if !derivatives.is_empty() {
            steps.push(Box::new(NumericalDerivativesGenerator::new(NUM_IMPUTED, "NUM_DERIVATIVE", derivatives)));
            steps.push(Box::new(BlockStdRescaling::new("NUM_DERIVATIVE")));
        }
        steps.push(Box::new(FlushDfBuilder::new("num_flagonly")));

        let generation = &self.params.feature_generation;
        if generation.pairwise_linear.is_enabled() && combination_candidates.len() >= 2 {
            steps.push(Box::new(PairwiseLinearCombinationsGenerator::new(
                NUM_IMPUTED,
                "pw_linear",
                combination_candidates.clone(),
            )));
            steps.push(Box::new(BlockStdRescaling::new("pw_linear")));
        }
        if generation.polynomial_combinations.is_enabled() && combination_candidates.len() >= 2 {
            steps.push(Box::new(AllInteractionFeaturesGenerator::new(
                NUM_IMPUTED,
                "polynomial_interaction",
                combination_candidates,
            )));
            steps.push(Box::new(BlockStdRescaling::new("polynomial_interaction")));
        }
        Ok(steps)
    }

    /// Vocabulary of a dummified column. Missing values get their own level
    /// only when they reach the encoder, and unknown values an `__Others__`
    /// level only when the vocabulary was clipped and nothing is dropped.
    fn dummy_levels(&self, feature: &PerFeatureParams, analysis: &FeatureAnalysis) -> DummyLevels {
        let missing_reaches_encoder = feature.missing_handling.unwrap_or(MissingHandling::None) == MissingHandling::None;
        let with_na = analysis.category_has_missing
            && missing_reaches_encoder
            && analysis.dropped_modality.as_deref() != Some(NA_LABEL);
        let with_others = analysis.category_clipped && feature.dummy_drop == DummyDrop::None;
        DummyLevels::new(analysis.possible_values().to_vec(), with_na, with_others)
    }

    fn categorical_steps(&self, roles: &[FeatureRole]) -> Result<Steps> {
        let mut steps: Steps = Vec::new();
        let mut imputer_map: Vec<(String, Option<ImputeValue>)> = Vec::new();
        let mut post_impute: Steps = Vec::new();
        let mut flaggers: Steps = Vec::new();

        for item in self.selected(roles, FeatureType::Category) {
            let (column, feature) = item?;
            let analysis = self.analysis(column)?;
            let missing = feature.missing_handling.unwrap_or(MissingHandling::None);
            let method = feature.category_handling.ok_or_else(|| {
                PrepError::ConfigError(format!("No category handling for column {}", column))
            })?;
            let impute_value = || -> Result<ImputeValue> { Ok(ImputeValue::Text(analysis.impute_text(column)?)) };

            match method {
                CategoryHandling::Dummify => {
                    let levels = self.dummy_levels(feature, analysis);
                    match missing {
                        MissingHandling::Impute => {
                            imputer_map.push((column.to_string(), Some(impute_value()?)));
                            post_impute.push(Box::new(FastSparseDummify::new(Some(CAT_IMPUTED.to_string()), column, levels)));
                        }
                        MissingHandling::None => steps.push(Box::new(FastSparseDummify::new(None, column, levels))),
                        MissingHandling::DropRow => {
                            steps.push(Box::new(SingleColumnDropNaRows::new(column)));
                            steps.push(Box::new(FastSparseDummify::new(None, column, levels)));
                        }
                    }
                }
                CategoryHandling::Impact => {
                    let out_block = format!("impact:{}", column);
                    let coder = self.impact_coder(feature);
                    match missing {
                        MissingHandling::Impute | MissingHandling::None => {
                            let with = match missing {
                                MissingHandling::Impute => impute_value()?,
                                _ => ImputeValue::Text(NA_PLACEHOLDER.to_string()),
                            };
                            imputer_map.push((column.to_string(), Some(with)));
                            post_impute.push(Box::new(ImpactCodingStep::new(
                                Some(CAT_IMPUTED.to_string()),
                                column,
                                coder,
                                out_block,
                            )));
                        }
                        MissingHandling::DropRow => {
                            steps.push(Box::new(SingleColumnDropNaRows::new(column)));
                            steps.push(Box::new(ImpactCodingStep::new(None, column, coder, out_block)));
                        }
                    }
                }
                CategoryHandling::FlagPresence => {
                    flaggers.push(Box::new(FlagMissingValue::new(column, "cat_flagpresence")));
                }
                CategoryHandling::Hashing => {
                    let n_features = feature
                        .nb_bins_hashing
                        .unwrap_or(CategoricalFeatureHashing::DEFAULT_N_FEATURES);
                    let whole = feature.hash_whole_categories.unwrap_or(true);
                    match missing {
                        MissingHandling::Impute | MissingHandling::None => {
                            let with = match missing {
                                MissingHandling::Impute => impute_value()?,
                                _ => ImputeValue::Text(NA_PLACEHOLDER.to_string()),
                            };
                            imputer_map.push((column.to_string(), Some(with)));
                            post_impute.push(Box::new(CategoricalFeatureHashing::new(
                                Some(CAT_IMPUTED.to_string()),
                                column,
                                whole,
                                n_features,
                            )));
                        }
                        MissingHandling::DropRow => {
                            steps.push(Box::new(SingleColumnDropNaRows::new(column)));
                            steps.push(Box::new(CategoricalFeatureHashing::new(None, column, whole, n_features)));
                        }
                    }
                }
                CategoryHandling::Custom => steps.push(self.custom_step(column, feature)?),
            }
        }

        steps.push(Box::new(MultipleImputeMissingFromInput::new(imputer_map, CAT_IMPUTED, false, true)));
        steps.extend(post_impute);
        // No row may be dropped between the flaggers and their flush.
        steps.extend(flaggers);
        steps.push(Box::new(FlushDfBuilder::new("cat_flagpresence")));
        Ok(steps)
    }

    fn text_steps(&self, roles: &[FeatureRole]) -> Result<Steps> {
        let mut steps: Steps = Vec::new();
        for item in self.selected(roles, FeatureType::Text) {
            let (column, feature) = item?;
            match feature.text_handling {
                Some(TextHandling::TokenizeHashing) => {
                    let n_features = feature.hash_size.unwrap_or(TextHashingVectorizer::DEFAULT_N_FEATURES);
                    steps.push(Box::new(TextHashingVectorizer::new(column, n_features)));
                }
                Some(TextHandling::Custom) => steps.push(self.custom_step(column, feature)?),
                None => {
                    return Err(PrepError::ConfigError(format!("No text handling for column {}", column)));
                }
            }
        }
        Ok(steps)
    }

    fn vector_steps(&self, roles: &[FeatureRole]) -> Result<Steps> {
        let mut steps: Steps = Vec::new();
        let mut imputer_map: Vec<(String, Option<ImputeValue>)> = Vec::new();
        let mut unfolders: Steps = Vec::new();

        for item in self.selected(roles, FeatureType::Vector) {
            let (column, feature) = item?;
            let analysis = self.analysis(column)?;
            let missing = feature.missing_handling.unwrap_or(MissingHandling::DropRow);
            if missing == MissingHandling::DropRow {
                steps.push(Box::new(SingleColumnDropNaRows::new(column)));
            }
            let length = analysis.vector_length.ok_or_else(|| {
                PrepError::DataError(format!("No vector length for column {}, is it empty?", column))
            })?;
            match feature.vector_handling.unwrap_or(VectorHandling::Unfold) {
                VectorHandling::Unfold => {
                    if missing == MissingHandling::Impute {
                        imputer_map.push((column.to_string(), Some(ImputeValue::Text(analysis.impute_text(column)?))));
                        unfolders.push(Box::new(UnfoldVector::new(column, length, Some(VECTOR_IMPUTED.to_string()))));
                    } else {
                        unfolders.push(Box::new(UnfoldVector::new(column, length, None)));
                    }
                }
            }
        }

        steps.push(Box::new(MultipleImputeMissingFromInput::new(imputer_map, VECTOR_IMPUTED, false, true)));
        steps.extend(unfolders);
        Ok(steps)
    }

    fn image_steps(&self, roles: &[FeatureRole]) -> Result<Steps> {
        let mut steps: Steps = Vec::new();
        for item in self.selected(roles, FeatureType::Image) {
            let (column, feature) = item?;
            if feature.missing_handling.unwrap_or(MissingHandling::DropRow) == MissingHandling::DropRow {
                steps.push(Box::new(SingleColumnDropNaRows::new(column)));
            }
            match feature.image_handling {
                Some(ImageHandling::Custom) => {
                    let function = self.registry.file_function(feature.custom_code(column)?, column)?;
                    let folder = feature.managed_folder_id.as_deref().ok_or_else(|| {
                        PrepError::ConfigError(format!("Image column {} has no managed folder", column))
                    })?;
                    let reader = self.registry.file_reader(folder)?;
                    steps.push(Box::new(FileFunctionPreprocessing::new(
                        column,
                        function,
                        reader,
                        feature.is_special_feature,
                    )));
                }
                None => {
                    return Err(PrepError::ConfigError(format!("No image handling for column {}", column)));
                }
            }
        }
        Ok(steps)
    }

    fn interaction_steps(&self) -> Result<Steps> {
        let interactions = &self.params.feature_generation.manual_interactions.interactions;
        let mut steps: Steps = Vec::new();
        if interactions.is_empty() {
            return Ok(steps);
        }
        info!(count = interactions.len(), "Generating interactions");

        let is_numeric = |c: &str| -> Result<bool> { Ok(self.params.feature(c)?.feature_type == FeatureType::Numeric) };
        let mut num_num = Vec::new();
        let mut num_cat = Vec::new();
        let mut cat_cat = Vec::new();
        for interaction in interactions {
            match (is_numeric(&interaction.column_1)?, is_numeric(&interaction.column_2)?) {
                (true, true) => num_num.push(interaction),
                (false, false) => cat_cat.push(interaction),
                (true, false) => num_cat.push((&interaction.column_1, &interaction.column_2, interaction.max_features)),
                (false, true) => num_cat.push((&interaction.column_2, &interaction.column_1, interaction.max_features)),
            }
        }

        let num_block = "interaction";
        for interaction in num_num {
            debug!(column_1 = %interaction.column_1, column_2 = %interaction.column_2, "Numerical interaction");
            steps.push(Box::new(NumericalNumericalInteraction::new(
                num_block,
                interaction.column_1.as_str(),
                interaction.column_2.as_str(),
                interaction.rescale,
            )));
        }
        steps.push(Box::new(FlushDfBuilder::new(num_block)));

        for (num, cat, max_features) in num_cat {
            let out_block = format!("interaction:{}:{}", cat, num);
            steps.push(Box::new(NumericalCategoricalInteraction::new(
                out_block.as_str(),
                cat.as_str(),
                num.as_str(),
                max_features,
            )));
            steps.push(Box::new(FlushDfBuilder::new(out_block)));
        }

        for interaction in cat_cat {
            let out_block = format!("interaction:{}:{}", interaction.column_1, interaction.column_2);
            steps.push(Box::new(CategoricalCategoricalInteraction::new(
                out_block.as_str(),
                interaction.column_1.as_str(),
                interaction.column_2.as_str(),
                interaction.max_features,
            )));
            steps.push(Box::new(FlushDfBuilder::new(out_block)));
        }
        Ok(steps)
    }

    /// Numerical, categorical, text, vector, image, then interactions.
    fn standard_steps(&self, roles: &[FeatureRole], with_images: bool) -> Result<Steps> {
        let mut steps = self.numerical_steps(roles)?;
        steps.extend(self.categorical_steps(roles)?);
        steps.extend(self.text_steps(roles)?);
        steps.extend(self.vector_steps(roles)?);
        if with_images {
            steps.extend(self.image_steps(roles)?);
        }
        steps.extend(self.interaction_steps()?);
        Ok(steps)
    }

    fn prediction_steps(&self, options: PipelineOptions) -> Result<Steps> {
        let mut steps: Steps = Vec::new();
        let target_map = self.target_map()?;
        let weight = self.core_params.sample_weight_variable();
        let has_probas = self.core_params.proba_columns.as_ref().map(|p| !p.is_empty()).unwrap_or(false);

        if options.with_target {
            let target = self.core_params.target_variable.as_deref().ok_or_else(|| {
                PrepError::ConfigError("A target variable is required to extract the target".to_string())
            })?;
            steps.push(Box::new(RemapValueToOutput::new(target, SpecialOutput::Target, target_map.clone())));
        }
        if options.with_prediction {
            let prediction = self.core_params.prediction_variable.as_deref().ok_or_else(|| {
                PrepError::ConfigError("A prediction variable is required to extract predictions".to_string())
            })?;
            steps.push(Box::new(RemapValueToOutput::new(prediction, SpecialOutput::Prediction, target_map)));
            if let Some(probas) = self.core_params.proba_columns.as_ref().filter(|p| !p.is_empty()) {
                steps.push(Box::new(OutputRawColumns::new(probas.clone())));
            }
        }
        if let (true, Some(weight)) = (options.with_target, weight) {
            steps.push(Box::new(RemapValueToOutput::new(weight, SpecialOutput::Weight, None)));
        }
        if self.assertions.is_some() {
            steps.push(Box::new(ExtractAssertionMasksNbInitialRows::new(self.assertions.clone())));
        }

        steps.extend(self.standard_steps(&[FeatureRole::Input], true)?);

        if options.with_target {
            if weight.is_some() {
                steps.push(Box::new(RealignSideOutput::weight()));
            }
            steps.push(Box::new(RealignSideOutput::target()));
            let allow = options.allow_empty_mf;
            let dropper = match (weight.is_some(), options.with_prediction) {
                (true, true) => SpecialOutputsDropNaRows::no_target_or_no_weight_or_no_prediction(allow, has_probas),
                (true, false) => SpecialOutputsDropNaRows::no_target_or_no_weight(allow),
                (false, true) => SpecialOutputsDropNaRows::no_target_or_no_prediction(allow, has_probas),
                (false, false) => SpecialOutputsDropNaRows::no_target(allow),
            };
            steps.push(Box::new(dropper));
        }

        steps.push(Box::new(DumpPipelineState::new("Before feature selection")));
        if self.params.feature_selection_params.method != SelectionMethod::None {
            info!(method = ?self.params.feature_selection_params.method, "Performing feature reduction");
            steps.push(Box::new(FeatureSelectionStep::new(
                self.params.feature_selection_params.clone(),
                self.core_params.prediction_type,
            )));
        } else {
            debug!("No feature selection to perform");
        }

        // Assertions see the input once every row drop happened.
        if self.assertions.is_some() {
            steps.push(Box::new(ExtractAssertionMasks::new(self.assertions.clone())));
        }
        steps.push(Box::new(EmitCurrentMfAsResult::new("TRAIN")));
        steps.push(Box::new(DumpPipelineState::new("At end")));
        Ok(steps)
    }

    /// Emits `PROFILING`, `TRAIN_PREPCA`, `TRAIN` and, with outlier
    /// detection, `OUTLIERS`.
    fn clustering_steps(&self) -> Result<Steps> {
        let mut steps: Steps = Vec::new();

        // Profiling keeps numericals and categoricals as they are, and
        // dummifies categoricals for the scatter plots. Text is left out.
        let mut numericals = Vec::new();
        let mut categoricals = Vec::new();
        for name in &self.collector.feature_order {
            let feature = self.params.feature(name)?;
            if !matches!(feature.role, FeatureRole::Input | FeatureRole::Profiling) {
                continue;
            }
            match feature.feature_type {
                FeatureType::Category => {
                    categoricals.push(name.clone());
                    if feature.category_handling == Some(CategoryHandling::Dummify) {
                        let levels = self.dummy_levels(feature, self.analysis(name)?);
                        steps.push(Box::new(FastSparseDummify::new(None, name.as_str(), levels)));
                    }
                }
                FeatureType::Numeric => numericals.push(name.clone()),
                _ => {}
            }
        }
        steps.push(Box::new(CopyMultipleColumnsFromInput::new(numericals, "NUM_COPIED")));
        steps.push(Box::new(CopyMultipleColumnsFromInput::new(categoricals, "CAT_COPIED")));
        steps.push(Box::new(EmitCurrentMfAsResult::new("PROFILING")));
        steps.push(Box::new(DumpPipelineState::new("After create profiling")));

        steps.extend(self.standard_steps(&[FeatureRole::Input], false)?);
        steps.push(Box::new(DumpPipelineState::new("After std handling")));

        let mut kept_variance = self.params.reduce.kept_variance;
        if kept_variance == 0.0 {
            kept_variance = 0.9;
        }
        let seed = self.params.preprocessing_fit_sample_seed.unwrap_or(DEFAULT_SEED);
        let outliers = &self.params.outliers;
        if outliers.method != OutlierMethod::None {
            steps.push(Box::new(
                OutlierDetection::new(kept_variance, outliers.min_n, outliers.min_cum_ratio).with_random_state(seed),
            ));
        }
        steps.push(Box::new(DumpPipelineState::new("After outliers")));
        steps.push(Box::new(EmitCurrentMfAsResult::new("TRAIN_PREPCA")));

        if self.params.reduce.enabled {
            let settings = PcaSettings::default().with_kept_variance(kept_variance).with_random_state(seed);
            steps.push(Box::new(PcaStep::new(settings, "TRAIN_PREPCA", "TRAIN")));
        } else {
            steps.push(Box::new(AddReferenceInOutput::new("TRAIN_PREPCA", "TRAIN")));
        }
        steps.push(Box::new(DumpPipelineState::new("After PCA")));
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessing::collector::{CollectorMode, PreprocessingDataCollector};
    use crate::preprocessing::params::ImputeWith;
    use crate::frame::{ColumnValues, InputFrame};

    fn frame() -> InputFrame {
        InputFrame::new(vec![
            ("x".into(), ColumnValues::Numeric(vec![1.0, f64::NAN, 3.0, 4.0])),
            (
                "c".into(),
                ColumnValues::Text(vec![Some("a".into()), Some("b".into()), None, Some("a".into())]),
            ),
            (
                "y".into(),
                ColumnValues::Text(vec![Some("yes".into()), Some("no".into()), Some("yes".into()), None]),
            ),
        ])
        .unwrap()
    }

    fn params() -> PreprocessingParams {
        PreprocessingParams::default()
            .with_feature(
                "x",
                PerFeatureParams::new(FeatureRole::Input, FeatureType::Numeric)
                    .with_missing(MissingHandling::Impute, Some(ImputeWith::Mean))
                    .with_numerical_handling(NumericalHandling::Regular)
                    .with_rescaling(Rescaling::Avgstd),
            )
            .with_feature(
                "c",
                PerFeatureParams::new(FeatureRole::Input, FeatureType::Category)
                    .with_missing(MissingHandling::None, None)
                    .with_category_handling(CategoryHandling::Dummify),
            )
            .with_feature("y", PerFeatureParams::new(FeatureRole::Target, FeatureType::Category))
            .with_target_remapping(&["no", "yes"])
    }

    fn handler(prediction_type: PredictionType, params: PreprocessingParams) -> Result<PreprocessingHandler> {
        let input = frame();
        let mode = match prediction_type {
            PredictionType::Clustering => CollectorMode::Clustering,
            _ => CollectorMode::Prediction,
        };
        let collector = PreprocessingDataCollector::new(&input, &params, mode).build()?;
        PreprocessingHandler::build(
            CoreParams::new(prediction_type).with_target("y"),
            params,
            collector,
            None,
            CustomCodeRegistry::new(),
        )
    }

    fn step_names(steps: &Steps) -> Vec<String> {
        steps.iter().map(|s| s.name()).collect()
    }

    #[test]
    fn test_target_map_checks_class_count() {
        assert!(handler(PredictionType::BinaryClassification, params()).is_ok());
        let err = handler(PredictionType::Multiclass, params()).unwrap_err();
        assert!(matches!(err, PrepError::ConfigError(_)));
        assert!(handler(PredictionType::Regression, params()).unwrap().target_map().unwrap().is_none());
    }

    #[test]
    fn test_prediction_step_order() {
        let h = handler(PredictionType::BinaryClassification, params()).unwrap();
        let names = step_names(&h.preprocessing_steps(PipelineOptions::training()).unwrap());
        let position = |prefix: &str| names.iter().position(|n| n.starts_with(prefix)).unwrap();
        assert_eq!(position("RemapValueToOutput"), 0);
        assert!(position("MultipleImputeMissingFromInput") < position("RescalingProcessor"));
        assert!(position("FastSparseDummify") < position("Realign"));
        assert!(position("SpecialOutputsDropNaRows") < position("EmitCurrentMfAsResult (TRAIN)"));
        assert!(!names.iter().any(|n| n.starts_with("FeatureSelectionStep")));
    }

    #[test]
    fn test_scoring_has_no_target_steps() {
        let h = handler(PredictionType::BinaryClassification, params()).unwrap();
        let names = step_names(&h.preprocessing_steps(PipelineOptions::scoring()).unwrap());
        assert!(!names.iter().any(|n| n.starts_with("RemapValueToOutput") || n.starts_with("Realign")));
    }

    #[test]
    fn test_clustering_outputs() {
        let mut p = params();
        p.outliers.method = OutlierMethod::Drop;
        p.reduce.enabled = true;
        let h = handler(PredictionType::Clustering, p).unwrap();
        let names = step_names(&h.preprocessing_steps(PipelineOptions::scoring()).unwrap());
        assert!(names.contains(&"EmitCurrentMfAsResult (PROFILING)".to_string()));
        assert!(names.iter().any(|n| n.starts_with("OutlierDetection")));
        assert!(names.iter().any(|n| n.starts_with("PcaStep")));
    }

    #[test]
    fn test_binarize_requires_impute() {
        let mut p = params();
        let x = p.per_feature.get_mut("x").unwrap();
        x.numerical_handling = Some(NumericalHandling::Binarize);
        x.missing_handling = Some(MissingHandling::DropRow);
        let h = handler(PredictionType::BinaryClassification, p).unwrap();
        assert!(matches!(
            h.preprocessing_steps(PipelineOptions::training()),
            Err(PrepError::ConfigError(_))
        ));
    }

    #[test]
    fn test_custom_without_processor() {
        let mut p = params();
        p.per_feature.insert(
            "c".into(),
            PerFeatureParams::new(FeatureRole::Input, FeatureType::Category)
                .with_category_handling(CategoryHandling::Custom)
                .with_custom_code("unknown", false),
        );
        let h = handler(PredictionType::BinaryClassification, p).unwrap();
        assert!(matches!(
            h.preprocessing_steps(PipelineOptions::training()),
            Err(PrepError::CustomCodeError(_))
        ));
    }
}
