//! What a pipeline run produces: named frames plus the side channels
//! (target, weight, prediction, probabilities, assertions).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{PrepError, Result};
use crate::frame::{ColumnValues, InputFrame, MultiFrame};

/// A single column detached from the frames, keyed by row id.
#[derive(Debug, Clone, PartialEq)]
pub struct SideSeries {
    pub index: Vec<usize>,
    pub values: ColumnValues,
}

impl SideSeries {
    pub fn new(index: Vec<usize>, values: ColumnValues) -> Result<Self> {
        if index.len() != values.len() {
            return Err(PrepError::ShapeError {
                expected: format!("{} values", index.len()),
                actual: format!("{} values", values.len()),
            });
        }
        Ok(Self { index, values })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn missing_mask(&self) -> Vec<bool> {
        self.values.missing_mask()
    }

    pub fn drop_rows(&mut self, mask: &[bool]) {
        self.index = self.index.iter().zip(mask).filter(|(_, &m)| !m).map(|(i, _)| *i).collect();
        self.values = self.values.drop_rows(mask);
    }

    /// Reorder and restrict to `index`. Every requested row must exist.
    pub fn realign(&self, index: &[usize]) -> Result<SideSeries> {
        let positions: BTreeMap<usize, usize> = self.index.iter().enumerate().map(|(p, id)| (*id, p)).collect();
        let selected = index
            .iter()
            .map(|id| {
                positions
                    .get(id)
                    .copied()
                    .ok_or_else(|| PrepError::DataError(format!("Row {} is missing from the side series", id)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SideSeries {
            index: index.to_vec(),
            values: self.values.select(&selected),
        })
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.values.to_f64_vec()
    }
}

/// Declared ML assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlAssertionParams {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MlAssertionParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: Map::new(),
        }
    }

    /// Input column holding the assertion's boolean mask.
    pub fn mask_column(&self) -> String {
        format!("__dku__ml_assertion_mask_{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MlAssertion {
    pub params: MlAssertionParams,
    pub nb_initial_rows: usize,
    pub mask: Option<SideSeries>,
}

/// Which side channel a row-dropping step looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialOutput {
    Target,
    Weight,
    Prediction,
    Probas,
}

impl SpecialOutput {
    pub fn name(&self) -> &'static str {
        match self {
            SpecialOutput::Target => "target",
            SpecialOutput::Weight => "weight",
            SpecialOutput::Prediction => "prediction",
            SpecialOutput::Probas => "probas",
        }
    }
}

/// Output of `fit_and_process` / `process`.
#[derive(Debug, Clone, Default)]
pub struct PreprocessingResult {
    pub frames: BTreeMap<String, MultiFrame>,
    pub target: Option<SideSeries>,
    pub weight: Option<SideSeries>,
    pub prediction: Option<SideSeries>,
    pub probas: Option<InputFrame>,
    pub assertions: Option<Vec<MlAssertion>>,
    pub unprocessed: Option<InputFrame>,
}

impl PreprocessingResult {
    pub fn frame(&self, name: &str) -> Result<&MultiFrame> {
        self.frames
            .get(name)
            .ok_or_else(|| PrepError::BlockNotFound(format!("output {}", name)))
    }

    pub fn train(&self) -> Result<&MultiFrame> {
        self.frame("TRAIN")
    }

    pub fn side(&self, which: SpecialOutput) -> Option<&SideSeries> {
        match which {
            SpecialOutput::Target => self.target.as_ref(),
            SpecialOutput::Weight => self.weight.as_ref(),
            SpecialOutput::Prediction => self.prediction.as_ref(),
            SpecialOutput::Probas => None,
        }
    }

    pub fn side_mut(&mut self, which: SpecialOutput) -> Option<&mut SideSeries> {
        match which {
            SpecialOutput::Target => self.target.as_mut(),
            SpecialOutput::Weight => self.weight.as_mut(),
            SpecialOutput::Prediction => self.prediction.as_mut(),
            SpecialOutput::Probas => None,
        }
    }

    /// Keep only the named entries. Frames are matched by name, side
    /// channels by `target`, `weight`, `prediction`, `probas`,
    /// `assertions` and `UNPROCESSED`.
    pub fn retain(&mut self, keys: &[&str]) {
        let keep = |k: &str| keys.contains(&k);
        self.frames.retain(|k, _| keep(k));
        if !keep("target") {
            self.target = None;
        }
        if !keep("weight") {
            self.weight = None;
        }
        if !keep("prediction") {
            self.prediction = None;
        }
        if !keep("probas") {
            self.probas = None;
        }
        if !keep("assertions") {
            self.assertions = None;
        }
        if !keep("UNPROCESSED") {
            self.unprocessed = None;
        }
        debug!(kept = ?self.frames.keys().collect::<Vec<_>>(), "Retained pipeline outputs");
    }
}

/// Where each generated block or column came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockOrigin {
    ToOneFeature { original_name: String },
    OneFeaturePerColumn { values: BTreeMap<String, String> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedFeaturesMapping {
    pub mapping: BTreeMap<String, BlockOrigin>,
}

impl GeneratedFeaturesMapping {
    pub fn add_whole_block_mapping(&mut self, block: &str, original: &str) {
        self.mapping.insert(
            block.to_string(),
            BlockOrigin::ToOneFeature {
                original_name: original.to_string(),
            },
        );
    }

    pub fn add_per_column_mapping(&mut self, block: &str, original: &str, new_name: &str) {
        let entry = self
            .mapping
            .entry(block.to_string())
            .or_insert_with(|| BlockOrigin::OneFeaturePerColumn { values: BTreeMap::new() });
        if let BlockOrigin::OneFeaturePerColumn { values } = entry {
            values.insert(new_name.to_string(), original.to_string());
        }
    }

    pub fn should_send_block_to_one_feature(&self, block: &str) -> bool {
        matches!(self.mapping.get(block), Some(BlockOrigin::ToOneFeature { .. }))
    }

    pub fn whole_block_original(&self, block: &str) -> Option<&str> {
        match self.mapping.get(block) {
            Some(BlockOrigin::ToOneFeature { original_name }) => Some(original_name),
            _ => None,
        }
    }

    /// Original feature of a generated column; the column itself when unknown.
    pub fn per_column_original<'a>(&'a self, block: &str, new_name: &'a str) -> &'a str {
        match self.mapping.get(block) {
            Some(BlockOrigin::OneFeaturePerColumn { values }) => {
                values.get(new_name).map(|s| s.as_str()).unwrap_or(new_name)
            }
            _ => new_name,
        }
    }
}

/// Free-form fit report, serialized as `preprocessing_report.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FitReport(pub Map<String, Value>);

impl FitReport {
    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Set `section.key`, creating the section object when absent.
    pub fn insert_in(&mut self, section: &str, key: &str, value: Value) {
        let entry = self.0.entry(section.to_string()).or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(map) => {
                map.insert(key.to_string(), value);
            }
            other => {
                let mut map = Map::new();
                map.insert(key.to_string(), value);
                *other = Value::Object(map);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_side_series_realign() {
        let s = SideSeries::new(vec![0, 1, 2, 3], ColumnValues::Numeric(vec![0.0, 1.0, 2.0, 3.0])).unwrap();
        let r = s.realign(&[3, 1]).unwrap();
        assert_eq!(r.index, vec![3, 1]);
        assert_eq!(r.values, ColumnValues::Numeric(vec![3.0, 1.0]));
        assert!(s.realign(&[7]).is_err());
    }

    #[test]
    fn test_retain() {
        let mut out = PreprocessingResult::default();
        out.frames.insert("TRAIN".into(), MultiFrame::new(vec![0]));
        out.frames.insert("PROFILING".into(), MultiFrame::new(vec![0]));
        out.target = Some(SideSeries::new(vec![0], ColumnValues::Numeric(vec![1.0])).unwrap());
        out.retain(&["TRAIN"]);
        assert!(out.train().is_ok());
        assert!(out.frame("PROFILING").is_err());
        assert!(out.target.is_none());
    }

    #[test]
    fn test_mapping() {
        let mut m = GeneratedFeaturesMapping::default();
        m.add_whole_block_mapping("dummy:c", "c");
        m.add_per_column_mapping("num_flagonly", "x", "num_flagonly:x:not_missing");
        assert!(m.should_send_block_to_one_feature("dummy:c"));
        assert_eq!(m.whole_block_original("dummy:c"), Some("c"));
        assert_eq!(m.per_column_original("num_flagonly", "num_flagonly:x:not_missing"), "x");
        assert_eq!(m.per_column_original("num_flagonly", "other"), "other");
    }

    #[test]
    fn test_report_sections() {
        let mut report = FitReport::default();
        report.insert_in("impact", "c", json!({"values": []}));
        report.insert_in("impact", "d", json!({"values": []}));
        assert_eq!(report.get("impact").unwrap().as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_assertion_mask_column() {
        let p = MlAssertionParams::new("big_ones");
        assert_eq!(p.mask_column(), "__dku__ml_assertion_mask_big_ones");
    }
}
