//! Fitted artifacts shared by the pipeline steps.
//!
//! Every resource kind has one strongly typed payload. Payloads are created
//! lazily on first access: from `<data_path>/<name>.json|.model` when the file
//! exists, otherwise empty. Once created a payload stays cached for the
//! lifetime of the store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::impact::ImpactTable;
use super::steps::{DummyLevels, FeatureSelectionModel, OutlierModel, PcaModel};
use crate::error::{PrepError, Result};

/// On-disk encoding of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceFormat {
    /// Human readable document, `<name>.json`.
    Json,
    /// Compact fitted object, `<name>.model`.
    Model,
}

impl ResourceFormat {
    fn extension(&self) -> &'static str {
        match self {
            ResourceFormat::Json => "json",
            ResourceFormat::Model => "model",
        }
    }
}

/// Payloads know when they hold nothing worth persisting.
pub trait Payload: Default + Serialize + DeserializeOwned {
    fn is_empty(&self) -> bool;
}

impl<V: Serialize + DeserializeOwned> Payload for BTreeMap<String, V> {
    fn is_empty(&self) -> bool {
        BTreeMap::is_empty(self)
    }
}

/// A list of column names, appended to without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnList {
    pub columns: Vec<String>,
}

impl ColumnList {
    pub fn register(&mut self, column: &str) {
        if !self.columns.iter().any(|c| c == column) {
            self.columns.push(column.to_string());
        }
    }
}

impl Payload for ColumnList {
    fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlaggedColumns {
    pub columns: Vec<String>,
    pub output_names: Vec<String>,
}

impl FlaggedColumns {
    pub fn register(&mut self, column: &str, output_name: &str) {
        if !self.columns.iter().any(|c| c == column) {
            self.columns.push(column.to_string());
            self.output_names.push(output_name.to_string());
        }
    }
}

impl Payload for FlaggedColumns {
    fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Imputation values actually applied, split by numeric and categorical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImputedColumns {
    pub num_columns: Vec<String>,
    pub num_values: Vec<Option<f64>>,
    pub cat_columns: Vec<String>,
    pub cat_values: Vec<Option<String>>,
}

impl ImputedColumns {
    pub fn register_numeric(&mut self, column: &str, value: Option<f64>) {
        if !self.num_columns.iter().any(|c| c == column) {
            self.num_columns.push(column.to_string());
            self.num_values.push(value);
        }
    }

    pub fn register_categorical(&mut self, column: &str, value: Option<String>) {
        if !self.cat_columns.iter().any(|c| c == column) {
            self.cat_columns.push(column.to_string());
            self.cat_values.push(value);
        }
    }
}

impl Payload for ImputedColumns {
    fn is_empty(&self) -> bool {
        self.num_columns.is_empty() && self.cat_columns.is_empty()
    }
}

/// `(x - shift) * inv_scale`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RescaleFactors {
    pub shift: f64,
    pub inv_scale: f64,
}

impl RescaleFactors {
    /// A zero or undefined scale maps every value to zero.
    pub fn from_scale(shift: f64, scale: f64) -> Self {
        let inv_scale = if scale == 0.0 || scale.is_nan() { 0.0 } else { 1.0 / scale };
        Self { shift, inv_scale }
    }

    pub fn apply(&self, v: f64) -> f64 {
        (v - self.shift) * self.inv_scale
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinarizeThreshold {
    pub output_name: String,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumNumScaling {
    pub column_1: String,
    pub column_2: String,
    pub rescale: bool,
    pub shift: f64,
    pub inv_scale: f64,
}

macro_rules! resource_kinds {
    ($( $variant:ident => $accessor:ident, $name:literal, $format:ident, $payload:ty; )*) => {
        /// Every kind of fitted artifact.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum ResourceKind {
            $($variant),*
        }

        impl ResourceKind {
            pub const ALL: &'static [ResourceKind] = &[$(ResourceKind::$variant),*];

            /// Stable name, also the file stem.
            pub fn name(&self) -> &'static str {
                match self {
                    $(ResourceKind::$variant => $name),*
                }
            }

            pub fn format(&self) -> ResourceFormat {
                match self {
                    $(ResourceKind::$variant => ResourceFormat::$format),*
                }
            }

            pub fn file_name(&self) -> String {
                format!("{}.{}", self.name(), self.format().extension())
            }
        }

        /// A typed payload tagged with its kind.
        #[derive(Debug, Clone)]
        pub enum Resource {
            $($variant($payload)),*
        }

        impl Resource {
            fn empty(kind: ResourceKind) -> Self {
                match kind {
                    $(ResourceKind::$variant => Resource::$variant(<$payload>::default())),*
                }
            }

            fn is_empty(&self) -> bool {
                match self {
                    $(Resource::$variant(p) => Payload::is_empty(p)),*
                }
            }

            fn encode(&self, format: ResourceFormat) -> Result<Vec<u8>> {
                match self {
                    $(Resource::$variant(p) => encode_payload(p, format)),*
                }
            }

            fn decode(kind: ResourceKind, bytes: &[u8]) -> Result<Self> {
                match kind {
                    $(ResourceKind::$variant => Ok(Resource::$variant(serde_json::from_slice(bytes)?))),*
                }
            }
        }

        impl ResourceStore {
            $(
                pub fn $accessor(&mut self) -> Result<&mut $payload> {
                    match self.entry(ResourceKind::$variant)? {
                        Resource::$variant(p) => Ok(p),
                        _ => Err(PrepError::ComputationError(format!(
                            "Resource {} holds a payload of another kind",
                            $name
                        ))),
                    }
                }
            )*
        }
    };
}

resource_kinds! {
    DropRows => drop_rows, "drop_rows", Json, ColumnList;
    Flagged => flagged, "flagged", Json, FlaggedColumns;
    Imputed => imputed, "imputed", Json, ImputedColumns;
    Rescalers => rescalers, "rescalers", Json, BTreeMap<String, RescaleFactors>;
    BlockStdRescaler => block_std_rescaler, "block_std_rescaler", Json, BTreeMap<String, BTreeMap<String, RescaleFactors>>;
    Binarized => binarized, "binarized", Json, BTreeMap<String, BinarizeThreshold>;
    QuantileBinner => quantile_binner, "quantile_binner", Json, BTreeMap<String, Vec<f64>>;
    Derivatives => derivatives, "derivatives", Json, ColumnList;
    Dummies => dummies, "dummies", Json, BTreeMap<String, DummyLevels>;
    ImpactCoded => impact_coded, "impact_coded", Json, BTreeMap<String, ImpactTable>;
    VectorsUnfold => vectors_unfold, "vectors-unfold", Json, BTreeMap<String, usize>;
    NumNum => num_num, "num_num", Json, BTreeMap<String, NumNumScaling>;
    NumCat => num_cat, "num_cat", Json, BTreeMap<String, Vec<String>>;
    CatCat => cat_cat, "cat_cat", Json, BTreeMap<String, Vec<(String, String)>>;
    CustomPrep => custom_prep, "custom_prep", Model, BTreeMap<String, serde_json::Value>;
    Pca => pca, "pca", Model, BTreeMap<String, PcaModel>;
    ClusteringOutliers => clustering_outliers, "clustering_outliers", Model, BTreeMap<String, OutlierModel>;
    FeatureSelection => feature_selection, "feature_selection", Json, BTreeMap<String, FeatureSelectionModel>;
}

fn encode_payload<P: Serialize>(payload: &P, format: ResourceFormat) -> Result<Vec<u8>> {
    Ok(match format {
        ResourceFormat::Json => serde_json::to_vec_pretty(payload)?,
        ResourceFormat::Model => serde_json::to_vec(payload)?,
    })
}

/// Memoized, lazily loaded resources of one pipeline.
#[derive(Debug, Default)]
pub struct ResourceStore {
    data_path: Option<PathBuf>,
    resources: BTreeMap<ResourceKind, Resource>,
}

impl ResourceStore {
    /// A store that never reads from disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A store backed by a model folder; resources found there are loaded on first access.
    pub fn with_data_path(path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: Some(path.into()),
            resources: BTreeMap::new(),
        }
    }

    pub fn data_path(&self) -> Option<&Path> {
        self.data_path.as_deref()
    }

    fn entry(&mut self, kind: ResourceKind) -> Result<&mut Resource> {
        if !self.resources.contains_key(&kind) {
            let resource = self.load_or_empty(kind)?;
            self.resources.insert(kind, resource);
        }
        self.resources
            .get_mut(&kind)
            .ok_or_else(|| PrepError::not_fitted(kind.name(), "<store>"))
    }

    fn load_or_empty(&self, kind: ResourceKind) -> Result<Resource> {
        if let Some(dir) = &self.data_path {
            let path = dir.join(kind.file_name());
            if path.exists() {
                debug!(resource = kind.name(), path = %path.display(), "Loading resource");
                let bytes = fs::read(&path)?;
                return Resource::decode(kind, &bytes);
            }
        }
        Ok(Resource::empty(kind))
    }

    /// Whether the kind was touched and holds data.
    pub fn has_data(&self, kind: ResourceKind) -> bool {
        self.resources.get(&kind).map(|r| !r.is_empty()).unwrap_or(false)
    }

    /// Write every non-empty resource under `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        for (kind, resource) in &self.resources {
            if resource.is_empty() {
                continue;
            }
            let path = dir.join(kind.file_name());
            fs::write(&path, resource.encode(kind.format())?)?;
            info!(resource = kind.name(), path = %path.display(), "Saved resource");
        }
        Ok(())
    }
}
