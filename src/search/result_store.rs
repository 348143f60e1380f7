//! Persistence of per-split and aggregated search results.
//!
//! The on-disk store lets an interrupted search resume: split results
//! already on disk are reused instead of refitted.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::context::{unix_time_millis, SplitResult};
use super::evaluator::AggregatedResult;
use crate::error::{PrepError, Result};
use crate::optimizer::HyperparamPoint;

pub const PER_SPLIT_RESULTS_FILE: &str = "grid_search_done.json";
pub const AGGREGATED_RESULTS_FILE: &str = "grid_search_scores.json";

pub trait ResultStore: Send + Sync {
    fn append_split_results(&self, results: &[SplitResult]) -> Result<()>;

    /// Stored result of `parameters` on `split_id`, if any.
    fn find_split_result(&self, split_id: usize, parameters: &HyperparamPoint) -> Result<Option<SplitResult>>;

    fn init_result_file(
        &self,
        n_candidates: Option<usize>,
        n_threads: usize,
        n_splits: usize,
        metric: &str,
        timeout: Option<f64>,
    ) -> Result<()>;

    fn append_aggregated_result(&self, result: &AggregatedResult) -> Result<()>;

    /// Set `gridSize` to the number of points actually explored.
    fn update_final_grid_size(&self) -> Result<()>;
}

/// Keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResultStore;

impl ResultStore for NoopResultStore {
    fn append_split_results(&self, _results: &[SplitResult]) -> Result<()> {
        Ok(())
    }

    fn find_split_result(&self, _split_id: usize, _parameters: &HyperparamPoint) -> Result<Option<SplitResult>> {
        Ok(None)
    }

    fn init_result_file(
        &self,
        _n_candidates: Option<usize>,
        _n_threads: usize,
        _n_splits: usize,
        _metric: &str,
        _timeout: Option<f64>,
    ) -> Result<()> {
        Ok(())
    }

    fn append_aggregated_result(&self, _result: &AggregatedResult) -> Result<()> {
        Ok(())
    }

    fn update_final_grid_size(&self) -> Result<()> {
        Ok(())
    }
}

/// Content of the aggregated results file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchScores {
    pub started_at: u64,
    pub grid_size: Option<usize>,
    pub n_threads: usize,
    pub n_splits: usize,
    pub metric: String,
    pub timeout: Option<f64>,
    pub grid_points: Vec<AggregatedResult>,
}

#[derive(Debug, Default)]
struct Cache {
    split_results: Option<Vec<SplitResult>>,
    scores: Option<SearchScores>,
}

/// JSON files in a model folder. Writes go through a temporary file and a
/// rename; every access holds one lock.
#[derive(Debug)]
pub struct OnDiskResultStore {
    folder: PathBuf,
    cache: Mutex<Cache>,
}

impl OnDiskResultStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            cache: Mutex::new(Cache::default()),
        }
    }

    fn split_path(&self) -> PathBuf {
        self.folder.join(PER_SPLIT_RESULTS_FILE)
    }

    fn scores_path(&self) -> PathBuf {
        self.folder.join(AGGREGATED_RESULTS_FILE)
    }

    /// Current aggregated scores file, if initialized.
    pub fn scores(&self) -> Result<Option<SearchScores>> {
        let mut cache = self.cache.lock();
        self.load_scores(&mut cache)?;
        Ok(cache.scores.clone())
    }

    fn load_splits<'a>(&self, cache: &'a mut Cache) -> Result<&'a mut Vec<SplitResult>> {
        if cache.split_results.is_none() {
            let path = self.split_path();
            let loaded = if path.exists() { read_json(&path)? } else { Vec::new() };
            cache.split_results = Some(loaded);
        }
        Ok(cache.split_results.get_or_insert_with(Vec::new))
    }

    fn load_scores(&self, cache: &mut Cache) -> Result<()> {
        if cache.scores.is_none() {
            let path = self.scores_path();
            if path.exists() {
                cache.scores = Some(read_json(&path)?);
            }
        }
        Ok(())
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(data)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl ResultStore for OnDiskResultStore {
    fn append_split_results(&self, results: &[SplitResult]) -> Result<()> {
        let mut cache = self.cache.lock();
        let points = self.load_splits(&mut cache)?;
        for result in results {
            let known = points
                .iter()
                .any(|p| p.split_id == result.split_id && p.parameters == result.parameters);
            if !known {
                points.push(result.clone());
            }
        }
        write_json(&self.split_path(), &*points)
    }

    fn find_split_result(&self, split_id: usize, parameters: &HyperparamPoint) -> Result<Option<SplitResult>> {
        let mut cache = self.cache.lock();
        let points = self.load_splits(&mut cache)?;
        Ok(points
            .iter()
            .find(|p| p.split_id == split_id && &p.parameters == parameters)
            .cloned())
    }

    fn init_result_file(
        &self,
        n_candidates: Option<usize>,
        n_threads: usize,
        n_splits: usize,
        metric: &str,
        timeout: Option<f64>,
    ) -> Result<()> {
        let mut cache = self.cache.lock();
        let path = self.scores_path();
        if path.exists() {
            debug!(path = %path.display(), "Resuming search");
            return Ok(());
        }
        fs::create_dir_all(&self.folder)?;
        let scores = SearchScores {
            started_at: unix_time_millis(),
            grid_size: n_candidates,
            n_threads,
            n_splits,
            metric: metric.to_string(),
            timeout,
            grid_points: Vec::new(),
        };
        write_json(&path, &scores)?;
        cache.scores = Some(scores);
        Ok(())
    }

    fn append_aggregated_result(&self, result: &AggregatedResult) -> Result<()> {
        let mut cache = self.cache.lock();
        self.load_scores(&mut cache)?;
        let path = self.scores_path();
        let scores = cache
            .scores
            .as_mut()
            .ok_or_else(|| PrepError::ConfigError(format!("File {} does not exist", path.display())))?;
        if scores.grid_points.iter().any(|p| p.parameters == result.parameters) {
            return Ok(());
        }
        scores.grid_points.push(result.clone());
        write_json(&path, &*scores)
    }

    fn update_final_grid_size(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        self.load_scores(&mut cache)?;
        let path = self.scores_path();
        if let Some(scores) = cache.scores.as_mut() {
            scores.grid_size = Some(scores.grid_points.len());
            write_json(&path, &*scores)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::evaluator::aggregate_point_results;

    fn split_result(split_id: usize, c: f64) -> SplitResult {
        let mut parameters = HyperparamPoint::new();
        parameters.insert("C".to_string(), c.into());
        SplitResult {
            test_score_gib: 0.5,
            train_score: 0.6,
            test_score: 0.5,
            num_samples: 10,
            fit_time: 1.0,
            score_time: 1.0,
            time: 2.0,
            parameters,
            done_at: 1,
            split_id,
        }
    }

    #[test]
    fn test_resume_finds_stored_split() {
        let dir = tempfile::tempdir().unwrap();
        let store = OnDiskResultStore::new(dir.path());
        store.append_split_results(&[split_result(0, 1.0), split_result(1, 1.0)]).unwrap();
        store.append_split_results(&[split_result(0, 1.0)]).unwrap();

        let reopened = OnDiskResultStore::new(dir.path());
        let params = split_result(1, 1.0).parameters;
        assert!(reopened.find_split_result(1, &params).unwrap().is_some());
        assert!(reopened.find_split_result(2, &params).unwrap().is_none());
        let stored: Vec<SplitResult> = read_json(&dir.path().join(PER_SPLIT_RESULTS_FILE)).unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn test_aggregated_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = OnDiskResultStore::new(dir.path());
        assert!(store
            .append_aggregated_result(&aggregate_point_results(&[split_result(0, 1.0)]).unwrap())
            .is_err());
        store.init_result_file(Some(5), 2, 3, "R2", None).unwrap();
        let agg = aggregate_point_results(&[split_result(0, 1.0), split_result(1, 1.0)]).unwrap();
        store.append_aggregated_result(&agg).unwrap();
        store.append_aggregated_result(&agg).unwrap();
        store.update_final_grid_size().unwrap();

        let raw: serde_json::Value = read_json(&dir.path().join(AGGREGATED_RESULTS_FILE)).unwrap();
        assert_eq!(raw["gridSize"], 1);
        assert_eq!(raw["nSplits"], 3);
        assert_eq!(raw["gridPoints"][0]["testScoreGibMean"], 0.5);
    }
}
