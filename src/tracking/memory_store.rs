//! メモリ上のトラッキングストア（テスト・ドライラン用）

use std::collections::BTreeMap;
use std::path::Path;

use super::{Result, RunRecord, RunStatus, TrackingBackend, TrackingError};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    runs: BTreeMap<String, RunRecord>,
    next_run_id: u64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 作成順のラン一覧
    pub fn runs(&self) -> Vec<&RunRecord> {
        self.runs.values().collect()
    }

    pub fn run(&self, run_id: &str) -> Option<&RunRecord> {
        self.runs.get(run_id)
    }

    fn record_mut(&mut self, run_id: &str) -> Result<&mut RunRecord> {
        self.runs
            .get_mut(run_id)
            .ok_or_else(|| TrackingError::RunNotFound(run_id.to_string()))
    }
}

impl TrackingBackend for InMemoryStore {
    fn create_run(&mut self, experiment_name: &str, run_name: Option<&str>) -> Result<String> {
        self.next_run_id += 1;
        let run_id = format!("run-{:04}", self.next_run_id);
        let record = RunRecord::new(
            run_id.clone(),
            run_name.map(String::from),
            experiment_name.to_string(),
        );
        self.runs.insert(run_id.clone(), record);
        Ok(run_id)
    }

    fn log_param(&mut self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.record_mut(run_id)?
            .params
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn log_metric(&mut self, run_id: &str, key: &str, value: f64, step: u64) -> Result<()> {
        self.record_mut(run_id)?.push_metric(key, value, step);
        Ok(())
    }

    fn log_artifact(&mut self, run_id: &str, artifact_path: &str, local_path: &Path) -> Result<()> {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.record_mut(run_id)?
            .artifacts
            .push(format!("{artifact_path}/{file_name}"));
        Ok(())
    }

    fn register_model(&mut self, run_id: &str, _artifact_path: &str, name: &str) -> Result<()> {
        self.record_mut(run_id)?.registered_model = Some(name.to_string());
        Ok(())
    }

    fn end_run(&mut self, run_id: &str, status: RunStatus) -> Result<()> {
        self.record_mut(run_id)?.finish(status);
        Ok(())
    }
}
