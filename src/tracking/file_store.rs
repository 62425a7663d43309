//! ローカルファイルのトラッキングストア
//!
//! ディレクトリ構成:
//! - `<root>/<experiment>/<run_id>/run.json`   - ランの記録（更新のたびに書き直す）
//! - `<root>/<experiment>/<run_id>/artifacts/` - アーティファクトのコピー

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{new_run_id, Result, RunRecord, RunStatus, TrackingBackend, TrackingError};

const RUN_FILE: &str = "run.json";

#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// 実行中のラン（run_id -> 記録）
    open_runs: HashMap<String, RunRecord>,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            open_runs: HashMap::new(),
        }
    }

    fn run_dir(&self, experiment_name: &str, run_id: &str) -> PathBuf {
        self.root.join(experiment_name).join(run_id)
    }

    fn persist(&self, record: &RunRecord) -> Result<()> {
        let dir = self.run_dir(&record.experiment_name, &record.run_id);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(record)?;
        let tmp = dir.join("run.json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, dir.join(RUN_FILE))?;
        Ok(())
    }

    /// 記録を更新して即座に書き出す
    fn update<F>(&mut self, run_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut RunRecord),
    {
        let record = self
            .open_runs
            .get_mut(run_id)
            .ok_or_else(|| TrackingError::RunNotActive(run_id.to_string()))?;
        f(record);
        let record = record.clone();
        self.persist(&record)
    }

    /// 保存済みのランを読み込む
    pub fn load_run(&self, experiment_name: &str, run_id: &str) -> Result<RunRecord> {
        let path = self.run_dir(experiment_name, run_id).join(RUN_FILE);
        if !path.exists() {
            return Err(TrackingError::RunNotFound(run_id.to_string()));
        }
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// 実験内のラン一覧（開始時刻順）
    pub fn list_runs(&self, experiment_name: &str) -> Result<Vec<RunRecord>> {
        let dir = self.root.join(experiment_name);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path().join(RUN_FILE);
            if path.is_file() {
                let json = fs::read_to_string(&path)?;
                runs.push(serde_json::from_str::<RunRecord>(&json)?);
            }
        }
        runs.sort_by(|a, b| {
            a.start_time_ms
                .cmp(&b.start_time_ms)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }
}

impl TrackingBackend for FileStore {
    fn create_run(&mut self, experiment_name: &str, run_name: Option<&str>) -> Result<String> {
        let run_id = new_run_id();
        let record = RunRecord::new(
            run_id.clone(),
            run_name.map(String::from),
            experiment_name.to_string(),
        );
        self.persist(&record)?;
        debug!("ローカルランを作成: {}", self.run_dir(experiment_name, &run_id).display());
        self.open_runs.insert(run_id.clone(), record);
        Ok(run_id)
    }

    fn log_param(&mut self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.update(run_id, |r| {
            r.params.insert(key.to_string(), value.to_string());
        })
    }

    fn log_metric(&mut self, run_id: &str, key: &str, value: f64, step: u64) -> Result<()> {
        self.update(run_id, |r| r.push_metric(key, value, step))
    }

    fn log_artifact(&mut self, run_id: &str, artifact_path: &str, local_path: &Path) -> Result<()> {
        let experiment_name = self
            .open_runs
            .get(run_id)
            .map(|r| r.experiment_name.clone())
            .ok_or_else(|| TrackingError::RunNotActive(run_id.to_string()))?;

        let file_name = local_path
            .file_name()
            .ok_or_else(|| {
                TrackingError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("artifact has no file name: {}", local_path.display()),
                ))
            })?
            .to_string_lossy()
            .to_string();

        let dest_dir = self
            .run_dir(&experiment_name, run_id)
            .join("artifacts")
            .join(artifact_path);
        fs::create_dir_all(&dest_dir)?;
        fs::copy(local_path, dest_dir.join(&file_name))?;

        let relative = format!("{artifact_path}/{file_name}");
        self.update(run_id, |r| r.artifacts.push(relative))
    }

    fn register_model(&mut self, run_id: &str, _artifact_path: &str, name: &str) -> Result<()> {
        // ローカルストアにはモデルカタログが無いので名前だけ残す
        self.update(run_id, |r| r.registered_model = Some(name.to_string()))
    }

    fn end_run(&mut self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut record = self
            .open_runs
            .remove(run_id)
            .ok_or_else(|| TrackingError::RunNotActive(run_id.to_string()))?;
        record.finish(status);
        self.persist(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_is_written_after_each_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path());

        let run_id = store.create_run("exp", Some("first")).unwrap();
        store.log_param(&run_id, "epochs", "3").unwrap();
        store.log_metric(&run_id, "train_loss", 0.7, 0).unwrap();

        let record = store.load_run("exp", &run_id).unwrap();
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.params["epochs"], "3");
        assert_eq!(record.latest_metric("train_loss"), Some(0.7));
    }

    #[test]
    fn test_artifact_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.tar.gz");
        std::fs::write(&model, b"weights").unwrap();

        let mut store = FileStore::new(dir.path().join("mlruns"));
        let run_id = store.create_run("exp", None).unwrap();
        store.log_artifact(&run_id, "model", &model).unwrap();
        store.end_run(&run_id, RunStatus::Finished).unwrap();

        let copied = dir
            .path()
            .join("mlruns/exp")
            .join(&run_id)
            .join("artifacts/model/model.tar.gz");
        assert_eq!(std::fs::read(copied).unwrap(), b"weights");

        let record = store.load_run("exp", &run_id).unwrap();
        assert_eq!(record.artifacts, vec!["model/model.tar.gz"]);
        assert_eq!(record.status, RunStatus::Finished);
        assert!(record.end_time_ms.is_some());
    }

    #[test]
    fn test_closed_run_rejects_updates() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path());
        let run_id = store.create_run("exp", None).unwrap();
        store.end_run(&run_id, RunStatus::Failed).unwrap();

        let err = store.log_metric(&run_id, "loss", 1.0, 0).unwrap_err();
        assert!(matches!(err, TrackingError::RunNotActive(_)));
        assert_eq!(store.list_runs("exp").unwrap().len(), 1);
    }

    #[test]
    fn test_diverged_loss_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path());
        let run_id = store.create_run("exp", None).unwrap();
        store.log_metric(&run_id, "train_loss", f64::NAN, 0).unwrap();
        store.log_metric(&run_id, "train_loss", f64::INFINITY, 1).unwrap();
        store.end_run(&run_id, RunStatus::Finished).unwrap();

        let record = store.load_run("exp", &run_id).unwrap();
        let values: Vec<f64> = record.metrics["train_loss"].iter().map(|m| m.value).collect();
        assert!(values[0].is_nan());
        assert_eq!(values[1], f64::INFINITY);
        assert_eq!(store.list_runs("exp").unwrap().len(), 1);
    }

    #[test]
    fn test_list_runs_of_unknown_experiment() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.list_runs("nothing").unwrap().is_empty());
    }
}
