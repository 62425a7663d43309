//! 実験トラッキング
//!
//! - [`ExperimentLogger`]: ランのライフサイクル、パラメータ・メトリクス記録、条件付きモデル登録
//! - [`TrackingBackend`]: 保存先の抽象（ローカルファイル / MLflow REST / メモリ）
//! - [`RunContext`]: `start_run` が返すランのハンドル。以降の記録はこのハンドル経由で行う

pub mod experiment_logger;
pub mod file_store;
pub mod memory_store;
pub mod rest_client;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use experiment_logger::{Credentials, ExperimentLogger, ModelLogOutcome, RunContext, TrackingTarget};
pub use file_store::FileStore;
pub use memory_store::InMemoryStore;
pub use rest_client::RestClient;

/// トラッキング処理のエラー
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("A run is already active: {0}")]
    RunAlreadyActive(String),

    #[error("Run is not active: {0}")]
    RunNotActive(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid tracking URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tracking server returned {status}: {code} {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrackingError>;

/// ランの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// メトリクスの1点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    #[serde(with = "metric_value")]
    pub value: f64,
    pub step: u64,
    pub timestamp_ms: i64,
}

/// 1回の学習に対応するランの記録
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub run_name: Option<String>,
    pub experiment_name: String,
    pub status: RunStatus,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, Vec<MetricEntry>>,
    pub artifacts: Vec<String>,
    /// 登録済みモデル名（登録しなかった場合は `None`）
    pub registered_model: Option<String>,
    pub start_time_ms: i64,
    pub end_time_ms: Option<i64>,
}

impl RunRecord {
    pub fn new(run_id: String, run_name: Option<String>, experiment_name: String) -> Self {
        Self {
            run_id,
            run_name,
            experiment_name,
            status: RunStatus::Running,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            artifacts: Vec::new(),
            registered_model: None,
            start_time_ms: now_ms(),
            end_time_ms: None,
        }
    }

    /// 指定キーの最新値
    pub fn latest_metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).and_then(|v| v.last()).map(|e| e.value)
    }

    fn push_metric(&mut self, key: &str, value: f64, step: u64) {
        self.metrics.entry(key.to_string()).or_default().push(MetricEntry {
            value,
            step,
            timestamp_ms: now_ms(),
        });
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.end_time_ms = Some(now_ms());
    }
}

/// トラッキングバックエンドの機能インターフェース
pub trait TrackingBackend {
    /// ランを作成してIDを返す
    fn create_run(&mut self, experiment_name: &str, run_name: Option<&str>) -> Result<String>;

    fn log_param(&mut self, run_id: &str, key: &str, value: &str) -> Result<()>;

    fn log_metric(&mut self, run_id: &str, key: &str, value: f64, step: u64) -> Result<()>;

    /// ローカルファイルを `artifact_path` 配下のアーティファクトとして記録する
    fn log_artifact(&mut self, run_id: &str, artifact_path: &str, local_path: &Path) -> Result<()>;

    /// 記録済みアーティファクトをモデルとして `name` で登録する
    fn register_model(&mut self, run_id: &str, artifact_path: &str, name: &str) -> Result<()>;

    fn end_run(&mut self, run_id: &str, status: RunStatus) -> Result<()>;
}

impl<T: TrackingBackend + ?Sized> TrackingBackend for Box<T> {
    fn create_run(&mut self, experiment_name: &str, run_name: Option<&str>) -> Result<String> {
        (**self).create_run(experiment_name, run_name)
    }

    fn log_param(&mut self, run_id: &str, key: &str, value: &str) -> Result<()> {
        (**self).log_param(run_id, key, value)
    }

    fn log_metric(&mut self, run_id: &str, key: &str, value: f64, step: u64) -> Result<()> {
        (**self).log_metric(run_id, key, value, step)
    }

    fn log_artifact(&mut self, run_id: &str, artifact_path: &str, local_path: &Path) -> Result<()> {
        (**self).log_artifact(run_id, artifact_path, local_path)
    }

    fn register_model(&mut self, run_id: &str, artifact_path: &str, name: &str) -> Result<()> {
        (**self).register_model(run_id, artifact_path, name)
    }

    fn end_run(&mut self, run_id: &str, status: RunStatus) -> Result<()> {
        (**self).end_run(run_id, status)
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 衝突しにくいランID（時刻 + 乱数の16進）
pub(crate) fn new_run_id() -> String {
    format!("{:012x}{:08x}", now_ms(), rand::random::<u32>())
}

/// メトリクス値のJSON表現
///
/// 発散した損失などの非有限値は JSON の数値にできないため、
/// `"NaN"` / `"Infinity"` / `"-Infinity"` の文字列で書き出す（MLflow のJSON表現と同じ）。
pub(crate) mod metric_value {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    fn non_finite_name(value: f64) -> Option<&'static str> {
        if value.is_nan() {
            Some(NAN)
        } else if value == f64::INFINITY {
            Some(INFINITY)
        } else if value == f64::NEG_INFINITY {
            Some(NEG_INFINITY)
        } else {
            None
        }
    }

    pub fn to_json(value: f64) -> Value {
        match non_finite_name(value) {
            Some(name) => Value::from(name),
            None => Value::from(value),
        }
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        match non_finite_name(*value) {
            Some(name) => serializer.serialize_str(name),
            None => serializer.serialize_f64(*value),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(text) => match text.as_str() {
                NAN => Ok(f64::NAN),
                INFINITY => Ok(f64::INFINITY),
                NEG_INFINITY => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "invalid metric value: {other}"
                ))),
            },
        }
    }
}
