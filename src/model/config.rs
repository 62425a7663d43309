//! アプリケーション設定管理モジュール
//!
//! 学習パラメータ・トラッキング設定・推論設定をJSON形式で保存・読み込みします。
//! 学習時には [`AppConfig::training_config`] で不変の [`TrainingConfig`] を取り出して使います。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::types::ImageSize;

/// 登録モデル名のデフォルト
pub const DEFAULT_REGISTERED_MODEL_NAME: &str = "KidneyDiseaseModel";

/// 精度メトリクス名のデフォルト
pub const DEFAULT_ACCURACY_METRIC: &str = "accuracy";

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// トレーニング設定（JSON上の可変表現）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// 学習開始時に読み込むベースモデル
    pub updated_base_model_path: PathBuf,
    /// 学習済みモデルの保存先
    pub trained_model_path: PathBuf,
    /// クラスごとのサブディレクトリを持つ学習データ
    pub training_data: PathBuf,
    pub image_size: ImageSize,
    pub batch_size: usize,
    pub epochs: usize,
    pub is_augmentation: bool,
    /// 未指定の場合はパラメータに "default" を記録する
    #[serde(default)]
    pub learning_rate: Option<f64>,
    /// モデルが出力する精度メトリクスの名前
    #[serde(default = "default_accuracy_metric")]
    pub accuracy_metric_name: String,
    #[serde(default = "default_registered_model_name")]
    pub registered_model_name: String,
    /// 何エポックごとに検証するか
    #[serde(default = "default_validation_freq")]
    pub validation_freq: usize,
    /// 学習データのシャッフル・オーグメンテーション用シード
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_accuracy_metric() -> String {
    DEFAULT_ACCURACY_METRIC.to_string()
}

fn default_registered_model_name() -> String {
    DEFAULT_REGISTERED_MODEL_NAME.to_string()
}

fn default_validation_freq() -> usize {
    1
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            updated_base_model_path: PathBuf::from(
                "artifacts/prepare_base_model/base_model_updated.tar.gz",
            ),
            trained_model_path: PathBuf::from("artifacts/training/model.tar.gz"),
            training_data: PathBuf::from("artifacts/data_ingestion/kidney-ct-scan-image"),
            image_size: ImageSize::new(224, 224, 3),
            batch_size: 16,
            epochs: 1,
            is_augmentation: true,
            learning_rate: None,
            accuracy_metric_name: default_accuracy_metric(),
            registered_model_name: default_registered_model_name(),
            validation_freq: default_validation_freq(),
            seed: None,
        }
    }
}

/// トラッキング設定
///
/// 環境変数は [`TrackingSettings::from_env`] でエントリポイントからのみ読み込み、
/// ライブラリには値として注入する。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSettings {
    /// 未設定の場合はローカルファイルストアを使用
    #[serde(default)]
    pub tracking_uri: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub experiment_name: String,
    /// URI未設定時のローカルストア
    pub local_store_dir: PathBuf,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            tracking_uri: None,
            username: None,
            password: None,
            experiment_name: "Default".to_string(),
            local_store_dir: PathBuf::from("mlruns"),
        }
    }
}

impl TrackingSettings {
    /// `MLFLOW_*` 環境変数で上書きした設定を返す
    pub fn from_env(base: &TrackingSettings) -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());

        Self {
            tracking_uri: var("MLFLOW_TRACKING_URI").or_else(|| base.tracking_uri.clone()),
            username: var("MLFLOW_TRACKING_USERNAME").or_else(|| base.username.clone()),
            password: var("MLFLOW_TRACKING_PASSWORD").or_else(|| base.password.clone()),
            experiment_name: var("MLFLOW_EXPERIMENT_NAME")
                .unwrap_or_else(|| base.experiment_name.clone()),
            local_store_dir: base.local_store_dir.clone(),
        }
    }
}

/// 推論設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSettings {
    /// 推論に使うモデルファイル
    pub model_path: PathBuf,
}

impl Default for PredictionSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("artifacts/training/model.tar.gz"),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// トラッキング設定
    #[serde(default)]
    pub tracking: TrackingSettings,
    /// 推論設定
    #[serde(default)]
    pub prediction: PredictionSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config/config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない・読めない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 学習用の不変設定を取り出す
    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig::from(&self.training)
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        info!("計算デバイス: {}", self.device_type);
        info!("ベースモデル: {}", self.training.updated_base_model_path.display());
        info!("学習データ: {}", self.training.training_data.display());
        info!(
            "画像サイズ: {}, バッチサイズ: {}, エポック数: {}, オーグメンテーション: {}",
            self.training.image_size,
            self.training.batch_size,
            self.training.epochs,
            self.training.is_augmentation
        );
        info!("実験名: {}", self.tracking.experiment_name);
    }
}

/// 学習用の不変設定
///
/// 学習開始前に一度だけ構築し、以降は読み取り専用で共有する。
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    updated_base_model_path: PathBuf,
    trained_model_path: PathBuf,
    training_data: PathBuf,
    params_image_size: ImageSize,
    params_batch_size: usize,
    params_epochs: usize,
    params_is_augmentation: bool,
    params_learning_rate: Option<f64>,
    accuracy_metric_name: String,
    registered_model_name: String,
    validation_freq: usize,
    seed: Option<u64>,
}

impl From<&TrainingSettings> for TrainingConfig {
    fn from(s: &TrainingSettings) -> Self {
        Self {
            updated_base_model_path: s.updated_base_model_path.clone(),
            trained_model_path: s.trained_model_path.clone(),
            training_data: s.training_data.clone(),
            params_image_size: s.image_size,
            params_batch_size: s.batch_size,
            params_epochs: s.epochs,
            params_is_augmentation: s.is_augmentation,
            params_learning_rate: s.learning_rate,
            accuracy_metric_name: s.accuracy_metric_name.clone(),
            registered_model_name: s.registered_model_name.clone(),
            validation_freq: s.validation_freq.max(1),
            seed: s.seed,
        }
    }
}

impl TrainingConfig {
    pub fn updated_base_model_path(&self) -> &Path {
        &self.updated_base_model_path
    }

    pub fn trained_model_path(&self) -> &Path {
        &self.trained_model_path
    }

    pub fn training_data(&self) -> &Path {
        &self.training_data
    }

    pub fn params_image_size(&self) -> ImageSize {
        self.params_image_size
    }

    pub fn params_batch_size(&self) -> usize {
        self.params_batch_size
    }

    pub fn params_epochs(&self) -> usize {
        self.params_epochs
    }

    pub fn params_is_augmentation(&self) -> bool {
        self.params_is_augmentation
    }

    pub fn params_learning_rate(&self) -> Option<f64> {
        self.params_learning_rate
    }

    pub fn accuracy_metric_name(&self) -> &str {
        &self.accuracy_metric_name
    }

    pub fn registered_model_name(&self) -> &str {
        &self.registered_model_name
    }

    pub fn validation_freq(&self) -> usize {
        self.validation_freq
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}
