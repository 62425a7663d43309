//! 腎臓CT画像分類器のコマンドライン
//!
//! ```text
//! cnn_classifier prepare            # 学習データのクラス構成からベースモデルを作成
//! cnn_classifier train              # 学習してトラッキングに記録
//! cnn_classifier predict <IMAGE>    # 1枚の画像を分類
//! cnn_classifier runs               # ローカルストアのラン一覧
//! cnn_classifier init-config        # 現在の設定をJSONに書き出す
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use cnn_classifier_lib::logging;
use cnn_classifier_lib::model::config::{AppConfig, DeviceType, TrackingSettings};
use cnn_classifier_lib::tracking::{FileStore, TrackingTarget};

#[derive(Parser, Debug)]
#[command(name = "cnn_classifier", version, about = "Kidney CT image classifier")]
struct Cli {
    /// 設定ファイル (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 計算デバイスを上書きする
    #[arg(long, global = true, value_enum)]
    device: Option<DeviceArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum DeviceArg {
    Wgpu,
    Cpu,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// ベースモデルを作成する
    Prepare,
    /// モデルを学習する
    Train,
    /// 画像を分類する
    Predict {
        /// 分類する画像
        image: PathBuf,
        /// モデルファイル（省略時は設定の prediction.model_path）
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
    /// ローカルストアに記録されたランを表示する
    Runs {
        /// 実験名（省略時は設定の実験名）
        #[arg(short, long)]
        experiment: Option<String>,
    },
    /// 現在の設定を書き出す
    InitConfig,
}

fn load_config(cli: &Cli) -> (AppConfig, PathBuf) {
    let path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&path);
    config.tracking = TrackingSettings::from_env(&config.tracking);
    if let Some(device) = cli.device {
        config.device_type = match device {
            DeviceArg::Wgpu => DeviceType::Wgpu,
            DeviceArg::Cpu => DeviceType::Cpu,
        };
    }
    (config, path)
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let (level, log_file) = logging::settings_from_env();
    let _guard = logging::init(&level, &log_file)?;

    let cli = Cli::parse();
    let (config, config_path) = load_config(&cli);

    match &cli.command {
        Command::Prepare => {
            config.log_summary();
            let path = backend::prepare(&config)?;
            info!("ベースモデル: {}", path.display());
        }
        Command::Train => {
            config.log_summary();
            let summary = backend::train(&config)?;
            println!("run_id: {}", summary.run_id);
            println!("{}", summary.final_metrics);
            println!("model: {}", summary.trained_model_path.display());
        }
        Command::Predict { image, model } => {
            let model_path = model
                .clone()
                .unwrap_or_else(|| config.prediction.model_path.clone());
            let prediction = backend::predict(&config, &model_path, image)?;
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
        Command::Runs { experiment } => {
            list_runs(&config, experiment.as_deref())?;
        }
        Command::InitConfig => {
            config
                .save(&config_path)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            info!("設定ファイルを書き出しました: {}", config_path.display());
        }
    }

    Ok(())
}

fn list_runs(config: &AppConfig, experiment: Option<&str>) -> Result<()> {
    let root = match TrackingTarget::from_settings(&config.tracking)? {
        TrackingTarget::Local { root } => root,
        TrackingTarget::Remote { uri, .. } => {
            anyhow::bail!("runs are stored on the tracking server: {}", uri)
        }
    };
    let experiment = experiment.unwrap_or(&config.tracking.experiment_name);
    let runs = FileStore::new(&root).list_runs(experiment)?;
    if runs.is_empty() {
        println!("no runs in experiment '{}' under {}", experiment, root.display());
        return Ok(());
    }

    let metric = format!("final_val_{}", config.training.accuracy_metric_name);
    for run in runs {
        let accuracy = run
            .latest_metric(&metric)
            .map(|v| format!("{:.4}", v))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<9}  {}={}  params={}",
            run.run_id,
            run.status.as_str(),
            metric,
            accuracy,
            run.params.len()
        );
    }
    Ok(())
}

#[cfg(feature = "ml")]
mod backend {
    use std::path::{Path, PathBuf};

    use anyhow::Result;
    use burn::backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu};

    use cnn_classifier_lib::ml::{pipeline, Prediction};
    use cnn_classifier_lib::model::config::{AppConfig, DeviceType};
    use cnn_classifier_lib::training::TrainingSummary;

    pub fn prepare(config: &AppConfig) -> Result<PathBuf> {
        Ok(match config.device_type {
            DeviceType::Wgpu => pipeline::prepare::<Wgpu>(config, &WgpuDevice::default())?,
            DeviceType::Cpu => pipeline::prepare::<NdArray>(config, &NdArrayDevice::Cpu)?,
        })
    }

    pub fn train(config: &AppConfig) -> Result<TrainingSummary> {
        Ok(match config.device_type {
            DeviceType::Wgpu => {
                pipeline::train::<Autodiff<Wgpu>>(config, &WgpuDevice::default())?
            }
            DeviceType::Cpu => pipeline::train::<Autodiff<NdArray>>(config, &NdArrayDevice::Cpu)?,
        })
    }

    pub fn predict(config: &AppConfig, model: &Path, image: &Path) -> Result<Prediction> {
        Ok(match config.device_type {
            DeviceType::Wgpu => pipeline::predict::<Wgpu>(model, image, &WgpuDevice::default())?,
            DeviceType::Cpu => pipeline::predict::<NdArray>(model, image, &NdArrayDevice::Cpu)?,
        })
    }
}

#[cfg(not(feature = "ml"))]
mod backend {
    use std::path::{Path, PathBuf};

    use anyhow::{bail, Result};

    use cnn_classifier_lib::model::config::AppConfig;
    use cnn_classifier_lib::training::TrainingSummary;

    const DISABLED: &str = "built without the `ml` feature";

    pub fn prepare(_config: &AppConfig) -> Result<PathBuf> {
        bail!(DISABLED)
    }

    pub fn train(_config: &AppConfig) -> Result<TrainingSummary> {
        bail!(DISABLED)
    }

    pub fn predict(_config: &AppConfig, _model: &Path, _image: &Path) -> Result<serde_json::Value> {
        bail!(DISABLED)
    }
}
