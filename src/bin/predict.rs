//! 画像を分類するバイナリ

use std::path::PathBuf;

use anyhow::Result;
use burn::backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, NdArray, Wgpu};
use clap::Parser;

use cnn_classifier_lib::logging;
use cnn_classifier_lib::ml::PredictionPipeline;
use cnn_classifier_lib::model::config::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "predict", about = "Classify CT images with a trained model")]
struct Args {
    /// 分類する画像（複数可）
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// モデルファイル（省略時は設定の prediction.model_path）
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// 設定ファイル (JSON)
    #[arg(short, long, default_value_os_t = AppConfig::default_path())]
    config: PathBuf,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let (level, log_file) = logging::settings_from_env();
    let _guard = logging::init(&level, &log_file)?;

    let args = Args::parse();
    let config = AppConfig::load_or_default(&args.config);
    let model_path = args.model.unwrap_or(config.prediction.model_path);

    let predictions = match config.device_type {
        DeviceType::Wgpu => PredictionPipeline::<Wgpu>::load(&model_path, &WgpuDevice::default())?
            .predict_batch(&args.images)?,
        DeviceType::Cpu => PredictionPipeline::<NdArray>::load(&model_path, &NdArrayDevice::Cpu)?
            .predict_batch(&args.images)?,
    };

    for (path, prediction) in args.images.iter().zip(predictions) {
        println!(
            "{}\t{}\t{:.4}",
            path.display(),
            prediction.label,
            prediction.confidence
        );
    }
    Ok(())
}
