//! 学習のみを実行するバイナリ
//!
//! `cnn_classifier train` と同じ処理を、設定ファイルのパスだけを引数に取って行う。

#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::Result;
use burn::backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu};
use clap::Parser;

use cnn_classifier_lib::logging;
use cnn_classifier_lib::ml::pipeline;
use cnn_classifier_lib::model::config::{AppConfig, DeviceType, TrackingSettings};

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train the kidney CT classifier")]
struct Args {
    /// 設定ファイル (JSON)
    #[arg(default_value_os_t = AppConfig::default_path())]
    config: PathBuf,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let (level, log_file) = logging::settings_from_env();
    let _guard = logging::init(&level, &log_file)?;

    let args = Args::parse();
    let mut config = AppConfig::load_or_default(&args.config);
    config.tracking = TrackingSettings::from_env(&config.tracking);
    config.log_summary();

    let summary = match config.device_type {
        DeviceType::Wgpu => pipeline::train::<Autodiff<Wgpu>>(&config, &WgpuDevice::default())?,
        DeviceType::Cpu => pipeline::train::<Autodiff<NdArray>>(&config, &NdArrayDevice::Cpu)?,
    };

    println!("run_id: {}", summary.run_id);
    println!("{}", summary.final_metrics);
    Ok(())
}
