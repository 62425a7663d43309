//! 設定から学習・ベースモデル作成・推論までを組み立てる

use std::path::{Path, PathBuf};

use burn::{
    optim::AdamConfig,
    tensor::backend::{AutodiffBackend, Backend},
};
use tracing::info;

use crate::data::ImageDirectory;
use crate::error::Result;
use crate::ml::burn_model::{prepare_base_model, BurnClassifier};
use crate::ml::inference::{Prediction, PredictionPipeline};
use crate::ml::ml_model::CnnClassifier;
use crate::model::config::AppConfig;
use crate::tracking::ExperimentLogger;
use crate::training::{Trainer, TrainingSummary};

/// 学習データのクラス構成からベースモデルを作る
pub fn prepare<B: Backend>(config: &AppConfig, device: &B::Device) -> Result<PathBuf> {
    let training = config.training_config();
    let directory = ImageDirectory::scan(training.training_data())?;
    info!(
        "{} クラスを検出しました: {}",
        directory.num_classes(),
        directory.class_names().join(", ")
    );
    prepare_base_model::<B>(&training, directory.class_names().to_vec(), device)
}

/// ベースモデルを読み込んで学習し、トラッキングに記録する
pub fn train<B: AutodiffBackend>(config: &AppConfig, device: &B::Device) -> Result<TrainingSummary> {
    let training = config.training_config();
    let logger = ExperimentLogger::configure(&config.tracking)?;

    let mut trainer = Trainer::new(training.clone(), logger);
    trainer.load_model(|path| {
        BurnClassifier::<B, _>::load(
            path,
            device,
            AdamConfig::new().init::<B, CnnClassifier<B>>(),
            training.params_learning_rate(),
            training.params_epochs(),
        )
    })?;
    trainer.prepare_generators()?;
    let summary = trainer.train()?;

    info!(
        "学習完了: run_id={}, {}",
        summary.run_id, summary.final_metrics
    );
    Ok(summary)
}

/// 1枚の画像を分類する
pub fn predict<B: Backend>(
    model_path: &Path,
    image_path: &Path,
    device: &B::Device,
) -> Result<Prediction> {
    let pipeline = PredictionPipeline::<B>::load(model_path, device)?;
    pipeline.predict(image_path)
}
