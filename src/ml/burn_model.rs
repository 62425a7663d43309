//! burn バックエンドによる `ClassifierModel` 実装とモデルファイルの入出力

use std::path::{Path, PathBuf};

use burn::{
    module::{AutodiffModule, Module},
    optim::{GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use tracing::info;

use crate::data::Batch;
use crate::error::{Error, Result};
use crate::ml::ml_model::{CnnClassifier, ModelConfig};
use crate::model::config::TrainingConfig;
use crate::model::{load_model_with_metadata, log_metadata_info, save_model_with_metadata, ModelMetadata};
use crate::training::{ClassifierModel, StepOutput};

/// Adam の既定学習率
pub const DEFAULT_LEARNING_RATE: f64 = 1e-3;

type ModelRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// モデルの重みをバイト列にする
fn model_to_bytes<B: Backend>(model: &CnnClassifier<B>) -> Result<Vec<u8>> {
    let recorder = ModelRecorder::default();
    Recorder::<B>::record(&recorder, model.clone().into_record(), ())
        .map_err(|e| Error::model(format!("モデル重みの書き出しエラー: {:?}", e)))
}

/// モデルファイル (tar.gz) を読み込んでCNNを復元する
pub fn load_classifier<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(CnnClassifier<B>, ModelMetadata)> {
    let (metadata, model_binary) = load_model_with_metadata(path)?;
    log_metadata_info(&metadata);

    let model = ModelConfig::from_image_size(metadata.num_classes(), metadata.image_size())
        .init::<B>(device)?;

    let recorder = ModelRecorder::default();
    let record = Recorder::<B>::load(&recorder, model_binary, device)
        .map_err(|e| Error::model(format!("モデル重みの読み込みエラー: {:?}", e)))?;

    Ok((model.load_record(record), metadata))
}

/// 未学習のベースモデルを作成して `updated_base_model_path` に保存する
pub fn prepare_base_model<B: Backend>(
    config: &TrainingConfig,
    class_labels: Vec<String>,
    device: &B::Device,
) -> Result<PathBuf> {
    let image_size = config.params_image_size();
    let model = ModelConfig::from_image_size(class_labels.len(), image_size).init::<B>(device)?;
    let metadata = ModelMetadata::new(class_labels, image_size, 0);

    let path = config.updated_base_model_path().to_path_buf();
    save_model_with_metadata(&path, &metadata, &model_to_bytes(&model)?)?;
    info!(
        "ベースモデルを保存しました: {} (クラス: {})",
        path.display(),
        metadata.class_labels.join(", ")
    );
    Ok(path)
}

/// バッチをテンソルに変換する
fn batch_tensors<B: Backend>(
    batch: &Batch,
    device: &B::Device,
) -> (Tensor<B, 4>, Tensor<B, 1, Int>) {
    let n = batch.len();
    let images = Tensor::<B, 1>::from_floats(batch.images.as_slice(), device)
        .reshape([n, batch.channels, batch.height, batch.width]);
    let targets: Vec<i64> = batch.labels.iter().map(|&l| l as i64).collect();
    let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), device);
    (images, targets)
}

/// 損失と正解数を取り出す
fn step_output<B: Backend>(
    loss: Tensor<B, 1>,
    output: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> StepOutput {
    let [n, _] = output.dims();
    let loss = loss.into_scalar().elem::<f64>();
    let correct = output
        .argmax(1)
        .reshape([n])
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();
    StepOutput {
        loss,
        correct: correct.max(0) as usize,
        count: n,
    }
}

/// 学習可能なCNN（オプティマイザ付き）
pub struct BurnClassifier<B: AutodiffBackend, O> {
    /// `Optimizer::step` が所有権を取るため一時的に空になる
    model: Option<CnnClassifier<B>>,
    optim: O,
    learning_rate: f64,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B, O> BurnClassifier<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<CnnClassifier<B>, B>,
{
    /// ベースモデルを読み込む。`learning_rate` 省略時は `DEFAULT_LEARNING_RATE`
    pub fn load(
        path: &Path,
        device: &B::Device,
        optim: O,
        learning_rate: Option<f64>,
        num_epochs: usize,
    ) -> Result<Self> {
        let (model, mut metadata) = load_classifier::<B>(path, device)?;
        metadata.num_epochs = num_epochs as u32;
        Ok(Self {
            model: Some(model),
            optim,
            learning_rate: learning_rate.unwrap_or(DEFAULT_LEARNING_RATE),
            metadata,
            device: device.clone(),
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn model(&self) -> Result<&CnnClassifier<B>> {
        self.model
            .as_ref()
            .ok_or_else(|| Error::model("model was lost during a failed optimizer step"))
    }

    /// 入力サイズとラベル範囲をモデルに照らして確認する
    fn check_batch(&self, batch: &Batch) -> Result<()> {
        let expected = self.metadata.image_size();
        if (batch.width, batch.height, batch.channels)
            != (expected.width as usize, expected.height as usize, expected.channels as usize)
        {
            return Err(Error::model(format!(
                "batch shape {}x{}x{} does not match model input {}",
                batch.width, batch.height, batch.channels, expected
            )));
        }
        let num_classes = self.metadata.num_classes();
        if let Some(label) = batch.labels.iter().find(|&&l| l >= num_classes) {
            return Err(Error::dataset(format!(
                "label {} is out of range for a model with {} classes",
                label, num_classes
            )));
        }
        Ok(())
    }
}

impl<B, O> ClassifierModel for BurnClassifier<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<CnnClassifier<B>, B>,
{
    fn train_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        self.check_batch(batch)?;
        let model = self
            .model
            .take()
            .ok_or_else(|| Error::model("model was lost during a failed optimizer step"))?;

        let (images, targets) = batch_tensors::<B>(batch, &self.device);
        let (loss, output) = model.forward_loss(images, targets.clone());
        let step = step_output(loss.clone(), output, targets);

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        self.model = Some(self.optim.step(self.learning_rate, model, grads));
        Ok(step)
    }

    fn eval_step(&self, batch: &Batch) -> Result<StepOutput> {
        self.check_batch(batch)?;
        let model = self.model()?.valid();
        let (images, targets) = batch_tensors::<B::InnerBackend>(batch, &self.device);
        let (loss, output) = model.forward_loss(images, targets.clone());
        Ok(step_output(loss, output, targets))
    }

    fn save(&self, path: &Path) -> Result<()> {
        let bytes = model_to_bytes(self.model()?)?;
        let mut metadata = self.metadata.clone();
        metadata.trained_at = chrono::Local::now().to_rfc3339();
        save_model_with_metadata(path, &metadata, &bytes)?;
        Ok(())
    }
}
