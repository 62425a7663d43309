//! モデル推論機能

use std::path::Path;

use burn::tensor::{activation::softmax, backend::Backend, Tensor};
use serde::Serialize;
use tracing::debug;

use crate::data::{load_image, RESCALE};
use crate::error::{Error, Result};
use crate::ml::burn_model::load_classifier;
use crate::ml::ml_model::CnnClassifier;
use crate::model::ModelMetadata;
use crate::types::Interpolation;

/// 1枚分の推論結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub class_index: usize,
    /// softmax後の確率
    pub confidence: f32,
}

/// 学習済みモデルで画像を分類する
///
/// 前処理は検証用と同じ（リサイズ + 1/255）。
pub struct PredictionPipeline<B: Backend> {
    model: CnnClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> PredictionPipeline<B> {
    /// モデルを読み込んで推論パイプラインを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: &B::Device) -> Result<Self> {
        let (model, metadata) = load_classifier::<B>(model_path.as_ref(), device)?;
        Ok(Self {
            model,
            metadata,
            device: device.clone(),
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn class_labels(&self) -> &[String] {
        &self.metadata.class_labels
    }

    /// 単一画像を分類
    pub fn predict<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let size = self.metadata.image_size();
        let image_data = load_image(
            image_path.as_ref(),
            size,
            Interpolation::default(),
            RESCALE,
        )?;

        let tensor = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device).reshape([
            1,
            size.channels as usize,
            size.height as usize,
            size.width as usize,
        ]);

        let probabilities = softmax(self.model.forward(tensor), 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::model(format!("推論結果の取得エラー: {:?}", e)))?;

        let (class_index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| Error::model("model produced no outputs"))?;

        let label = self
            .metadata
            .class_labels
            .get(class_index)
            .cloned()
            .ok_or_else(|| {
                Error::model(format!("クラスインデックス {} は範囲外です", class_index))
            })?;

        debug!(
            "{} -> {} ({:.3})",
            image_path.as_ref().display(),
            label,
            confidence
        );
        Ok(Prediction {
            label,
            class_index,
            confidence,
        })
    }

    /// 複数画像をまとめて分類
    pub fn predict_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        image_paths.iter().map(|p| self.predict(p)).collect()
    }
}
