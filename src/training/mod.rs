//! 学習ループと状態管理

pub mod metrics;
pub mod trainer;

use std::path::Path;

use crate::data::Batch;
use crate::error::Result;

pub use metrics::{EpochMetrics, MetricAccumulator, StepOutput};
pub use trainer::{EpochSteps, Trainer, TrainerState, TrainingSummary, MODEL_ARTIFACT_PATH};

/// 学習対象の分類モデル
///
/// バックエンド（burn など）の詳細はこのトレイトの実装側に閉じ込める。
pub trait ClassifierModel {
    /// 1バッチ分の順伝播・逆伝播・パラメータ更新
    fn train_step(&mut self, batch: &Batch) -> Result<StepOutput>;

    /// パラメータを更新せずに評価する
    fn eval_step(&self, batch: &Batch) -> Result<StepOutput>;

    /// モデルを `path` に書き出す
    fn save(&self, path: &Path) -> Result<()>;
}
