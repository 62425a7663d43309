//! 学習の状態遷移とフィットループ
//!
//! `Created → ModelLoaded → GeneratorsReady → Training → Saved` の順に一方向で進む。

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::data::{DataGenerator, DataPipeline};
use crate::error::{Error, Result};
use crate::model::config::TrainingConfig;
use crate::tracking::{
    ExperimentLogger, ModelLogOutcome, RunContext, TrackingBackend,
};
use crate::training::metrics::{EpochMetrics, MetricAccumulator};
use crate::training::ClassifierModel;

/// トラッキングに記録するモデルのアーティファクトパス
pub const MODEL_ARTIFACT_PATH: &str = "model";

/// Trainerの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Created,
    ModelLoaded,
    GeneratorsReady,
    Training,
    Saved,
}

impl TrainerState {
    fn name(self) -> &'static str {
        match self {
            TrainerState::Created => "Created",
            TrainerState::ModelLoaded => "ModelLoaded",
            TrainerState::GeneratorsReady => "GeneratorsReady",
            TrainerState::Training => "Training",
            TrainerState::Saved => "Saved",
        }
    }
}

/// 1エポックあたりのステップ数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSteps {
    pub steps_per_epoch: usize,
    pub validation_steps: usize,
}

impl EpochSteps {
    /// floor(サンプル数 / バッチサイズ)。どちらかが0なら設定エラー
    pub fn compute(train: &DataGenerator, valid: &DataGenerator) -> Result<Self> {
        let steps = Self {
            steps_per_epoch: train.steps(),
            validation_steps: valid.steps(),
        };
        if steps.steps_per_epoch == 0 || steps.validation_steps == 0 {
            return Err(Error::config(format!(
                "batch size {} yields zero steps ({} training / {} validation samples)",
                train.batch_size(),
                train.samples(),
                valid.samples()
            )));
        }
        Ok(steps)
    }
}

/// 学習結果のまとめ
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub run_id: String,
    pub steps: EpochSteps,
    pub final_metrics: EpochMetrics,
    pub model_log: ModelLogOutcome,
    pub trained_model_path: PathBuf,
}

struct Generators {
    train: DataGenerator,
    valid: DataGenerator,
}

/// 学習を駆動する
pub struct Trainer<M, B = Box<dyn TrackingBackend>>
where
    B: TrackingBackend,
{
    config: TrainingConfig,
    logger: ExperimentLogger<B>,
    state: TrainerState,
    model: Option<M>,
    generators: Option<Generators>,
    history: Vec<EpochMetrics>,
}

impl<M: ClassifierModel, B: TrackingBackend> Trainer<M, B> {
    pub fn new(config: TrainingConfig, logger: ExperimentLogger<B>) -> Self {
        Self {
            config,
            logger,
            state: TrainerState::Created,
            model: None,
            generators: None,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn logger(&self) -> &ExperimentLogger<B> {
        &self.logger
    }

    pub fn model(&self) -> Option<&M> {
        self.model.as_ref()
    }

    /// 完了したエポックの記録
    pub fn history(&self) -> &[EpochMetrics] {
        &self.history
    }

    fn expect_state(&self, expected: TrainerState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected: expected.name(),
                found: self.state.name(),
            });
        }
        Ok(())
    }

    /// `updated_base_model_path` からモデルを読み込む
    pub fn load_model<F>(&mut self, loader: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<M>,
    {
        self.expect_state(TrainerState::Created)?;
        let path = self.config.updated_base_model_path();
        if !path.is_file() {
            return Err(Error::config(format!(
                "base model not found: {}",
                path.display()
            )));
        }

        info!("ベースモデルを読み込みます: {}", path.display());
        self.model = Some(loader(path)?);
        self.state = TrainerState::ModelLoaded;
        Ok(())
    }

    /// 学習/検証ジェネレータを用意する
    pub fn prepare_generators(&mut self) -> Result<()> {
        self.expect_state(TrainerState::ModelLoaded)?;
        let (train, valid) = DataPipeline::build(&self.config)?;
        self.generators = Some(Generators { train, valid });
        self.state = TrainerState::GeneratorsReady;
        Ok(())
    }

    /// 学習してトラッキングに記録し、最後にモデルを保存する
    pub fn train(&mut self) -> Result<TrainingSummary> {
        self.expect_state(TrainerState::GeneratorsReady)?;

        let Self {
            config,
            logger,
            state,
            model,
            generators,
            history,
        } = self;
        let (Some(model), Some(generators)) = (model.as_mut(), generators.as_mut()) else {
            return Err(Error::InvalidState {
                expected: TrainerState::GeneratorsReady.name(),
                found: state.name(),
            });
        };

        let steps = EpochSteps::compute(&generators.train, &generators.valid)?;
        if config.validation_freq() > config.params_epochs() {
            return Err(Error::config(format!(
                "validation_freq {} exceeds epochs {}",
                config.validation_freq(),
                config.params_epochs()
            )));
        }
        info!(
            "steps_per_epoch: {}, validation_steps: {}",
            steps.steps_per_epoch, steps.validation_steps
        );

        *state = TrainerState::Training;
        history.clear();

        let (run_id, final_metrics, model_log) = logger.run_scoped(None, |logger, run| {
            log_params(logger, run, config)?;
            fit(logger, run, config, model, generators, steps, history)?;
            let final_metrics = log_final_metrics(logger, run, config, history)?;
            let model_log = log_trained_model(logger, run, config, &*model)?;
            info!("モデル学習が完了し、トラッキングに記録しました");
            Ok((run.run_id().to_string(), final_metrics, model_log))
        })?;

        let trained_model_path = config.trained_model_path().to_path_buf();
        if let Some(parent) = trained_model_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        model.save(&trained_model_path)?;
        info!("学習済みモデルを保存しました: {}", trained_model_path.display());
        *state = TrainerState::Saved;

        Ok(TrainingSummary {
            run_id,
            steps,
            final_metrics,
            model_log,
            trained_model_path,
        })
    }
}

fn log_params<B: TrackingBackend>(
    logger: &mut ExperimentLogger<B>,
    run: &RunContext,
    config: &TrainingConfig,
) -> Result<()> {
    logger.log_param(run, "epochs", config.params_epochs())?;
    logger.log_param(run, "batch_size", config.params_batch_size())?;
    logger.log_param(run, "image_size", config.params_image_size())?;
    logger.log_param(run, "is_augmentation", config.params_is_augmentation())?;
    let learning_rate = config
        .params_learning_rate()
        .map(|lr| lr.to_string())
        .unwrap_or_else(|| "default".to_string());
    logger.log_param(run, "learning_rate", learning_rate)?;
    Ok(())
}

fn fit<M: ClassifierModel, B: TrackingBackend>(
    logger: &mut ExperimentLogger<B>,
    run: &RunContext,
    config: &TrainingConfig,
    model: &mut M,
    generators: &mut Generators,
    steps: EpochSteps,
    history: &mut Vec<EpochMetrics>,
) -> Result<()> {
    let epochs = config.params_epochs();
    for epoch in 0..epochs {
        let mut train = MetricAccumulator::new();
        for batch in generators.train.epoch(steps.steps_per_epoch) {
            let output = model.train_step(&batch?)?;
            train.update(&output);
        }

        let validate = (epoch + 1) % config.validation_freq() == 0;
        let (val_loss, val_accuracy) = if validate {
            let mut valid = MetricAccumulator::new();
            for batch in generators.valid.epoch(steps.validation_steps) {
                let output = model.eval_step(&batch?)?;
                valid.update(&output);
            }
            (Some(valid.loss()), Some(valid.accuracy()))
        } else {
            (None, None)
        };

        let metrics = EpochMetrics {
            epoch,
            loss: train.loss(),
            accuracy: train.accuracy(),
            val_loss,
            val_accuracy,
        };
        info!("Epoch {}/{} - {}", epoch + 1, epochs, metrics);

        for (key, value) in metrics.named_values(config.accuracy_metric_name()) {
            logger.log_metric(run, &key, value, Some(epoch as u64))?;
        }
        history.push(metrics);
    }
    Ok(())
}

/// 最終エポックの値（検証値は最後に検証したエポックの値）を記録する
fn log_final_metrics<B: TrackingBackend>(
    logger: &mut ExperimentLogger<B>,
    run: &RunContext,
    config: &TrainingConfig,
    history: &[EpochMetrics],
) -> Result<EpochMetrics> {
    let last = history
        .last()
        .ok_or_else(|| Error::model("no epochs were completed"))?;
    let last_validated = history
        .iter()
        .rev()
        .find(|m| m.val_loss.is_some() && m.val_accuracy.is_some())
        .ok_or_else(|| Error::model("no validation metrics were produced"))?;

    let final_metrics = EpochMetrics {
        epoch: last.epoch,
        loss: last.loss,
        accuracy: last.accuracy,
        val_loss: last_validated.val_loss,
        val_accuracy: last_validated.val_accuracy,
    };

    let metric = config.accuracy_metric_name();
    let values = [
        ("final_loss".to_string(), final_metrics.loss),
        (format!("final_{metric}"), final_metrics.accuracy),
        ("final_val_loss".to_string(), final_metrics.val_loss.unwrap_or_default()),
        (format!("final_val_{metric}"), final_metrics.val_accuracy.unwrap_or_default()),
    ];
    for (key, value) in values {
        logger.log_metric(run, &key, value, None)?;
    }
    Ok(final_metrics)
}

/// 保存先の隣の作業ディレクトリに書き出したモデルをトラッキングへ記録する
fn log_trained_model<M: ClassifierModel, B: TrackingBackend>(
    logger: &mut ExperimentLogger<B>,
    run: &RunContext,
    config: &TrainingConfig,
    model: &M,
) -> Result<ModelLogOutcome> {
    let staging_root = config
        .trained_model_path()
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let artifact_dir = staging_root.join(format!(".tracking_{}", run.run_id()));
    std::fs::create_dir_all(&artifact_dir)?;
    let file_name = config
        .trained_model_path()
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("model.tar.gz"));
    let artifact_file = artifact_dir.join(file_name);

    let result = model.save(&artifact_file).and_then(|_| {
        logger
            .log_model(
                run,
                MODEL_ARTIFACT_PATH,
                &artifact_file,
                config.registered_model_name(),
            )
            .map_err(Error::from)
    });

    if let Err(e) = std::fs::remove_dir_all(&artifact_dir) {
        warn!("一時ディレクトリを削除できませんでした {}: {}", artifact_dir.display(), e);
    }

    let outcome = result?;
    match &outcome {
        ModelLogOutcome::Registered { name, .. } => info!("モデルを '{}' として登録しました", name),
        ModelLogOutcome::Logged { .. } => info!("モデルを記録しました（登録なし）"),
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;
    use crate::model::config::TrainingSettings;
    use crate::tracking::{InMemoryStore, TrackingTarget};
    use crate::training::StepOutput;

    struct NullModel;

    impl ClassifierModel for NullModel {
        fn train_step(&mut self, batch: &Batch) -> Result<StepOutput> {
            Ok(StepOutput { loss: 0.0, correct: 0, count: batch.len() })
        }

        fn eval_step(&self, batch: &Batch) -> Result<StepOutput> {
            Ok(StepOutput { loss: 0.0, correct: 0, count: batch.len() })
        }

        fn save(&self, path: &Path) -> Result<()> {
            std::fs::write(path, b"null")?;
            Ok(())
        }
    }

    fn trainer(settings: &TrainingSettings) -> Trainer<NullModel, InMemoryStore> {
        let target = TrackingTarget::Local { root: PathBuf::from("mlruns") };
        let logger = ExperimentLogger::with_backend(target, "test", InMemoryStore::new());
        Trainer::new(TrainingConfig::from(settings), logger)
    }

    #[test]
    fn test_out_of_order_calls_are_rejected() {
        let mut trainer = trainer(&TrainingSettings::default());
        assert_eq!(trainer.state(), TrainerState::Created);

        let err = trainer.prepare_generators().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState { expected: "ModelLoaded", found: "Created" }
        ));
        assert!(matches!(trainer.train(), Err(Error::InvalidState { .. })));
        assert!(trainer.logger().backend().runs().is_empty());
    }

    #[test]
    fn test_missing_base_model_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = TrainingSettings {
            updated_base_model_path: dir.path().join("missing.tar.gz"),
            ..TrainingSettings::default()
        };
        let mut trainer = trainer(&settings);
        let err = trainer.load_model(|_| Ok(NullModel)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(trainer.state(), TrainerState::Created);
    }

    #[test]
    fn test_loader_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.tar.gz");
        std::fs::write(&base, b"corrupt").unwrap();
        let settings = TrainingSettings {
            updated_base_model_path: base,
            ..TrainingSettings::default()
        };
        let mut trainer = trainer(&settings);
        let err = trainer
            .load_model(|_| Err(Error::model("unreadable")))
            .unwrap_err();
        assert!(matches!(err, Error::Model(_)));
        assert!(trainer.model().is_none());
    }
}
