//! 学習ランの記録内容の結合テスト
//!
//! 実際のCNNの代わりに決まった値を返すモデルを使い、
//! トラッキングに残る params / metrics / モデル登録を確認する。

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use pretty_assertions::assert_eq;
use url::Url;

use cnn_classifier_lib::data::{Batch, DataPipeline};
use cnn_classifier_lib::model::config::{TrainingConfig, TrainingSettings};
use cnn_classifier_lib::tracking::{
    ExperimentLogger, InMemoryStore, ModelLogOutcome, RunStatus, TrackingTarget,
};
use cnn_classifier_lib::training::{
    ClassifierModel, EpochSteps, StepOutput, Trainer, TrainerState,
};
use cnn_classifier_lib::types::ImageSize;
use cnn_classifier_lib::Error;

/// 決まった損失を返し、指定した学習ステップで失敗するモデル
struct ScriptedModel {
    fail_at_train_step: Option<usize>,
    train_steps: usize,
}

impl ScriptedModel {
    fn new() -> Self {
        Self {
            fail_at_train_step: None,
            train_steps: 0,
        }
    }

    fn failing_at(step: usize) -> Self {
        Self {
            fail_at_train_step: Some(step),
            train_steps: 0,
        }
    }
}

impl ClassifierModel for ScriptedModel {
    fn train_step(&mut self, batch: &Batch) -> cnn_classifier_lib::Result<StepOutput> {
        if self.fail_at_train_step == Some(self.train_steps) {
            return Err(Error::model("scripted failure"));
        }
        self.train_steps += 1;
        Ok(StepOutput {
            loss: 0.5,
            correct: batch.len(),
            count: batch.len(),
        })
    }

    fn eval_step(&self, batch: &Batch) -> cnn_classifier_lib::Result<StepOutput> {
        Ok(StepOutput {
            loss: 0.25,
            correct: 0,
            count: batch.len(),
        })
    }

    fn save(&self, path: &Path) -> cnn_classifier_lib::Result<()> {
        std::fs::write(path, b"scripted weights")?;
        Ok(())
    }
}

fn write_dataset(root: &Path, classes: &[&str], per_class: usize) {
    for class in classes {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..per_class {
            let img = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 30) as u8, (y * 30) as u8, i as u8]));
            img.save(dir.join(format!("{class}_{i:03}.png"))).unwrap();
        }
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    settings: TrainingSettings,
}

/// クラスあたり10枚 → 学習 7枚 / 検証 3枚（x2クラス）
fn fixture(epochs: usize, batch_size: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    write_dataset(&data, &["Normal", "Tumor"], 10);

    let base = dir.path().join("base/base_model_updated.tar.gz");
    std::fs::create_dir_all(base.parent().unwrap()).unwrap();
    std::fs::write(&base, b"base").unwrap();

    let settings = TrainingSettings {
        updated_base_model_path: base,
        trained_model_path: dir.path().join("training/model.tar.gz"),
        training_data: data,
        image_size: ImageSize::new(8, 8, 3),
        batch_size,
        epochs,
        is_augmentation: false,
        seed: Some(7),
        ..TrainingSettings::default()
    };
    Fixture {
        _dir: dir,
        settings,
    }
}

fn local_target() -> TrackingTarget {
    TrackingTarget::Local {
        root: PathBuf::from("mlruns"),
    }
}

fn remote_target() -> TrackingTarget {
    TrackingTarget::Remote {
        uri: Url::parse("https://tracking.example.com").unwrap(),
        credentials: None,
    }
}

fn ready_trainer(
    settings: &TrainingSettings,
    target: TrackingTarget,
    model: ScriptedModel,
) -> Trainer<ScriptedModel, InMemoryStore> {
    let logger = ExperimentLogger::with_backend(target, "kidney", InMemoryStore::new());
    let mut trainer = Trainer::new(TrainingConfig::from(settings), logger);
    trainer.load_model(|_| Ok(model)).unwrap();
    trainer.prepare_generators().unwrap();
    assert_eq!(trainer.state(), TrainerState::GeneratorsReady);
    trainer
}

#[test]
fn test_run_records_params_and_metrics() {
    let fx = fixture(3, 4);
    let mut trainer = ready_trainer(&fx.settings, local_target(), ScriptedModel::new());

    let summary = trainer.train().unwrap();
    assert_eq!(trainer.state(), TrainerState::Saved);
    assert_eq!(
        summary.steps,
        EpochSteps {
            steps_per_epoch: 3,
            validation_steps: 1
        }
    );

    let runs = trainer.logger().backend().runs();
    assert_eq!(runs.len(), 1);
    let run = runs[0];
    assert_eq!(run.status, RunStatus::Finished);

    let params: Vec<(&str, &str)> = run
        .params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    assert_eq!(
        params,
        vec![
            ("batch_size", "4"),
            ("epochs", "3"),
            ("image_size", "[8, 8, 3]"),
            ("is_augmentation", "false"),
            ("learning_rate", "default"),
        ]
    );

    for key in ["train_loss", "train_accuracy", "val_loss", "val_accuracy"] {
        let steps: Vec<u64> = run.metrics[key].iter().map(|m| m.step).collect();
        assert_eq!(steps, vec![0, 1, 2], "per-epoch steps of {key}");
    }
    assert_eq!(run.latest_metric("train_loss"), Some(0.5));
    assert_eq!(run.latest_metric("train_accuracy"), Some(1.0));
    assert_eq!(run.latest_metric("val_loss"), Some(0.25));
    assert_eq!(run.latest_metric("val_accuracy"), Some(0.0));

    for key in ["final_loss", "final_accuracy", "final_val_loss", "final_val_accuracy"] {
        assert_eq!(run.metrics[key].len(), 1, "{key} logged once");
    }
    assert_eq!(run.metrics.len(), 8);

    assert_eq!(trainer.history().len(), 3);
    assert!(fx.settings.trained_model_path.is_file());
    assert_eq!(summary.trained_model_path, fx.settings.trained_model_path);
}

#[test]
fn test_local_target_logs_model_without_registration() {
    let fx = fixture(1, 2);
    let mut trainer = ready_trainer(&fx.settings, local_target(), ScriptedModel::new());

    let summary = trainer.train().unwrap();
    assert_eq!(
        summary.model_log,
        ModelLogOutcome::Logged {
            artifact_path: "model".to_string()
        }
    );
    let run = trainer.logger().backend().runs()[0];
    assert_eq!(run.registered_model, None);
    assert_eq!(run.artifacts, vec!["model/model.tar.gz".to_string()]);
}

#[test]
fn test_remote_target_registers_model() {
    let fx = fixture(1, 2);
    let mut trainer = ready_trainer(&fx.settings, remote_target(), ScriptedModel::new());

    let summary = trainer.train().unwrap();
    assert_eq!(
        summary.model_log,
        ModelLogOutcome::Registered {
            artifact_path: "model".to_string(),
            name: "KidneyDiseaseModel".to_string(),
        }
    );
    let run = trainer.logger().backend().runs()[0];
    assert_eq!(run.registered_model.as_deref(), Some("KidneyDiseaseModel"));
}

#[test]
fn test_failure_mid_fit_closes_run_as_failed() {
    // 1エポック7ステップ、2エポック目の最初のステップで失敗
    let fx = fixture(3, 2);
    let mut trainer = ready_trainer(&fx.settings, local_target(), ScriptedModel::failing_at(7));

    let err = trainer.train().unwrap_err();
    assert!(matches!(err, Error::Model(_)));
    assert_ne!(trainer.state(), TrainerState::Saved);
    assert!(!fx.settings.trained_model_path.exists());

    let logger = trainer.logger();
    assert!(logger.active_run_id().is_none());
    let runs = logger.backend().runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].params.len(), 5);
    assert_eq!(runs[0].metrics["train_loss"].len(), 1);
    assert!(!runs[0].metrics.contains_key("final_loss"));
    assert!(runs[0].artifacts.is_empty());
    assert_eq!(trainer.history().len(), 1);
}

#[test]
fn test_validation_frequency_skips_epochs() {
    let mut fx = fixture(3, 2);
    fx.settings.validation_freq = 2;
    let mut trainer = ready_trainer(&fx.settings, local_target(), ScriptedModel::new());

    let summary = trainer.train().unwrap();
    let run = trainer.logger().backend().runs()[0];
    let val_steps: Vec<u64> = run.metrics["val_loss"].iter().map(|m| m.step).collect();
    assert_eq!(val_steps, vec![1]);
    assert_eq!(run.metrics["train_loss"].len(), 3);
    assert_eq!(summary.final_metrics.val_loss, Some(0.25));
    assert_eq!(run.latest_metric("final_val_loss"), Some(0.25));
}

#[test]
fn test_validation_frequency_beyond_epochs_is_rejected() {
    let mut fx = fixture(1, 2);
    fx.settings.validation_freq = 2;
    let mut trainer = ready_trainer(&fx.settings, local_target(), ScriptedModel::new());

    assert!(matches!(trainer.train(), Err(Error::Config(_))));
    assert!(trainer.logger().backend().runs().is_empty());
}

#[test]
fn test_zero_steps_is_rejected_before_run_opens() {
    // 学習 14枚に対してバッチ 32
    let fx = fixture(1, 32);
    let mut trainer = ready_trainer(&fx.settings, local_target(), ScriptedModel::new());

    assert!(matches!(trainer.train(), Err(Error::Config(_))));
    assert!(trainer.logger().backend().runs().is_empty());
    assert_eq!(trainer.state(), TrainerState::GeneratorsReady);
}

#[test]
fn test_steps_per_epoch_floors() {
    // クラスあたり71枚 → 学習 50枚 / 検証 21枚（x2クラス）
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), &["Cyst", "Normal"], 71);
    let settings = TrainingSettings {
        training_data: dir.path().to_path_buf(),
        image_size: ImageSize::new(8, 8, 3),
        batch_size: 32,
        is_augmentation: false,
        ..TrainingSettings::default()
    };

    let (train, valid) = DataPipeline::build(&TrainingConfig::from(&settings)).unwrap();
    assert_eq!(train.samples(), 100);
    assert_eq!(valid.samples(), 42);

    let steps = EpochSteps::compute(&train, &valid).unwrap();
    assert_eq!(steps.steps_per_epoch, 3);
    assert_eq!(steps.validation_steps, 1);
}

#[test]
fn test_explicit_learning_rate_is_logged() {
    let mut fx = fixture(1, 2);
    fx.settings.learning_rate = Some(0.0005);
    let mut trainer = ready_trainer(&fx.settings, local_target(), ScriptedModel::new());

    trainer.train().unwrap();
    let run = trainer.logger().backend().runs()[0];
    assert_eq!(run.params["learning_rate"], "0.0005");
}
