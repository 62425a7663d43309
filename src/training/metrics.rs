//! エポック単位のメトリクス集計

use serde::{Deserialize, Serialize};

/// 1バッチ分の結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    /// バッチ平均の損失
    pub loss: f64,
    /// 正解数
    pub correct: usize,
    /// バッチ内のサンプル数
    pub count: usize,
}

/// バッチ結果をサンプル数で重み付けして平均する
#[derive(Debug, Default, Clone)]
pub struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    count: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, step: &StepOutput) {
        self.loss_sum += step.loss * step.count as f64;
        self.correct += step.correct;
        self.count += step.count;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn loss(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.loss_sum / self.count as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.correct as f64 / self.count as f64
        }
    }
}

/// 1エポック分の記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 0始まりのエポック番号
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    /// 検証を実施したエポックのみ
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

impl EpochMetrics {
    /// 記録用の (キー, 値) 一覧。精度メトリクス名は設定から受け取る
    pub fn named_values(&self, accuracy_name: &str) -> Vec<(String, f64)> {
        let mut values = vec![
            ("train_loss".to_string(), self.loss),
            (format!("train_{accuracy_name}"), self.accuracy),
        ];
        if let Some(val_loss) = self.val_loss {
            values.push(("val_loss".to_string(), val_loss));
        }
        if let Some(val_accuracy) = self.val_accuracy {
            values.push((format!("val_{accuracy_name}"), val_accuracy));
        }
        values
    }
}

impl std::fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "loss: {:.4} - accuracy: {:.4}", self.loss, self.accuracy)?;
        if let (Some(val_loss), Some(val_accuracy)) = (self.val_loss, self.val_accuracy) {
            write!(f, " - val_loss: {:.4} - val_accuracy: {:.4}", val_loss, val_accuracy)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_weights_by_batch_size() {
        let mut acc = MetricAccumulator::new();
        acc.update(&StepOutput { loss: 1.0, correct: 1, count: 1 });
        acc.update(&StepOutput { loss: 0.5, correct: 2, count: 3 });
        assert!((acc.loss() - 0.625).abs() < 1e-12);
        assert!((acc.accuracy() - 0.75).abs() < 1e-12);
        assert_eq!(acc.count(), 4);
    }

    #[test]
    fn test_empty_accumulator() {
        let acc = MetricAccumulator::new();
        assert_eq!(acc.loss(), 0.0);
        assert_eq!(acc.accuracy(), 0.0);
    }

    #[test]
    fn test_named_values_skip_missing_validation() {
        let metrics = EpochMetrics {
            epoch: 2,
            loss: 0.4,
            accuracy: 0.8,
            val_loss: None,
            val_accuracy: None,
        };
        let keys: Vec<String> = metrics.named_values("acc").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["train_loss", "train_acc"]);
    }
}
