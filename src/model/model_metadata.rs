//! モデルメタデータの定義
//!
//! tar.gz形式のモデルファイルに `metadata.json` として同梱される。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::ImageSize;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラスラベル（出力インデックス順、ディレクトリ名のソート順）
    /// 例: ["Normal", "Tumor"]
    pub class_labels: Vec<String>,

    /// モデル入力の画像幅（ピクセル）
    pub image_width: u32,

    /// モデル入力の画像高さ（ピクセル）
    pub image_height: u32,

    /// 入力チャンネル数（1 または 3）
    pub channels: u32,

    /// 学習エポック数（ベースモデルは0）
    #[serde(default)]
    pub num_epochs: u32,

    /// モデルの保存時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(class_labels: Vec<String>, image_size: ImageSize, num_epochs: u32) -> Self {
        Self {
            class_labels,
            image_width: image_size.width,
            image_height: image_size.height,
            channels: image_size.channels,
            num_epochs,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn image_size(&self) -> ImageSize {
        ImageSize::new(self.image_width, self.image_height, self.channels)
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
