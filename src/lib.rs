//! 腎臓CT画像分類器の学習パイプライン
//!
//! - `data`: ディレクトリからの画像読み込み、分割、拡張
//! - `training`: 学習の状態遷移とフィットループ
//! - `tracking`: 実験ランの記録（ローカル / MLflow 互換サーバー）
//! - `ml`: burn によるCNNと推論

pub mod data;
pub mod error;
pub mod logging;
pub mod model;
pub mod tracking;
pub mod training;
pub mod types;

#[cfg(feature = "ml")]
pub mod ml;

pub use error::{Error, Result};
