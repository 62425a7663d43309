//! 機械学習モデルの共通定義
//!
//! CT画像分類用のCNNモデルと関連する設定を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
};
use tracing::debug;

use crate::error::Error;
use crate::types::ImageSize;

/// Conv3後に揃える特徴マップの一辺
const POOLED_SIZE: usize = 4;

/// 最終畳み込み層のチャンネル数
const FEATURE_CHANNELS: usize = 128;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像の幅
    pub width: usize,
    /// 入力画像の高さ
    pub height: usize,
    /// 入力チャンネル数
    #[config(default = 3)]
    pub channels: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

/// 3x3畳み込み(パディング無し)と2x2プーリングを経た一辺の長さ
fn feature_extent(size: usize) -> usize {
    let after_conv1 = size.saturating_sub(2);
    let after_pool1 = after_conv1 / 2;
    let after_conv2 = after_pool1.saturating_sub(2);
    let after_pool2 = after_conv2 / 2;
    after_pool2.saturating_sub(2)
}

impl ModelConfig {
    pub fn from_image_size(num_classes: usize, image_size: ImageSize) -> Self {
        Self::new(num_classes, image_size.width as usize, image_size.height as usize)
            .with_channels(image_size.channels as usize)
    }

    /// モデルを初期化
    ///
    /// 入力が小さすぎて特徴マップが消える場合やクラス数が0の場合はエラー。
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> crate::error::Result<CnnClassifier<B>> {
        if self.num_classes == 0 {
            return Err(Error::model("number of classes must be positive"));
        }
        if !matches!(self.channels, 1 | 3) {
            return Err(Error::model(format!(
                "unsupported channel count: {} (expected 1 or 3)",
                self.channels
            )));
        }

        let feature_w = feature_extent(self.width);
        let feature_h = feature_extent(self.height);
        if feature_w == 0 || feature_h == 0 {
            return Err(Error::model(format!(
                "入力サイズが小さすぎます: {}x{} (最小18x18が必要)",
                self.width, self.height
            )));
        }

        // 特徴次元 d = 128チャネル * 4 * 4
        let d = FEATURE_CHANNELS * POOLED_SIZE * POOLED_SIZE;
        let d_half = d / 2;

        debug!("[Model] 入力サイズ: {}x{}x{}", self.width, self.height, self.channels);
        debug!("[Model] Conv3後: {} x {}x{}", FEATURE_CHANNELS, feature_w, feature_h);
        debug!("[Model] FC1: {} -> {}", d, d_half);
        debug!("[Model] FC2: {} -> {}", d_half, self.num_classes);

        Ok(CnnClassifier {
            conv1: Conv2dConfig::new([self.channels, 32], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv3: Conv2dConfig::new([64, FEATURE_CHANNELS], [3, 3]).init(device),
            pool3: AdaptiveAvgPool2dConfig::new([POOLED_SIZE, POOLED_SIZE]).init(),
            fc1: LinearConfig::new(d, d_half).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(d_half, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// CT画像分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 2層
/// - Conv 3x3 (no padding) + ReLU
/// - AdaptiveAvgPool -> 128 x 4 x 4
/// - FC: d -> d/2 + ReLU + Dropout
/// - FC: d/2 -> num_classes
#[derive(Module, Debug)]
pub struct CnnClassifier<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,
    pool3: AdaptiveAvgPool2d,

    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> CnnClassifier<B> {
    /// 順伝播
    ///
    /// - `images`: バッチ画像 [batch_size, channels, height, width]
    /// - 戻り値: クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool3.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }

    /// 順伝播と交差エントロピー損失
    ///
    /// 戻り値は (損失 [1], ロジット [batch_size, num_classes])
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets);
        (loss, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_extent() {
        assert_eq!(feature_extent(224), 52);
        assert_eq!(feature_extent(18), 1);
        assert_eq!(feature_extent(17), 0);
    }

    #[test]
    fn test_config_from_image_size() {
        let config = ModelConfig::from_image_size(4, ImageSize::new(64, 32, 1));
        assert_eq!(config.num_classes, 4);
        assert_eq!((config.width, config.height, config.channels), (64, 32, 1));
        assert_eq!(config.dropout, 0.5);
    }

    #[test]
    fn test_config_json_and_init() {
        use burn::backend::NdArray;

        let config = ModelConfig::from_image_size(3, ImageSize::new(24, 24, 3));
        let json = serde_json::to_string(&config).unwrap();
        let restored: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.num_classes, 3);
        assert_eq!(restored.dropout, 0.5);

        let device = Default::default();
        let model = restored.init::<NdArray>(&device).unwrap();
        let logits = model.forward(Tensor::zeros([2, 3, 24, 24], &device));
        assert_eq!(logits.dims(), [2, 3]);

        let empty = ModelConfig::new(0, 24, 24);
        assert!(matches!(empty.init::<NdArray>(&device), Err(Error::Model(_))));
        let tiny = ModelConfig::new(2, 17, 17);
        assert!(matches!(tiny.init::<NdArray>(&device), Err(Error::Model(_))));
    }
}
