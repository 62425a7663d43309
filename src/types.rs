use serde::{Deserialize, Serialize};

/// 入力画像サイズ (幅, 高さ, チャネル数)
///
/// JSONでは `[224, 224, 3]` の配列として表現する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 3]", into = "[u32; 3]")]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32, channels: u32) -> Self {
        Self { width, height, channels }
    }

    /// チャネル次元を除いたリサイズ先 (幅, 高さ)
    pub fn target_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// 1枚あたりの要素数 (C * H * W)
    pub fn num_elements(&self) -> usize {
        (self.channels * self.height * self.width) as usize
    }
}

impl From<[u32; 3]> for ImageSize {
    fn from([width, height, channels]: [u32; 3]) -> Self {
        Self { width, height, channels }
    }
}

impl From<ImageSize> for [u32; 3] {
    fn from(size: ImageSize) -> Self {
        [size.width, size.height, size.channels]
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}, {}]", self.width, self.height, self.channels)
    }
}

// リサイズ時の補間方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
}

impl Interpolation {
    pub fn filter(self) -> image::imageops::FilterType {
        match self {
            Interpolation::Nearest => image::imageops::FilterType::Nearest,
            Interpolation::Bilinear => image::imageops::FilterType::Triangle,
            Interpolation::Bicubic => image::imageops::FilterType::CatmullRom,
        }
    }
}

impl std::fmt::Display for Interpolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interpolation::Nearest => write!(f, "nearest"),
            Interpolation::Bilinear => write!(f, "bilinear"),
            Interpolation::Bicubic => write!(f, "bicubic"),
        }
    }
}
