//! 学習用ランダムオーグメンテーション
//!
//! 画素は (C, H, W) 順の平坦な `f32` 配列として扱う。
//! 回転・シフト・せん断・ズームを1つのアフィン変換にまとめ、
//! 出力画素から入力座標を逆算してバイリニア補間で取り出す。
//! 範囲外は最も近い端の画素で埋める。

use rand::Rng;
use serde::{Deserialize, Serialize};

/// オーグメンテーションのパラメータ範囲
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationSpec {
    /// 回転角の最大値（度）
    pub rotation_range: f32,
    /// 幅方向シフトの最大値（画像幅に対する割合）
    pub width_shift_range: f32,
    /// 高さ方向シフトの最大値（画像高さに対する割合）
    pub height_shift_range: f32,
    /// せん断角の最大値（度）
    pub shear_range: f32,
    /// ズーム倍率の振れ幅 ([1 - z, 1 + z])
    pub zoom_range: f32,
    pub horizontal_flip: bool,
}

impl Default for AugmentationSpec {
    fn default() -> Self {
        Self {
            rotation_range: 40.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
            horizontal_flip: true,
        }
    }
}

impl AugmentationSpec {
    /// サンプル1枚分の変換パラメータを引く
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> RandomTransform {
        let symmetric = |rng: &mut R, range: f32| {
            if range > 0.0 {
                rng.gen_range(-range..=range)
            } else {
                0.0
            }
        };

        let rotation_deg = symmetric(rng, self.rotation_range);
        let shift_rows = symmetric(rng, self.height_shift_range);
        let shift_cols = symmetric(rng, self.width_shift_range);
        let shear_deg = symmetric(rng, self.shear_range);
        let (zoom_rows, zoom_cols) = if self.zoom_range > 0.0 {
            let low = 1.0 - self.zoom_range;
            let high = 1.0 + self.zoom_range;
            (rng.gen_range(low..=high), rng.gen_range(low..=high))
        } else {
            (1.0, 1.0)
        };
        let flip_horizontal = self.horizontal_flip && rng.gen_bool(0.5);

        RandomTransform {
            rotation_deg,
            shift_rows,
            shift_cols,
            shear_deg,
            zoom_rows,
            zoom_cols,
            flip_horizontal,
        }
    }
}

/// 1枚に適用する具体的な変換
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomTransform {
    pub rotation_deg: f32,
    pub shift_rows: f32,
    pub shift_cols: f32,
    pub shear_deg: f32,
    pub zoom_rows: f32,
    pub zoom_cols: f32,
    pub flip_horizontal: bool,
}

impl RandomTransform {
    pub const IDENTITY: RandomTransform = RandomTransform {
        rotation_deg: 0.0,
        shift_rows: 0.0,
        shift_cols: 0.0,
        shear_deg: 0.0,
        zoom_rows: 1.0,
        zoom_cols: 1.0,
        flip_horizontal: false,
    };

    fn is_affine_identity(&self) -> bool {
        self.rotation_deg == 0.0
            && self.shift_rows == 0.0
            && self.shift_cols == 0.0
            && self.shear_deg == 0.0
            && self.zoom_rows == 1.0
            && self.zoom_cols == 1.0
    }

    /// 出力座標 -> 入力座標の行列 (行, 列, 1)
    fn matrix(&self, height: usize, width: usize) -> Affine {
        let theta = self.rotation_deg.to_radians();
        let shear = self.shear_deg.to_radians();
        let (sin_t, cos_t) = theta.sin_cos();

        let rotation = Affine([[cos_t, -sin_t, 0.0], [sin_t, cos_t, 0.0], [0.0, 0.0, 1.0]]);
        let shift = Affine([
            [1.0, 0.0, self.shift_rows * height as f32],
            [0.0, 1.0, self.shift_cols * width as f32],
            [0.0, 0.0, 1.0],
        ]);
        let shear = Affine([[1.0, -shear.sin(), 0.0], [0.0, shear.cos(), 0.0], [0.0, 0.0, 1.0]]);
        let zoom = Affine([
            [self.zoom_rows, 0.0, 0.0],
            [0.0, self.zoom_cols, 0.0],
            [0.0, 0.0, 1.0],
        ]);

        let center_r = height as f32 / 2.0 - 0.5;
        let center_c = width as f32 / 2.0 - 0.5;
        let offset = Affine([[1.0, 0.0, center_r], [0.0, 1.0, center_c], [0.0, 0.0, 1.0]]);
        let reset = Affine([[1.0, 0.0, -center_r], [0.0, 1.0, -center_c], [0.0, 0.0, 1.0]]);

        offset
            .mul(&rotation)
            .mul(&shift)
            .mul(&shear)
            .mul(&zoom)
            .mul(&reset)
    }

    /// (C, H, W) 配列に変換を適用する
    pub fn apply(&self, pixels: &[f32], channels: usize, height: usize, width: usize) -> Vec<f32> {
        debug_assert_eq!(pixels.len(), channels * height * width);
        if width == 0 || height == 0 {
            return pixels.to_vec();
        }

        let mut out = if self.is_affine_identity() {
            pixels.to_vec()
        } else {
            let m = self.matrix(height, width);
            let plane = height * width;
            let mut out = vec![0.0f32; pixels.len()];
            for r in 0..height {
                for c in 0..width {
                    let (src_r, src_c) = m.transform(r as f32, c as f32);
                    for ch in 0..channels {
                        let src = &pixels[ch * plane..(ch + 1) * plane];
                        out[ch * plane + r * width + c] =
                            sample_bilinear(src, height, width, src_r, src_c);
                    }
                }
            }
            out
        };

        if self.flip_horizontal {
            for row in out.chunks_exact_mut(width) {
                row.reverse();
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
struct Affine([[f32; 3]; 3]);

impl Affine {
    fn mul(&self, rhs: &Affine) -> Affine {
        let mut m = [[0.0f32; 3]; 3];
        for (i, row) in m.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.0[i][k] * rhs.0[k][j]).sum();
            }
        }
        Affine(m)
    }

    fn transform(&self, r: f32, c: f32) -> (f32, f32) {
        let m = &self.0;
        (
            m[0][0] * r + m[0][1] * c + m[0][2],
            m[1][0] * r + m[1][1] * c + m[1][2],
        )
    }
}

/// 端の画素で埋めるバイリニア補間
fn sample_bilinear(plane: &[f32], height: usize, width: usize, r: f32, c: f32) -> f32 {
    let r = r.clamp(0.0, (height - 1) as f32);
    let c = c.clamp(0.0, (width - 1) as f32);
    let r0 = r.floor() as usize;
    let c0 = c.floor() as usize;
    let r1 = (r0 + 1).min(height - 1);
    let c1 = (c0 + 1).min(width - 1);
    let fr = r - r0 as f32;
    let fc = c - c0 as f32;

    let top = plane[r0 * width + c0] * (1.0 - fc) + plane[r0 * width + c1] * fc;
    let bottom = plane[r1 * width + c0] * (1.0 - fc) + plane[r1 * width + c1] * fc;
    top * (1.0 - fr) + bottom * fr
}
