//! 画像ディレクトリからバッチを生成するデータジェネレータ

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::data::augmentation::AugmentationSpec;
use crate::data::image_dataset::{ImageDirectory, Sample};
use crate::error::{Error, Result};
use crate::model::config::TrainingConfig;
use crate::types::{ImageSize, Interpolation};

/// 検証用に取り分ける割合
pub const VALIDATION_SPLIT: f32 = 0.30;

/// 画素値のスケール係数
pub const RESCALE: f32 = 1.0 / 255.0;

/// ジェネレータ1本分の前処理設定
#[derive(Debug, Clone, PartialEq)]
pub struct DataGeneratorSpec {
    pub rescale: f32,
    pub validation_split: f32,
    /// リサイズ先 (幅, 高さ)
    pub target_size: (u32, u32),
    pub batch_size: usize,
    pub interpolation: Interpolation,
    /// `None` の場合はリサイズとスケーリングのみ
    pub augmentation: Option<AugmentationSpec>,
}

impl DataGeneratorSpec {
    /// 検証用（オーグメンテーションなし）
    pub fn validation(config: &TrainingConfig) -> Self {
        Self {
            rescale: RESCALE,
            validation_split: VALIDATION_SPLIT,
            target_size: config.params_image_size().target_size(),
            batch_size: config.params_batch_size(),
            interpolation: Interpolation::Bilinear,
            augmentation: None,
        }
    }

    /// 学習用。オーグメンテーション無効時は検証用と同一
    pub fn training(config: &TrainingConfig) -> Self {
        let spec = Self::validation(config);
        if config.params_is_augmentation() {
            Self {
                augmentation: Some(AugmentationSpec::default()),
                ..spec
            }
        } else {
            spec
        }
    }
}

/// 1バッチ分のデータ
///
/// `images` は (N, C, H, W) 順に平坦化した画素値。
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Vec<f32>,
    pub labels: Vec<usize>,
    pub paths: Vec<PathBuf>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// 画像を読み込み、リサイズして (C, H, W) の `f32` 配列にする
pub fn load_image(
    path: &Path,
    size: ImageSize,
    interpolation: Interpolation,
    rescale: f32,
) -> Result<Vec<f32>> {
    let img = image::open(path)?;
    let img = img.resize_exact(size.width, size.height, interpolation.filter());

    let (width, height) = (size.width as usize, size.height as usize);
    let channels = size.channels as usize;
    let plane = width * height;
    let mut data = vec![0.0f32; channels * plane];

    match channels {
        1 => {
            let gray = img.to_luma8();
            for (i, pixel) in gray.pixels().enumerate() {
                data[i] = f32::from(pixel[0]) * rescale;
            }
        }
        3 => {
            let rgb = img.to_rgb8();
            for (i, pixel) in rgb.pixels().enumerate() {
                for channel in 0..3 {
                    data[channel * plane + i] = f32::from(pixel[channel]) * rescale;
                }
            }
        }
        other => {
            return Err(Error::config(format!(
                "unsupported channel count: {} (expected 1 or 3)",
                other
            )))
        }
    }

    Ok(data)
}

/// 再スタート可能なバッチ生成器
pub struct DataGenerator {
    samples: Vec<Sample>,
    class_names: Vec<String>,
    spec: DataGeneratorSpec,
    image_size: ImageSize,
    shuffle: bool,
    rng: StdRng,
    order: Vec<usize>,
}

impl DataGenerator {
    pub fn new(
        samples: Vec<Sample>,
        class_names: Vec<String>,
        spec: DataGeneratorSpec,
        channels: u32,
        shuffle: bool,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (width, height) = spec.target_size;
        let order = (0..samples.len()).collect();

        Self {
            samples,
            class_names,
            spec,
            image_size: ImageSize::new(width, height, channels),
            shuffle,
            rng,
            order,
        }
    }

    /// サンプル数
    pub fn samples(&self) -> usize {
        self.samples.len()
    }

    pub fn batch_size(&self) -> usize {
        self.spec.batch_size
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn spec(&self) -> &DataGeneratorSpec {
        &self.spec
    }

    pub fn image_size(&self) -> ImageSize {
        self.image_size
    }

    /// 1パスあたりの完全なバッチ数 floor(samples / batch_size)
    pub fn steps(&self) -> usize {
        if self.spec.batch_size == 0 {
            0
        } else {
            self.samples.len() / self.spec.batch_size
        }
    }

    /// 新しいパスを開始し、`steps` 個のバッチを返すイテレータを作る
    pub fn epoch(&mut self, steps: usize) -> EpochBatches<'_> {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        EpochBatches {
            generator: self,
            step: 0,
            steps,
        }
    }

    /// 1サンプル分を前処理する（オーグメンテーションはここで毎回引き直す）
    fn load_sample(&mut self, index: usize) -> Result<Vec<f32>> {
        let sample = &self.samples[index];
        let pixels = load_image(
            &sample.path,
            self.image_size,
            self.spec.interpolation,
            self.spec.rescale,
        )?;

        match &self.spec.augmentation {
            Some(augmentation) => {
                let transform = augmentation.sample(&mut self.rng);
                Ok(transform.apply(
                    &pixels,
                    self.image_size.channels as usize,
                    self.image_size.height as usize,
                    self.image_size.width as usize,
                ))
            }
            None => Ok(pixels),
        }
    }

    fn batch_at(&mut self, step: usize) -> Result<Batch> {
        let batch_size = self.spec.batch_size;
        let total = self.samples.len();
        let mut images = Vec::with_capacity(batch_size * self.image_size.num_elements());
        let mut labels = Vec::with_capacity(batch_size);
        let mut paths = Vec::with_capacity(batch_size);

        for offset in 0..batch_size {
            let index = self.order[(step * batch_size + offset) % total];
            let pixels = self.load_sample(index)?;
            images.extend_from_slice(&pixels);
            labels.push(self.samples[index].label);
            paths.push(self.samples[index].path.clone());
        }

        Ok(Batch {
            images,
            labels,
            paths,
            channels: self.image_size.channels as usize,
            height: self.image_size.height as usize,
            width: self.image_size.width as usize,
        })
    }
}

/// 1エポック分のバッチ列
pub struct EpochBatches<'a> {
    generator: &'a mut DataGenerator,
    step: usize,
    steps: usize,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.step >= self.steps || self.generator.samples.is_empty() {
            return None;
        }
        let batch = self.generator.batch_at(self.step);
        self.step += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.steps.saturating_sub(self.step);
        (remaining, Some(remaining))
    }
}

/// 学習/検証ジェネレータの構築
pub struct DataPipeline;

impl DataPipeline {
    /// (学習用, 検証用) のジェネレータを作る
    pub fn build(config: &TrainingConfig) -> Result<(DataGenerator, DataGenerator)> {
        let size = config.params_image_size();
        if size.width == 0 || size.height == 0 {
            return Err(Error::config(format!(
                "image_size must be positive: {}x{}",
                size.width, size.height
            )));
        }
        if !matches!(size.channels, 1 | 3) {
            return Err(Error::config(format!(
                "unsupported channel count: {} (expected 1 or 3)",
                size.channels
            )));
        }

        let directory = ImageDirectory::scan(config.training_data())?;
        let valid_spec = DataGeneratorSpec::validation(config);
        let train_spec = DataGeneratorSpec::training(config);
        let (train_samples, valid_samples) = directory.split(valid_spec.validation_split)?;
        let channels = size.channels;

        debug!("検証用ジェネレータ: {:?}", valid_spec);
        debug!("学習用ジェネレータ: {:?}", train_spec);
        info!(
            "データジェネレータ準備完了: 学習 {} 枚 / 検証 {} 枚, オーグメンテーション: {}",
            train_samples.len(),
            valid_samples.len(),
            train_spec.augmentation.is_some()
        );

        let valid = DataGenerator::new(
            valid_samples,
            directory.class_names().to_vec(),
            valid_spec,
            channels,
            false,
            None,
        );
        let train = DataGenerator::new(
            train_samples,
            directory.class_names().to_vec(),
            train_spec,
            channels,
            true,
            config.seed(),
        );

        Ok((train, valid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::data::image_dataset::Subset;
    use crate::model::config::TrainingSettings;
    use image::{Rgb, RgbImage};

    fn write_images(root: &Path, class: &str, count: usize) {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            let img = RgbImage::from_fn(12, 10, |x, y| {
                Rgb([(x * 20) as u8, (y * 25) as u8, (i * 10) as u8])
            });
            img.save(dir.join(format!("{class}_{i:02}.png"))).unwrap();
        }
    }

    fn config(root: &Path, augmentation: bool, batch_size: usize) -> TrainingConfig {
        let settings = TrainingSettings {
            training_data: root.to_path_buf(),
            image_size: ImageSize::new(8, 8, 3),
            batch_size,
            is_augmentation: augmentation,
            ..TrainingSettings::default()
        };
        TrainingConfig::from(&settings)
    }

    #[test]
    fn test_training_spec_equals_validation_spec_without_augmentation() {
        let cfg = config(Path::new("unused"), false, 4);
        assert_eq!(DataGeneratorSpec::training(&cfg), DataGeneratorSpec::validation(&cfg));

        let cfg = config(Path::new("unused"), true, 4);
        let train = DataGeneratorSpec::training(&cfg);
        assert_eq!(train.augmentation, Some(AugmentationSpec::default()));
        assert_eq!(train.target_size, (8, 8));
        assert_eq!(train.validation_split, 0.30);
    }

    #[test]
    fn test_load_image_resizes_and_rescales() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white.png");
        RgbImage::from_pixel(20, 20, Rgb([255, 255, 255])).save(&path).unwrap();

        let data = load_image(&path, ImageSize::new(4, 4, 3), Interpolation::Bilinear, RESCALE)
            .unwrap();
        assert_eq!(data.len(), 3 * 4 * 4);
        assert!(data.iter().all(|v| (v - 1.0).abs() < 0.01));

        let gray = load_image(&path, ImageSize::new(4, 4, 1), Interpolation::Bilinear, RESCALE)
            .unwrap();
        assert_eq!(gray.len(), 16);
    }

    #[test]
    fn test_build_partitions_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "Normal", 10);
        write_images(dir.path(), "Tumor", 10);

        let (train, valid) = DataPipeline::build(&config(dir.path(), false, 4)).unwrap();
        assert_eq!(train.samples() + valid.samples(), 20);
        assert_eq!(valid.samples(), 6);
        assert_eq!(train.steps(), 14 / 4);
        assert_eq!(train.class_names(), ["Normal", "Tumor"]);
    }

    #[test]
    fn test_validation_order_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "Normal", 10);
        write_images(dir.path(), "Tumor", 10);

        let (_, mut valid) = DataPipeline::build(&config(dir.path(), false, 2)).unwrap();
        let steps = valid.steps();
        let first: Vec<PathBuf> = valid
            .epoch(steps)
            .flat_map(|b| b.unwrap().paths)
            .collect();
        let second: Vec<PathBuf> = valid
            .epoch(steps)
            .flat_map(|b| b.unwrap().paths)
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);
    }

    #[test]
    fn test_training_order_is_shuffled_between_passes() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "Normal", 20);
        write_images(dir.path(), "Tumor", 20);

        let (mut train, _) = DataPipeline::build(&config(dir.path(), false, 1)).unwrap();
        let steps = train.steps();
        let passes: Vec<Vec<PathBuf>> = (0..3)
            .map(|_| train.epoch(steps).flat_map(|b| b.unwrap().paths).collect())
            .collect();
        // 28! 通りの並びが3回とも一致する確率は無視できる
        assert!(passes[0] != passes[1] || passes[1] != passes[2]);
    }

    /// 全サンプルを1枚ずつ取り出し、パスごとの画素値を返す
    fn pixels_by_path(generator: &mut DataGenerator) -> BTreeMap<PathBuf, Vec<f32>> {
        let steps = generator.steps();
        generator
            .epoch(steps)
            .map(|b| {
                let batch = b.unwrap();
                (batch.paths[0].clone(), batch.images)
            })
            .collect()
    }

    #[test]
    fn test_same_pixels_without_augmentation() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "Normal", 5);
        write_images(dir.path(), "Tumor", 5);
        let cfg = config(dir.path(), false, 1);
        let directory = ImageDirectory::scan(dir.path()).unwrap();
        let (samples, _) = directory.split(VALIDATION_SPLIT).unwrap();
        let names = directory.class_names().to_vec();

        let mut train = DataGenerator::new(
            samples.clone(),
            names.clone(),
            DataGeneratorSpec::training(&cfg),
            3,
            true,
            Some(3),
        );
        let mut valid = DataGenerator::new(
            samples,
            names,
            DataGeneratorSpec::validation(&cfg),
            3,
            false,
            None,
        );

        let from_train = pixels_by_path(&mut train);
        let from_valid = pixels_by_path(&mut valid);
        assert_eq!(from_train.len(), 8);
        assert_eq!(from_train, from_valid);
    }

    #[test]
    fn test_augmentation_is_drawn_per_fetch() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "Normal", 1);
        let cfg = config(dir.path(), true, 1);
        let directory = ImageDirectory::scan(dir.path()).unwrap();
        let sample = directory.subset(Subset::Training, VALIDATION_SPLIT);
        assert_eq!(sample.len(), 1);

        let mut train = DataGenerator::new(
            sample,
            directory.class_names().to_vec(),
            DataGeneratorSpec::training(&cfg),
            3,
            true,
            Some(11),
        );
        let first = pixels_by_path(&mut train);
        let second = pixels_by_path(&mut train);
        let path = dir.path().join("Normal").join("Normal_00.png");
        assert_eq!(first.keys().collect::<Vec<_>>(), vec![&path]);
        assert_ne!(first[&path], second[&path]);

        let plain = load_image(&path, cfg.params_image_size(), Interpolation::Bilinear, RESCALE)
            .unwrap();
        assert_ne!(first[&path], plain);
    }

    #[test]
    fn test_zero_image_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "Normal", 5);
        write_images(dir.path(), "Tumor", 5);

        for size in [ImageSize::new(0, 8, 3), ImageSize::new(8, 0, 3), ImageSize::new(8, 8, 0)] {
            let settings = TrainingSettings {
                training_data: dir.path().to_path_buf(),
                image_size: size,
                ..TrainingSettings::default()
            };
            let result = DataPipeline::build(&TrainingConfig::from(&settings));
            assert!(matches!(result, Err(Error::Config(_))), "{size:?}");
        }
    }

    #[test]
    fn test_batch_layout() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "Normal", 10);
        write_images(dir.path(), "Tumor", 10);

        let (mut train, _) = DataPipeline::build(&config(dir.path(), true, 4)).unwrap();
        let batches: Vec<Batch> = train.epoch(2).map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            assert_eq!(batch.len(), 4);
            assert_eq!(batch.images.len(), 4 * 3 * 8 * 8);
            assert!(batch.images.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }
}
