//! クラス別ディレクトリからの画像サンプル列挙と学習/検証分割

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};

/// 画像として扱う拡張子
const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// 画像パスとクラスIDの組
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

/// 分割後のどちら側か
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    Training,
    Validation,
}

impl std::fmt::Display for Subset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subset::Training => write!(f, "training"),
            Subset::Validation => write!(f, "validation"),
        }
    }
}

/// 1クラス分のファイル一覧（ファイル名順）
#[derive(Debug, Clone)]
struct ClassFiles {
    files: Vec<PathBuf>,
}

/// クラスごとのサブディレクトリを持つ画像ディレクトリ
///
/// クラスIDはサブディレクトリ名のソート順で割り当てる。
#[derive(Debug, Clone)]
pub struct ImageDirectory {
    root: PathBuf,
    class_names: Vec<String>,
    classes: Vec<ClassFiles>,
}

impl ImageDirectory {
    /// ディレクトリを走査する
    pub fn scan(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::config(format!(
                "training data directory not found: {}",
                root.display()
            )));
        }

        let mut class_dirs = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if path.is_dir() {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| Error::dataset(format!("invalid class directory name: {}", path.display())))?
                    .to_string();
                class_dirs.push((name, path));
            }
        }
        class_dirs.sort_by(|a, b| a.0.cmp(&b.0));

        if class_dirs.is_empty() {
            return Err(Error::config(format!(
                "no class subdirectories in {}",
                root.display()
            )));
        }

        let mut class_names = Vec::with_capacity(class_dirs.len());
        let mut classes = Vec::with_capacity(class_dirs.len());
        for (name, dir) in class_dirs {
            let mut files = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_file() && is_image_file(&path) {
                    files.push(path);
                }
            }
            files.sort();
            debug!("クラス '{}': {} 枚", name, files.len());
            class_names.push(name);
            classes.push(ClassFiles { files });
        }

        Ok(Self {
            root: root.to_path_buf(),
            class_names,
            classes,
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// 全サンプル数
    pub fn len(&self) -> usize {
        self.classes.iter().map(|c| c.files.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 分割の片側を取り出す
    ///
    /// クラスごとにファイル名順で先頭 `floor(split * n)` 枚を検証用、残りを学習用とする。
    pub fn subset(&self, subset: Subset, validation_split: f32) -> Vec<Sample> {
        let mut samples = Vec::new();
        for (label, class) in self.classes.iter().enumerate() {
            let n = class.files.len();
            let boundary = ((n as f64) * f64::from(validation_split)).floor() as usize;
            let range = match subset {
                Subset::Validation => 0..boundary,
                Subset::Training => boundary..n,
            };
            samples.extend(class.files[range].iter().map(|path| Sample {
                path: path.clone(),
                label,
            }));
        }
        samples
    }

    /// 学習用と検証用の両方を取り出す。どちらかが空なら設定エラー
    pub fn split(&self, validation_split: f32) -> Result<(Vec<Sample>, Vec<Sample>)> {
        if !(0.0..1.0).contains(&validation_split) {
            return Err(Error::config(format!(
                "validation_split must be in [0, 1): {}",
                validation_split
            )));
        }

        let train = self.subset(Subset::Training, validation_split);
        let valid = self.subset(Subset::Validation, validation_split);

        for (subset, samples) in [(Subset::Training, &train), (Subset::Validation, &valid)] {
            if samples.is_empty() {
                return Err(Error::config(format!(
                    "{} partition of {} is empty with validation_split={}",
                    subset,
                    self.root.display(),
                    validation_split
                )));
            }
        }

        info!(
            "Found {} images belonging to {} classes ({} training / {} validation)",
            self.len(),
            self.num_classes(),
            train.len(),
            valid.len()
        );
        Ok((train, valid))
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn make_tree(root: &Path, counts: &[(&str, usize)]) {
        for (class, count) in counts {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                std::fs::write(dir.join(format!("img_{i:03}.png")), b"").unwrap();
            }
        }
    }

    #[test]
    fn test_scan_orders_classes_by_name() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path(), &[("Tumor", 3), ("Normal", 4)]);
        std::fs::write(dir.path().join("Normal").join("notes.txt"), b"x").unwrap();

        let directory = ImageDirectory::scan(dir.path()).unwrap();
        assert_eq!(directory.class_names(), ["Normal", "Tumor"]);
        assert_eq!(directory.len(), 7);
    }

    #[test]
    fn test_split_is_disjoint_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path(), &[("Normal", 17), ("Tumor", 23)]);
        let directory = ImageDirectory::scan(dir.path()).unwrap();

        let (train, valid) = directory.split(0.30).unwrap();
        assert_eq!(train.len() + valid.len(), 40);
        // floor(0.3 * 17) + floor(0.3 * 23)
        assert_eq!(valid.len(), 5 + 6);

        let train_paths: HashSet<_> = train.iter().map(|s| s.path.clone()).collect();
        let valid_paths: HashSet<_> = valid.iter().map(|s| s.path.clone()).collect();
        assert!(train_paths.is_disjoint(&valid_paths));
    }

    #[test]
    fn test_split_fails_when_validation_partition_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path(), &[("Normal", 2), ("Tumor", 3)]);
        let directory = ImageDirectory::scan(dir.path()).unwrap();

        let err = directory.split(0.30).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_scan_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageDirectory::scan(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_scan_without_class_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("loose.png"), b"").unwrap();
        let err = ImageDirectory::scan(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
