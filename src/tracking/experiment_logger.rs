//! ランのライフサイクルと記録のオーケストレーション

use std::fmt::Display;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};
use url::Url;

use super::{FileStore, RestClient, Result, RunStatus, TrackingBackend, TrackingError};
use crate::model::config::TrackingSettings;

/// トラッキングサーバーの認証情報
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 記録先の種類
///
/// モデル登録の有無はこの区別だけで決まる。
#[derive(Debug, Clone)]
pub enum TrackingTarget {
    /// ローカルファイルストア（モデルは記録のみ、登録しない）
    Local { root: PathBuf },
    /// リモートのトラッキングサーバー（モデルを登録する）
    Remote {
        uri: Url,
        credentials: Option<Credentials>,
    },
}

impl TrackingTarget {
    /// URIから記録先を決める
    ///
    /// - 未設定: `local_root` のローカルストア（警告を出す）
    /// - `file:` スキームまたはスキーム無しのパス: ローカルストア
    /// - それ以外: リモート
    pub fn from_uri(
        uri: Option<&str>,
        local_root: &Path,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let Some(raw) = uri.map(str::trim).filter(|s| !s.is_empty()) else {
            warn!("MLFLOW_TRACKING_URI が設定されていません。ローカルトラッキングを使用します");
            return Ok(Self::Local {
                root: local_root.to_path_buf(),
            });
        };

        match Url::parse(raw) {
            Ok(url) if url.scheme() == "file" => {
                let root = url.to_file_path().map_err(|_| TrackingError::InvalidUri {
                    uri: raw.to_string(),
                    reason: "file URI is not a local path".to_string(),
                })?;
                Ok(Self::Local { root })
            }
            // Windowsのドライブレター ("C:\...") はスキームとして解釈される
            Ok(url) if url.scheme().len() == 1 => Ok(Self::Local {
                root: PathBuf::from(raw),
            }),
            Ok(url) => Ok(Self::Remote { uri: url, credentials }),
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Self::Local {
                root: PathBuf::from(raw),
            }),
            Err(e) => Err(TrackingError::InvalidUri {
                uri: raw.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// 設定値から記録先を決める
    pub fn from_settings(settings: &TrackingSettings) -> Result<Self> {
        let credentials = match (&settings.username, &settings.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        Self::from_uri(
            settings.tracking_uri.as_deref(),
            &settings.local_store_dir,
            credentials,
        )
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl std::fmt::Display for TrackingTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackingTarget::Local { root } => write!(f, "file://{}", root.display()),
            TrackingTarget::Remote { uri, .. } => write!(f, "{}", uri),
        }
    }
}

/// アクティブなランのハンドル
///
/// `end_run` に所有権ごと渡すので、終了後のランには記録できない。
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
}

impl RunContext {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

/// `log_model` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLogOutcome {
    /// アーティファクトとして記録のみ
    Logged { artifact_path: String },
    /// 記録した上で登録モデルとして公開
    Registered { artifact_path: String, name: String },
}

/// 実験ロガー
pub struct ExperimentLogger<B: TrackingBackend = Box<dyn TrackingBackend>> {
    target: TrackingTarget,
    experiment_name: String,
    backend: B,
    active_run: Option<String>,
}

impl ExperimentLogger {
    /// 設定から記録先を決め、対応するバックエンドを作る
    pub fn configure(settings: &TrackingSettings) -> Result<Self> {
        let target = TrackingTarget::from_settings(settings)?;
        let backend: Box<dyn TrackingBackend> = match &target {
            TrackingTarget::Local { root } => Box::new(FileStore::new(root)),
            TrackingTarget::Remote { uri, credentials } => {
                if !matches!(uri.scheme(), "http" | "https") {
                    return Err(TrackingError::InvalidUri {
                        uri: uri.to_string(),
                        reason: "only http(s) tracking servers are supported".to_string(),
                    });
                }
                Box::new(RestClient::new(uri.clone(), credentials.clone())?)
            }
        };
        info!("トラッキング先: {}", target);
        Ok(Self::with_backend(target, &settings.experiment_name, backend))
    }
}

impl<B: TrackingBackend> ExperimentLogger<B> {
    pub fn with_backend(target: TrackingTarget, experiment_name: &str, backend: B) -> Self {
        Self {
            target,
            experiment_name: experiment_name.to_string(),
            backend,
            active_run: None,
        }
    }

    pub fn target(&self) -> &TrackingTarget {
        &self.target
    }

    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// 実行中のランID
    pub fn active_run_id(&self) -> Option<&str> {
        self.active_run.as_deref()
    }

    /// ランを開始する。既にアクティブなランがある場合はエラー
    pub fn start_run(&mut self, run_name: Option<&str>) -> Result<RunContext> {
        if let Some(active) = &self.active_run {
            return Err(TrackingError::RunAlreadyActive(active.clone()));
        }
        let run_id = self.backend.create_run(&self.experiment_name, run_name)?;
        info!("ランを開始しました: {} (実験: {})", run_id, self.experiment_name);
        self.active_run = Some(run_id.clone());
        Ok(RunContext { run_id })
    }

    fn ensure_active(&self, run: &RunContext) -> Result<()> {
        match &self.active_run {
            Some(active) if *active == run.run_id => Ok(()),
            _ => Err(TrackingError::RunNotActive(run.run_id.clone())),
        }
    }

    pub fn log_param(&mut self, run: &RunContext, key: &str, value: impl Display) -> Result<()> {
        self.ensure_active(run)?;
        self.backend.log_param(&run.run_id, key, &value.to_string())
    }

    /// メトリクスを記録する。`step` 省略時は 0
    pub fn log_metric(
        &mut self,
        run: &RunContext,
        key: &str,
        value: f64,
        step: Option<u64>,
    ) -> Result<()> {
        self.ensure_active(run)?;
        self.backend
            .log_metric(&run.run_id, key, value, step.unwrap_or(0))
    }

    /// モデルファイルを記録する。リモートの場合は `registered_model_name` で登録もする
    pub fn log_model(
        &mut self,
        run: &RunContext,
        artifact_path: &str,
        model_file: &Path,
        registered_model_name: &str,
    ) -> Result<ModelLogOutcome> {
        self.ensure_active(run)?;
        self.backend
            .log_artifact(&run.run_id, artifact_path, model_file)?;

        if !self.target.is_remote() {
            return Ok(ModelLogOutcome::Logged {
                artifact_path: artifact_path.to_string(),
            });
        }
        self.backend
            .register_model(&run.run_id, artifact_path, registered_model_name)?;
        Ok(ModelLogOutcome::Registered {
            artifact_path: artifact_path.to_string(),
            name: registered_model_name.to_string(),
        })
    }

    /// ランを終了する
    pub fn end_run(&mut self, run: RunContext, status: RunStatus) -> Result<()> {
        self.ensure_active(&run)?;
        self.active_run = None;
        self.backend.end_run(&run.run_id, status)?;
        info!("ランを終了しました: {} ({})", run.run_id, status);
        Ok(())
    }

    /// ランを開いて `f` を実行し、成功・失敗どちらでも必ず閉じる
    ///
    /// `f` が失敗した場合は `Failed` で閉じ、`f` のエラーを返す。
    pub fn run_scoped<T, F>(&mut self, run_name: Option<&str>, f: F) -> crate::Result<T>
    where
        F: FnOnce(&mut Self, &RunContext) -> crate::Result<T>,
    {
        let run = self.start_run(run_name)?;
        match f(self, &run) {
            Ok(value) => {
                self.end_run(run, RunStatus::Finished)?;
                Ok(value)
            }
            Err(err) => {
                let run_id = run.run_id.clone();
                if let Err(end_err) = self.end_run(run, RunStatus::Failed) {
                    error!("ラン {} の終了に失敗しました: {}", run_id, end_err);
                }
                Err(err)
            }
        }
    }
}
