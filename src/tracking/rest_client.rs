//! MLflow 互換トラッキングサーバーのRESTクライアント
//!
//! `/api/2.0/mlflow/...` のエンドポイントを同期 (`reqwest::blocking`) で呼び出す。
//! 失敗はバッファせずにそのまま呼び出し元へ返す。

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use super::experiment_logger::Credentials;
use super::{metric_value, now_ms, Result, RunStatus, TrackingBackend, TrackingError};

const API_PREFIX: &str = "api/2.0/mlflow/";
const ARTIFACT_PREFIX: &str = "api/2.0/mlflow-artifacts/artifacts/";

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

pub struct RestClient {
    base: Url,
    credentials: Option<Credentials>,
    client: Client,
    /// 実験名 -> experiment_id
    experiment_ids: HashMap<String, String>,
    /// run_id -> experiment_id（アーティファクトのアップロード先）
    run_experiments: HashMap<String, String>,
}

impl RestClient {
    pub fn new(base: Url, credentials: Option<Credentials>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        // join() が末尾セグメントを置き換えないようにする
        let base = if base.path().ends_with('/') {
            base
        } else {
            let mut base = base;
            let path = format!("{}/", base.path());
            base.set_path(&path);
            base
        };

        Ok(Self {
            base,
            credentials,
            client,
            experiment_ids: HashMap::new(),
            run_experiments: HashMap::new(),
        })
    }

    fn endpoint(&self, prefix: &str, path: &str) -> Result<Url> {
        self.base
            .join(prefix)
            .and_then(|u| u.join(path))
            .map_err(|e| TrackingError::InvalidUri {
                uri: self.base.to_string(),
                reason: e.to_string(),
            })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(c) => request.basic_auth(&c.username, Some(&c.password)),
            None => request,
        }
    }

    fn check(response: Response) -> Result<Value> {
        let status = response.status();
        let body = response.text()?;
        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&body)?);
        }
        let err: ApiError = serde_json::from_str(&body).unwrap_or(ApiError {
            error_code: String::new(),
            message: body,
        });
        Err(TrackingError::Api {
            status: status.as_u16(),
            code: err.error_code,
            message: err.message,
        })
    }

    fn post(&self, path: &str, body: Value) -> Result<Value> {
        let url = self.endpoint(API_PREFIX, path)?;
        debug!("POST {}", url);
        let response = self.authorize(self.client.post(url)).json(&body).send()?;
        Self::check(response)
    }

    fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = self.endpoint(API_PREFIX, path)?;
        debug!("GET {}", url);
        let response = self.authorize(self.client.get(url)).query(query).send()?;
        Self::check(response)
    }

    /// 実験IDを取得し、無ければ作成する
    fn experiment_id(&mut self, experiment_name: &str) -> Result<String> {
        if let Some(id) = self.experiment_ids.get(experiment_name) {
            return Ok(id.clone());
        }

        let id = match self.get("experiments/get-by-name", &[("experiment_name", experiment_name)]) {
            Ok(body) => string_at(&body, &["experiment", "experiment_id"])?,
            Err(TrackingError::Api { code, .. }) if code == "RESOURCE_DOES_NOT_EXIST" => {
                info!("実験 '{}' を作成します", experiment_name);
                let body = self.post("experiments/create", json!({ "name": experiment_name }))?;
                string_at(&body, &["experiment_id"])?
            }
            Err(e) => return Err(e),
        };

        self.experiment_ids.insert(experiment_name.to_string(), id.clone());
        Ok(id)
    }
}

/// ネストしたJSONから文字列を取り出す
fn string_at(body: &Value, keys: &[&str]) -> Result<String> {
    let mut value = body;
    for key in keys {
        value = &value[*key];
    }
    value.as_str().map(String::from).ok_or_else(|| TrackingError::Api {
        status: 200,
        code: "MALFORMED_RESPONSE".to_string(),
        message: format!("missing '{}' in response", keys.join(".")),
    })
}

impl TrackingBackend for RestClient {
    fn create_run(&mut self, experiment_name: &str, run_name: Option<&str>) -> Result<String> {
        let experiment_id = self.experiment_id(experiment_name)?;
        let mut body = json!({
            "experiment_id": experiment_id,
            "start_time": now_ms(),
        });
        if let Some(name) = run_name {
            body["run_name"] = json!(name);
        }
        let response = self.post("runs/create", body)?;
        let run_id = string_at(&response, &["run", "info", "run_id"])?;
        self.run_experiments.insert(run_id.clone(), experiment_id);
        Ok(run_id)
    }

    fn log_param(&mut self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.post(
            "runs/log-parameter",
            json!({ "run_id": run_id, "key": key, "value": value }),
        )?;
        Ok(())
    }

    fn log_metric(&mut self, run_id: &str, key: &str, value: f64, step: u64) -> Result<()> {
        self.post(
            "runs/log-metric",
            json!({
                "run_id": run_id,
                "key": key,
                "value": metric_value::to_json(value),
                "timestamp": now_ms(),
                "step": step,
            }),
        )?;
        Ok(())
    }

    fn log_artifact(&mut self, run_id: &str, artifact_path: &str, local_path: &Path) -> Result<()> {
        let experiment_id = self
            .run_experiments
            .get(run_id)
            .cloned()
            .ok_or_else(|| TrackingError::RunNotActive(run_id.to_string()))?;
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());

        let url = self.endpoint(
            ARTIFACT_PREFIX,
            &format!("{experiment_id}/{run_id}/artifacts/{artifact_path}/{file_name}"),
        )?;
        let bytes = std::fs::read(local_path)?;
        debug!("PUT {} ({} bytes)", url, bytes.len());
        let response = self.authorize(self.client.put(url)).body(bytes).send()?;
        Self::check(response)?;
        Ok(())
    }

    fn register_model(&mut self, run_id: &str, artifact_path: &str, name: &str) -> Result<()> {
        match self.post("registered-models/create", json!({ "name": name })) {
            Ok(_) => info!("登録モデル '{}' を作成しました", name),
            Err(TrackingError::Api { code, .. }) if code == "RESOURCE_ALREADY_EXISTS" => {}
            Err(e) => return Err(e),
        }

        let body = self.post(
            "model-versions/create",
            json!({
                "name": name,
                "source": format!("runs:/{run_id}/{artifact_path}"),
                "run_id": run_id,
            }),
        )?;
        if let Ok(version) = string_at(&body, &["model_version", "version"]) {
            info!("モデル '{}' のバージョン {} を登録しました", name, version);
        }
        Ok(())
    }

    fn end_run(&mut self, run_id: &str, status: RunStatus) -> Result<()> {
        self.post(
            "runs/update",
            json!({
                "run_id": run_id,
                "status": status.as_str(),
                "end_time": now_ms(),
            }),
        )?;
        self.run_experiments.remove(run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = RestClient::new(
            Url::parse("https://dagshub.com/user/repo.mlflow").unwrap(),
            None,
        )
        .unwrap();
        let url = client.endpoint(API_PREFIX, "runs/create").unwrap();
        assert_eq!(
            url.as_str(),
            "https://dagshub.com/user/repo.mlflow/api/2.0/mlflow/runs/create"
        );
    }

    #[test]
    fn test_string_at() {
        let body = json!({ "run": { "info": { "run_id": "abc" } } });
        assert_eq!(string_at(&body, &["run", "info", "run_id"]).unwrap(), "abc");
        assert!(string_at(&body, &["run", "missing"]).is_err());
    }
}
