//! Stage 3: image-to-3D generation through the Tripo OpenAPI.
//!
//! A generation is four round trips: upload the image for a file token,
//! create a task referencing it, poll the task until it settles, then
//! download the resulting GLB. Each request is retried on transient
//! failure; polling has its own deadline (`task_timeout_secs`).

use crate::config::{resolve_api_key, TripoConfig};
use crate::error::GuideError;
use crate::layout::write_atomic;
use crate::pipeline::retry::with_backoff;
use crate::services::ModelGenerator;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SERVICE: &str = "tripo";

/// Terminal and in-flight task states reported by the API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Banned,
    Expired,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    fn is_pending(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }

    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Banned => "banned",
            TaskStatus::Expired => "expired",
            TaskStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct UploadData {
    image_token: String,
}

#[derive(Debug, Deserialize)]
struct TaskCreated {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    status: TaskStatus,
    #[serde(default)]
    progress: Option<u32>,
    #[serde(default)]
    output: Option<Value>,
}

impl TaskInfo {
    /// Best available model URL: PBR, then plain, then base mesh.
    fn model_url(&self) -> Option<String> {
        let output = self.output.as_ref()?;
        ["pbr_model", "model", "base_model"]
            .iter()
            .find_map(|key| match output.get(*key)? {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Object(o) => o.get("url")?.as_str().map(str::to_string),
                _ => None,
            })
    }
}

/// Views for [`TripoClient::multiview_to_model`]; only `front` is required.
#[derive(Debug, Clone, Copy)]
pub struct MultiviewImages<'a> {
    pub front: &'a Path,
    pub left: Option<&'a Path>,
    pub back: Option<&'a Path>,
    pub right: Option<&'a Path>,
}

/// Client for the Tripo 3D generation API.
#[derive(Debug, Clone)]
pub struct TripoClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    task_timeout: Duration,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl TripoClient {
    /// Build a client; the key comes from the config or `TRIPO_API_KEY`.
    pub fn new(
        config: &TripoConfig,
        request_timeout_secs: u64,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self, GuideError> {
        let api_key = resolve_api_key(config.api_key.as_deref(), "TRIPO_API_KEY", SERVICE)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|source| GuideError::Http {
                service: SERVICE,
                source,
            })?;
        Ok(Self {
            http,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            task_timeout: Duration::from_secs(config.task_timeout_secs),
            max_retries,
            retry_backoff_ms,
        })
    }

    /// Generate a model from several views of the same object.
    ///
    /// Views are sent in `[front, left, back, right]` order; absent views are
    /// sent as empty objects.
    pub async fn multiview_to_model(
        &self,
        views: MultiviewImages<'_>,
        dest: &Path,
    ) -> Result<(), GuideError> {
        if views.left.is_none() && views.back.is_none() && views.right.is_none() {
            return Err(GuideError::MultiviewNeedsViews);
        }

        let mut files = Vec::with_capacity(4);
        for view in [Some(views.front), views.left, views.back, views.right] {
            match view {
                Some(path) => {
                    let token = self.upload(path).await?;
                    files.push(json!({ "type": file_type(path), "file_token": token }));
                }
                None => files.push(json!({})),
            }
        }

        let task_id = self
            .create_task(json!({ "type": "multiview_to_model", "files": files }))
            .await?;
        self.finish(&task_id, dest).await
    }

    async fn upload(&self, image: &Path) -> Result<String, GuideError> {
        let bytes = tokio::fs::read(image)
            .await
            .map_err(|e| GuideError::io(image, e))?;
        let filename = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.png".to_string());
        let mime = mime_for(image);
        let url = format!("{}/upload", self.base_url);

        let data: UploadData = with_backoff("tripo upload", self.max_retries, self.retry_backoff_ms, || {
            let part = Part::bytes(bytes.clone())
                .file_name(filename.clone())
                .mime_str(mime);
            let url = url.clone();
            async move {
                let part = part.map_err(|source| GuideError::Http {
                    service: SERVICE,
                    source,
                })?;
                let request = self
                    .http
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .multipart(Form::new().part("file", part));
                self.send(request).await
            }
        })
        .await?;

        debug!("Uploaded {} as {}", image.display(), data.image_token);
        Ok(data.image_token)
    }

    async fn create_task(&self, body: Value) -> Result<String, GuideError> {
        let url = format!("{}/task", self.base_url);
        let created: TaskCreated =
            with_backoff("tripo task", self.max_retries, self.retry_backoff_ms, || {
                let request = self.http.post(&url).bearer_auth(&self.api_key).json(&body);
                self.send(request)
            })
            .await?;
        info!("Created 3D task {}", created.task_id);
        Ok(created.task_id)
    }

    /// Poll until the task leaves queued/running or the deadline passes.
    async fn wait_for_task(&self, task_id: &str) -> Result<TaskInfo, GuideError> {
        let url = format!("{}/task/{}", self.base_url, task_id);
        let deadline = Instant::now() + self.task_timeout;

        loop {
            let task: TaskInfo =
                with_backoff("tripo poll", self.max_retries, self.retry_backoff_ms, || {
                    self.send(self.http.get(&url).bearer_auth(&self.api_key))
                })
                .await?;

            if !task.status.is_pending() {
                return Ok(task);
            }
            debug!(
                "Task {}: {} ({}%)",
                task_id,
                task.status.as_str(),
                task.progress.unwrap_or(0)
            );
            if Instant::now() >= deadline {
                return Err(GuideError::ModelTaskTimeout {
                    task_id: task_id.to_string(),
                    secs: self.task_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn finish(&self, task_id: &str, dest: &Path) -> Result<(), GuideError> {
        let task = self.wait_for_task(task_id).await?;
        if task.status != TaskStatus::Success {
            warn!("Task {} ended with status {}", task_id, task.status.as_str());
            return Err(GuideError::ModelTaskFailed {
                task_id: task_id.to_string(),
                status: task.status.as_str().to_string(),
            });
        }

        let model_url = task.model_url().ok_or_else(|| GuideError::ModelMissing {
            task_id: task_id.to_string(),
        })?;
        let bytes = self.download(&model_url).await?;
        write_atomic(dest, &bytes).await?;
        info!(
            "Task {}: model saved to {} ({:.1} KB)",
            task_id,
            dest.display(),
            bytes.len() as f64 / 1024.0
        );
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, GuideError> {
        with_backoff("tripo download", self.max_retries, self.retry_backoff_ms, || async move {
            let response = self.http.get(url).send().await.map_err(|source| GuideError::Http {
                service: SERVICE,
                source,
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(GuideError::ModelApiError {
                    status: status.as_u16(),
                    message: format!("model download returned {status}"),
                });
            }
            let bytes = response.bytes().await.map_err(|source| GuideError::Http {
                service: SERVICE,
                source,
            })?;
            Ok(bytes.to_vec())
        })
        .await
    }

    /// Send a request and unwrap the `{code, data}` envelope.
    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GuideError> {
        let response = request.send().await.map_err(|source| GuideError::Http {
            service: SERVICE,
            source,
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|source| GuideError::Http {
            service: SERVICE,
            source,
        })?;

        if !status.is_success() {
            return Err(GuideError::ModelApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|e| GuideError::ModelApiError {
                status: status.as_u16(),
                message: format!("unexpected response body: {e}"),
            })?;
        if envelope.code != 0 {
            return Err(GuideError::ModelApiError {
                status: status.as_u16(),
                message: envelope
                    .message
                    .unwrap_or_else(|| format!("code {}", envelope.code)),
            });
        }
        envelope.data.ok_or_else(|| GuideError::ModelApiError {
            status: status.as_u16(),
            message: "response carried no data".to_string(),
        })
    }
}

#[async_trait]
impl ModelGenerator for TripoClient {
    async fn image_to_model(&self, image: &Path, dest: &Path) -> Result<(), GuideError> {
        let token = self.upload(image).await?;
        let task_id = self
            .create_task(json!({
                "type": "image_to_model",
                "file": { "type": file_type(image), "file_token": token },
            }))
            .await?;
        self.finish(&task_id, dest).await
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn file_type(path: &Path) -> String {
    match extension(path).as_str() {
        "jpg" | "jpeg" => "jpg".to_string(),
        "webp" => "webp".to_string(),
        _ => "png".to_string(),
    }
}

fn mime_for(path: &Path) -> &'static str {
    match extension(path).as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "image/png",
    }
}
