// backend/http.rs - reqwest-backed Backend implementation

use super::{Backend, BatchSyncResponse, ConflictEntry, TaskDiff, TaskSummary};
use crate::error::{Error, Result};
use crate::mediator::{CallOptions, RequestMediator};
use crate::model::{Priority, Task, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpBackend {
    base_url: String,
    http: reqwest::Client,
    mediator: Arc<RequestMediator>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration, mediator: Arc<RequestMediator>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            mediator,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(Error::from);
        }

        // 429 may carry `details.retry_after_ms`.
        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let body = response.text().await.unwrap_or_default();
        let details_retry_after = parse_retry_after_details(&body);

        Err(match status {
            StatusCode::CONFLICT => Error::Conflict(body),
            StatusCode::NOT_FOUND => Error::NotFound(body),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::Validation(body),
            _ => Error::Remote {
                code: status.as_u16(),
                message: body,
                retry_after_ms: retry_after_ms.or(details_retry_after),
            },
        })
    }
}

/// Pulls `details.retry_after_ms` out of the error envelope
/// when the server sends it in the body rather than a header.
fn parse_retry_after_details(body: &str) -> Option<u64> {
    #[derive(Deserialize)]
    struct Envelope {
        error: EnvelopeError,
    }
    #[derive(Deserialize)]
    struct EnvelopeError {
        details: Option<serde_json::Value>,
    }
    let envelope: Envelope = serde_json::from_str(body).ok()?;
    envelope.error.details?.get("retry_after_ms")?.as_u64()
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    project: &'a str,
    content: &'a str,
    priority: Priority,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<TaskId>,
}

#[derive(Serialize)]
struct BatchSyncRequest<'a> {
    project: &'a str,
    last_sync_token: Option<&'a str>,
    local_tasks: &'a [TaskSummary],
}

#[derive(Deserialize)]
struct BatchSyncWire {
    server_tasks: Vec<Task>,
    #[serde(default)]
    to_create: Vec<TaskId>,
    #[serde(default)]
    to_update: Vec<TaskId>,
    #[serde(default)]
    to_delete: Vec<TaskId>,
    #[serde(default)]
    conflicts: Vec<ConflictEntry>,
    server_time: DateTime<Utc>,
    sync_token: String,
}

#[async_trait]
impl Backend for HttpBackend {
    async fn create_task(
        &self,
        project: &str,
        content: &str,
        priority: Priority,
        tags: &[String],
        parent_id: Option<TaskId>,
    ) -> Result<Task> {
        self.mediator
            .execute("create_task", CallOptions { idempotent: false, ..Default::default() }, || async {
                let response = self
                    .http
                    .post(self.url("/api/v1/tasks"))
                    .json(&CreateRequest { project, content, priority, tags, parent_id })
                    .send()
                    .await?;
                Self::decode(response).await
            })
            .await
    }

    async fn update_task(&self, id: TaskId, diff: TaskDiff) -> Result<Task> {
        self.mediator
            .execute("update_task", CallOptions::default(), || async {
                let response = self
                    .http
                    .patch(self.url(&format!("/api/v1/tasks/{id}")))
                    .json(&diff)
                    .send()
                    .await?;
                Self::decode(response).await
            })
            .await
    }

    async fn delete_task(&self, id: TaskId) -> Result<()> {
        self.mediator
            .execute("delete_task", CallOptions::default(), || async {
                let response = self.http.delete(self.url(&format!("/api/v1/tasks/{id}"))).send().await?;
                if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
                    return Ok(());
                }
                Self::decode::<()>(response).await
            })
            .await
    }

    async fn get_tasks(&self, project: &str) -> Result<Vec<Task>> {
        self.mediator
            .execute("get_tasks", CallOptions::default(), || async {
                let response = self
                    .http
                    .get(self.url(&format!("/api/v1/tasks?project={project}")))
                    .send()
                    .await?;
                Self::decode(response).await
            })
            .await
    }

    async fn batch_sync(
        &self,
        project: &str,
        local_snapshot: &[TaskSummary],
        last_sync_token: Option<&str>,
    ) -> Result<BatchSyncResponse> {
        let wire: BatchSyncWire = self
            .mediator
            .execute("batch_sync", CallOptions::default(), || async {
                let response = self
                    .http
                    .post(self.url("/api/v1/sync/batch"))
                    .json(&BatchSyncRequest { project, last_sync_token, local_tasks: local_snapshot })
                    .send()
                    .await?;
                Self::decode(response).await
            })
            .await?;

        Ok(BatchSyncResponse {
            server_tasks: wire.server_tasks,
            to_create: wire.to_create,
            to_update: wire.to_update,
            to_delete: wire.to_delete,
            conflicts: wire.conflicts,
            server_time: wire.server_time,
            sync_token: wire.sync_token,
        })
    }

    fn push_url(&self) -> String {
        self.base_url
            .strip_prefix("https://")
            .map(|rest| format!("wss://{rest}/ws"))
            .or_else(|| self.base_url.strip_prefix("http://").map(|rest| format!("ws://{rest}/ws")))
            .unwrap_or_else(|| format!("{}/ws", self.base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;

    fn mediator() -> Arc<RequestMediator> {
        Arc::new(RequestMediator::new(RetryConfig {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            jitter: 0.0,
        }))
    }

    #[test]
    fn push_url_converts_scheme() {
        let backend = HttpBackend::new("https://api.example.com", Duration::from_secs(5), mediator()).unwrap();
        assert_eq!(backend.push_url(), "wss://api.example.com/ws");

        let backend = HttpBackend::new("http://localhost:9080", Duration::from_secs(5), mediator()).unwrap();
        assert_eq!(backend.push_url(), "ws://localhost:9080/ws");
    }

    #[test]
    fn retry_after_details_are_parsed() {
        let body = r#"{"error":{"code":429,"message":"slow down","details":{"retry_after_ms":1500}}}"#;
        assert_eq!(parse_retry_after_details(body), Some(1500));
        assert_eq!(parse_retry_after_details("not json"), None);
    }

    #[tokio::test]
    async fn create_task_against_unreachable_server_surfaces_transient_or_unavailable() {
        let backend = HttpBackend::new("http://127.0.0.1:1", Duration::from_millis(200), mediator()).unwrap();
        let err = backend.create_task("p", "x", Priority::Low, &[], None).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_) | Error::Unavailable));
    }
}
