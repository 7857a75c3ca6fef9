// backend/mod.rs - the backend adapter
//
// One shared `reqwest::Client`, a `build_headers`/`handle_response`
// pair, and generic typed request helpers mapping logical operations
// to the task wire contract. Every call runs through the Request
// Mediator instead of a bare `reqwest` call.

pub mod http;

use crate::error::Result;
use crate::model::{Priority, Status, Task, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fields a `PATCH /api/v1/tasks/{id}` body may carry (
/// "only fields to change").
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskDiff {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

/// The subset of a task's fields sent as part of a batch-sync request's
/// `local_tasks` array.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub content: String,
    pub status: Status,
    pub priority: Priority,
    pub updated_at: DateTime<Utc>,
    pub local_version: u64,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            content: task.content.clone(),
            status: task.status,
            priority: task.priority,
            updated_at: task.updated_at,
            local_version: task.local_version,
        }
    }
}

/// One entry of a batch-sync response's `conflicts` array.
#[derive(Debug, Clone, Deserialize)]
pub struct ConflictEntry {
    pub id: TaskId,
    pub local_task: Task,
    pub server_task: Task,
    #[serde(default)]
    pub server_strategy_hint: Option<String>,
    #[serde(default)]
    pub reason: String,
}

/// Result of `POST /api/v1/sync/batch`.
#[derive(Debug, Clone)]
pub struct BatchSyncResponse {
    pub server_tasks: Vec<Task>,
    pub to_create: Vec<TaskId>,
    pub to_update: Vec<TaskId>,
    pub to_delete: Vec<TaskId>,
    pub conflicts: Vec<ConflictEntry>,
    pub server_time: DateTime<Utc>,
    pub sync_token: String,
}

/// The wire contract the Pull/Push Reconciler and Sync Coordinator speak
/// against. A trait so they can be exercised in tests without a live
/// server.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_task(
        &self,
        project: &str,
        content: &str,
        priority: Priority,
        tags: &[String],
        parent_id: Option<TaskId>,
    ) -> Result<Task>;

    async fn update_task(&self, id: TaskId, diff: TaskDiff) -> Result<Task>;

    async fn delete_task(&self, id: TaskId) -> Result<()>;

    async fn get_tasks(&self, project: &str) -> Result<Vec<Task>>;

    async fn batch_sync(
        &self,
        project: &str,
        local_snapshot: &[TaskSummary],
        last_sync_token: Option<&str>,
    ) -> Result<BatchSyncResponse>;

    /// URL the Push Channel should connect its websocket to.
    fn push_url(&self) -> String;
}

pub use http::HttpBackend;
