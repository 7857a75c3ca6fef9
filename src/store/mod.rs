// store/mod.rs - the offline-capable local store
//
// Durable mapping (project, id) -> Task. File-per-task layout: one
// JSON file per task, atomic write-via-rename, with a `quarantine/`
// directory for records that fail to parse at startup.

pub mod quarantine;

use crate::error::{Error, Result};
use crate::model::{Priority, Status, Task, TaskId};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

/// Query filter for `List`. Multi-value fields are OR'd together; the
/// fields themselves are AND'd.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<Vec<Status>>,
    pub priority: Option<Vec<Priority>>,
    pub tags: Option<Vec<String>>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(priorities) = &self.priority {
            if !priorities.contains(&task.priority) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.iter().any(|t| task.tags.contains(t)) {
                return false;
            }
        }
        true
    }
}

/// Contract for the Local Store. A trait so the Sync Coordinator and
/// Reconciler can be exercised against an in-memory fake in tests,
/// matching the pack-wide convention of a `test-support` fake behind
/// the real adapter (see `oj-adapters`' `FakeAdapter`).
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn create(&self, task: Task) -> Result<Task>;
    async fn get(&self, id: TaskId) -> Result<Task>;
    async fn update(&self, id: TaskId, mutator: Box<dyn for<'a> FnOnce(&'a Task) -> Result<Task> + Send>) -> Result<Task>;
    async fn list(&self, project: &str, filter: &TaskFilter) -> Result<Vec<Task>>;
    async fn delete(&self, id: TaskId) -> Result<()>;
}

struct IdLocks {
    locks: SyncMutex<HashMap<TaskId, Arc<AsyncMutex<()>>>>,
}

impl IdLocks {
    fn new() -> Self {
        Self {
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn get(&self, id: TaskId) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

/// File-backed implementation: `tasks/{project}/{id}.json` per record,
/// an in-memory index kept current under the same per-id lock, and a
/// startup scan that quarantines anything that fails to parse.
pub struct FileStore {
    base_dir: PathBuf,
    index: RwLock<HashMap<TaskId, Task>>,
    locks: IdLocks,
}

impl FileStore {
    /// Open (or create) the store at `base_dir`, scanning `tasks/**` and
    /// quarantining any file that fails to parse.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let tasks_dir = base_dir.join("tasks");
        tokio::fs::create_dir_all(&tasks_dir).await?;

        let mut index = HashMap::new();
        let mut projects = tokio::fs::read_dir(&tasks_dir).await?;
        while let Some(project_entry) = projects.next_entry().await? {
            if !project_entry.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(project_entry.path()).await?;
            while let Some(file_entry) = files.next_entry().await? {
                let path = file_entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match tokio::fs::read_to_string(&path).await {
                    Ok(raw) => match serde_json::from_str::<Task>(&raw) {
                        Ok(task) => {
                            index.insert(task.id, task);
                        }
                        Err(e) => {
                            let _ = quarantine::quarantine_file(&base_dir, &path, &e.to_string()).await;
                        }
                    },
                    Err(e) => {
                        let _ = quarantine::quarantine_file(&base_dir, &path, &e.to_string()).await;
                    }
                }
            }
        }

        tracing::info!(count = index.len(), "local store loaded");

        Ok(Self {
            base_dir,
            index: RwLock::new(index),
            locks: IdLocks::new(),
        })
    }

    fn record_path(&self, project: &str, id: TaskId) -> PathBuf {
        self.base_dir.join("tasks").join(project).join(format!("{id}.json"))
    }

    /// Durable write: serialize to a temp file in the same directory,
    /// then rename over the destination (atomic on the same
    /// filesystem). Runs on a blocking thread since this is plain
    /// synchronous file I/O.
    async fn persist(&self, task: &Task) -> Result<()> {
        let dir = self.base_dir.join("tasks").join(&task.project);
        tokio::fs::create_dir_all(&dir).await?;
        let final_path = self.record_path(&task.project, task.id);
        let tmp_path = dir.join(format!(".{}.tmp", task.id));
        let payload = serde_json::to_vec_pretty(task)?;

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::write(&tmp_path, &payload)?;
            std::fs::rename(&tmp_path, &final_path)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Io(e.to_string()))??;

        Ok(())
    }

    async fn remove_file(&self, project: &str, id: TaskId) -> Result<()> {
        let path = self.record_path(project, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LocalStore for FileStore {
    async fn create(&self, mut task: Task) -> Result<Task> {
        let _guard = self.locks.get(task.id).lock_owned().await;

        if self.index.read().await.contains_key(&task.id) {
            return Err(Error::EntityExists(task.id.to_string()));
        }

        task.local_version = 1;
        task.validate()?;

        self.persist(&task).await?;
        self.index.write().await.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Task> {
        self.index
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn update(&self, id: TaskId, mutator: Box<dyn for<'a> FnOnce(&'a Task) -> Result<Task> + Send>) -> Result<Task> {
        let _guard = self.locks.get(id).lock_owned().await;

        let current = self
            .index
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        // Validation runs before commit; on failure the prior record is
        // simply never written (I5) — there is nothing to roll back.
        let candidate = mutator(&current)?;
        candidate.validate()?;

        self.persist(&candidate).await?;
        self.index.write().await.insert(id, candidate.clone());
        Ok(candidate)
    }

    async fn list(&self, project: &str, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self
            .index
            .read()
            .await
            .values()
            .filter(|t| t.project == project && filter.matches(t))
            .cloned()
            .collect())
    }

    async fn delete(&self, id: TaskId) -> Result<()> {
        let _guard = self.locks.get(id).lock_owned().await;

        let task = self.index.write().await.remove(&id);
        if let Some(task) = task {
            self.remove_file(&task.project, id).await?;
        }
        Ok(())
    }
}

/// Resolve the well-known per-user directory for persisted state.
pub fn default_base_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("tasksync"))
        .ok_or_else(|| Error::Config("could not resolve a data directory for this platform".into()))
}
