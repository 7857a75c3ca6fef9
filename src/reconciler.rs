// reconciler.rs - the pull/push reconciler
//
// Exchanges state with the server in one batch call and turns the
// server's classifications into a plan; never touches the Local Store
// itself — applying the plan is the coordinator's job.

use crate::backend::{Backend, TaskSummary};
use crate::error::Result;
use crate::model::{Task, TaskId};
use crate::resolver::{ConflictResolver, ConflictStrategy};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ResolvedConflict {
    pub id: TaskId,
    pub resolved: Task,
    pub strategy: ConflictStrategy,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub to_create_locally: Vec<Task>,
    pub to_update_locally: Vec<Task>,
    pub to_delete_locally: Vec<TaskId>,
    pub conflicts: Vec<ResolvedConflict>,
    pub new_sync_token: String,
}

pub struct Reconciler<B: Backend> {
    backend: Arc<B>,
    resolver: ConflictResolver,
}

impl<B: Backend> Reconciler<B> {
    pub fn new(backend: Arc<B>, resolver: ConflictResolver) -> Self {
        Self { backend, resolver }
    }

    /// Run one reconciliation pass for `project`. On any error from the
    /// backend the call is aborted and no plan is produced (a
    /// reconciliation failure aborts the plan; local state is
    /// untouched").
    pub async fn reconcile(&self, project: &str, local_snapshot: &[Task], last_sync_token: Option<&str>) -> Result<ReconcilePlan> {
        let summaries: Vec<TaskSummary> = local_snapshot.iter().map(TaskSummary::from).collect();
        let response = self.backend.batch_sync(project, &summaries, last_sync_token).await?;

        let server_by_id: HashMap<TaskId, &Task> = response.server_tasks.iter().map(|t| (t.id, t)).collect();

        let to_create_locally = response
            .to_create
            .iter()
            .filter_map(|id| server_by_id.get(id).map(|t| (*t).clone()))
            .collect();
        let to_update_locally = response
            .to_update
            .iter()
            .filter_map(|id| server_by_id.get(id).map(|t| (*t).clone()))
            .collect();

        let mut conflicts = Vec::with_capacity(response.conflicts.len());
        for entry in &response.conflicts {
            let (resolved, strategy) = self.resolver.resolve(&entry.local_task, &entry.server_task, None)?;
            conflicts.push(ResolvedConflict { id: entry.id, resolved, strategy });
        }

        Ok(ReconcilePlan {
            to_create_locally,
            to_update_locally,
            to_delete_locally: response.to_delete,
            conflicts,
            new_sync_token: response.sync_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BatchSyncResponse, ConflictEntry, TaskDiff};
    use crate::model::Priority;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct MockBackend {
        response: Mutex<Option<BatchSyncResponse>>,
    }

    #[async_trait]
    impl Backend for MockBackend {
        async fn create_task(
            &self,
            _project: &str,
            _content: &str,
            _priority: Priority,
            _tags: &[String],
            _parent_id: Option<TaskId>,
        ) -> Result<Task> {
            unimplemented!("not exercised by reconciler tests")
        }
        async fn update_task(&self, _id: TaskId, _diff: TaskDiff) -> Result<Task> {
            unimplemented!("not exercised by reconciler tests")
        }
        async fn delete_task(&self, _id: TaskId) -> Result<()> {
            unimplemented!("not exercised by reconciler tests")
        }
        async fn get_tasks(&self, _project: &str) -> Result<Vec<Task>> {
            unimplemented!("not exercised by reconciler tests")
        }
        async fn batch_sync(&self, _project: &str, _local: &[TaskSummary], _token: Option<&str>) -> Result<BatchSyncResponse> {
            Ok(self.response.lock().unwrap().take().expect("response configured"))
        }
        fn push_url(&self) -> String {
            "ws://test/ws".into()
        }
    }

    fn reconciler_with(response: BatchSyncResponse) -> Reconciler<MockBackend> {
        Reconciler::new(
            Arc::new(MockBackend { response: Mutex::new(Some(response)) }),
            ConflictResolver::new(Duration::from_secs(2)),
        )
    }

    #[tokio::test]
    async fn classifies_creates_updates_and_deletes_from_server_hints() {
        let created = Task::new("p", "new from server", Priority::Low, chrono::Utc::now());
        let updated = Task::new("p", "updated from server", Priority::Low, chrono::Utc::now());
        let deleted_id = TaskId::new();

        let response = BatchSyncResponse {
            server_tasks: vec![created.clone(), updated.clone()],
            to_create: vec![created.id],
            to_update: vec![updated.id],
            to_delete: vec![deleted_id],
            conflicts: Vec::new(),
            server_time: chrono::Utc::now(),
            sync_token: "tok-1".into(),
        };

        let plan = reconciler_with(response).reconcile("p", &[], None).await.unwrap();
        assert_eq!(plan.to_create_locally.len(), 1);
        assert_eq!(plan.to_create_locally[0].id, created.id);
        assert_eq!(plan.to_update_locally.len(), 1);
        assert_eq!(plan.to_delete_locally, vec![deleted_id]);
        assert_eq!(plan.new_sync_token, "tok-1");
    }

    #[tokio::test]
    async fn resolves_server_marked_conflicts() {
        let id = TaskId::new();
        let now = chrono::Utc::now();
        let mut local = Task::new("p", "local edit", Priority::Medium, now);
        local.id = id;
        let mut server = Task::new("p", "server edit", Priority::Medium, now + chrono::Duration::seconds(10));
        server.id = id;

        let response = BatchSyncResponse {
            server_tasks: vec![server.clone()],
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
            conflicts: vec![ConflictEntry {
                id,
                local_task: local,
                server_task: server.clone(),
                server_strategy_hint: None,
                reason: "both changed since last sync".into(),
            }],
            server_time: now,
            sync_token: "tok-2".into(),
        };

        let plan = reconciler_with(response).reconcile("p", &[], Some("tok-1")).await.unwrap();
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].strategy, ConflictStrategy::ServerWinsNewer);
        assert_eq!(plan.conflicts[0].resolved.content, "server edit");
    }
}
