// coordinator.rs - the sync coordinator
//
// The only component that mutates the local store after startup. Owns
// a per-id lock table distinct from the store's own: this lock
// serializes *callers* of the store, while the store's own lock is an
// implementation detail of its atomicity, not a substitute. Also
// serializes reconciliation per project with coalescing rather than
// queuing extra triggers.

use crate::atomic;
use crate::backend::Backend;
use crate::bus::{Bus, SyncEvent};
use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::model::{Priority, Status, Task, TaskId};
use crate::push::PushEvent;
use crate::reconciler::{ReconcilePlan, Reconciler};
use crate::resolver::ConflictResolver;
use crate::store::{LocalStore, TaskFilter};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Failed-sync retry count at or above which an entry stops being
/// retried automatically and surfaces as `failed` rather than
/// `pending` in `queue_stats`.
const FAILED_SYNC_THRESHOLD: i32 = 5;

/// A lock table keyed by an arbitrary hashable key, handed out as
/// owned guards so callers can hold one across `.await` points.
struct KeyedLocks<K: Eq + std::hash::Hash + Clone> {
    locks: SyncMutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + std::hash::Hash + Clone> KeyedLocks<K> {
    fn new() -> Self {
        Self { locks: SyncMutex::new(HashMap::new()) }
    }

    fn get(&self, key: K) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

/// Where a project's `last_sync_token` is persisted.
fn sync_state_path(state_dir: &Path) -> PathBuf {
    state_dir.join("state").join("sync.json")
}

/// Where the last-known subscription set is persisted, so the Push
/// Channel can resume its subscriptions across a restart.
fn subscriptions_path(state_dir: &Path) -> PathBuf {
    state_dir.join("state").join("subscriptions.json")
}

/// Where the failed/pending direct-push tracker is persisted.
fn failed_syncs_path(state_dir: &Path) -> PathBuf {
    state_dir.join("state").join("failed_syncs.json")
}

/// One task id's direct-push-to-server track record: how many times a
/// `create_task`/`update_status` call has failed to reach the server in
/// a row, and when the first such failure for this id was observed.
/// Cleared the moment the id is seen synced again, whether via a
/// successful direct push or a later reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailedSyncEntry {
    #[allow(dead_code)]
    project: String,
    retry_count: i32,
    #[allow(dead_code)]
    last_error: String,
    created_at: DateTime<Utc>,
}

/// Sync-queue visibility: how many locally-made changes are still
/// waiting to reach the server, how many have exhausted automatic
/// retries and need operator attention, and how long the oldest
/// pending one has been waiting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SyncQueueStats {
    pub pending_count: usize,
    pub failed_count: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}

pub struct SyncCoordinator<S: LocalStore, B: Backend> {
    store: Arc<S>,
    backend: Arc<B>,
    reconciler: Reconciler<B>,
    bus: Arc<Bus>,
    clock: SharedClock,
    state_dir: PathBuf,
    id_locks: KeyedLocks<TaskId>,
    project_locks: KeyedLocks<String>,
    pending_reconcile: AsyncMutex<HashSet<String>>,
    sync_tokens: AsyncMutex<HashMap<String, String>>,
    known_projects: AsyncMutex<HashSet<String>>,
    failed_syncs: AsyncMutex<HashMap<String, FailedSyncEntry>>,
}

impl<S: LocalStore, B: Backend> SyncCoordinator<S, B> {
    pub async fn new(
        store: Arc<S>,
        backend: Arc<B>,
        resolver: ConflictResolver,
        bus: Arc<Bus>,
        clock: SharedClock,
        state_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let state_dir = state_dir.into();
        let sync_tokens = atomic::read_json::<HashMap<String, String>>(&sync_state_path(&state_dir))
            .await?
            .unwrap_or_default();
        let known_projects: Vec<String> = atomic::read_json(&subscriptions_path(&state_dir)).await?.unwrap_or_default();
        let failed_syncs = atomic::read_json::<HashMap<String, FailedSyncEntry>>(&failed_syncs_path(&state_dir))
            .await?
            .unwrap_or_default();

        Ok(Self {
            reconciler: Reconciler::new(backend.clone(), resolver),
            store,
            backend,
            bus,
            clock,
            state_dir,
            id_locks: KeyedLocks::new(),
            project_locks: KeyedLocks::new(),
            pending_reconcile: AsyncMutex::new(HashSet::new()),
            sync_tokens: AsyncMutex::new(sync_tokens),
            known_projects: AsyncMutex::new(known_projects.into_iter().collect()),
            failed_syncs: AsyncMutex::new(failed_syncs),
        })
    }

    /// Last known subscription set, for handing to a freshly spawned
    /// `PushChannel` so it can resubscribe without waiting for a first
    /// call to `list_tasks`/`sync`.
    pub async fn load_subscriptions(&self) -> Result<Vec<String>> {
        Ok(atomic::read_json(&subscriptions_path(&self.state_dir)).await?.unwrap_or_default())
    }

    /// Every project this coordinator has ever been asked to touch
    /// (via `create_task`/`list_tasks`/`sync`, or an unknown-id push
    /// event), restored from disk on construction. Drives per-project
    /// reconciliation triggers that aren't scoped to a single caller-
    /// known project (the periodic timer, reconnect catch-up).
    pub async fn known_projects(&self) -> Vec<String> {
        self.known_projects.lock().await.iter().cloned().collect()
    }

    async fn track_project(&self, project: &str) -> Result<()> {
        let mut known = self.known_projects.lock().await;
        if known.insert(project.to_string()) {
            let all: Vec<String> = known.iter().cloned().collect();
            drop(known);
            atomic::write_json(&subscriptions_path(&self.state_dir), &all).await?;
        }
        Ok(())
    }

    /// Record that a direct push to the server for `id` failed, bumping
    /// its retry count. Persisted so `queue_stats` survives a restart.
    async fn mark_sync_failed(&self, project: &str, id: TaskId, error: &str) -> Result<()> {
        let clock = &self.clock;
        let snapshot = {
            let mut failed = self.failed_syncs.lock().await;
            let entry = failed.entry(id.to_string()).or_insert_with(|| FailedSyncEntry {
                project: project.to_string(),
                retry_count: 0,
                last_error: String::new(),
                created_at: clock.now(),
            });
            entry.retry_count += 1;
            entry.last_error = error.to_string();
            failed.clone()
        };
        atomic::write_json(&failed_syncs_path(&self.state_dir), &snapshot).await
    }

    /// Clear `id`'s failed-sync track record, if any: it has reached
    /// the server (directly or via reconciliation) and is no longer
    /// pending or failed.
    async fn mark_sync_completed(&self, id: TaskId) -> Result<()> {
        let snapshot = {
            let mut failed = self.failed_syncs.lock().await;
            if failed.remove(&id.to_string()).is_none() {
                return Ok(());
            }
            failed.clone()
        };
        atomic::write_json(&failed_syncs_path(&self.state_dir), &snapshot).await
    }

    /// `SyncQueueStats`: how many ids are waiting to reach the server,
    /// how many have exhausted automatic retries, and the oldest
    /// still-pending one's first-failure time.
    pub async fn queue_stats(&self) -> SyncQueueStats {
        let failed = self.failed_syncs.lock().await;
        let mut stats = SyncQueueStats::default();
        for entry in failed.values() {
            if entry.retry_count >= FAILED_SYNC_THRESHOLD {
                stats.failed_count += 1;
            } else {
                stats.pending_count += 1;
                stats.oldest_pending = Some(match stats.oldest_pending {
                    Some(oldest) if oldest <= entry.created_at => oldest,
                    _ => entry.created_at,
                });
            }
        }
        stats
    }

    /// Drop every entry that has exhausted automatic retries. Manual
    /// operator intervention for ids this system will not retry on its
    /// own; the next reconciliation pass is unaffected either way,
    /// since it always resends the full local snapshot regardless of
    /// this tracker.
    pub async fn clear_failed_syncs(&self) -> Result<usize> {
        let (removed, snapshot) = {
            let mut failed = self.failed_syncs.lock().await;
            let before = failed.len();
            failed.retain(|_, entry| entry.retry_count < FAILED_SYNC_THRESHOLD);
            (before - failed.len(), failed.clone())
        };
        atomic::write_json(&failed_syncs_path(&self.state_dir), &snapshot).await?;
        Ok(removed)
    }

    /// Reset every exhausted entry's retry count to zero, moving it
    /// back from `failed` to `pending` in `queue_stats`.
    pub async fn retry_failed_syncs(&self) -> Result<usize> {
        let (reset, snapshot) = {
            let mut failed = self.failed_syncs.lock().await;
            let mut reset = 0usize;
            for entry in failed.values_mut() {
                if entry.retry_count >= FAILED_SYNC_THRESHOLD {
                    entry.retry_count = 0;
                    entry.last_error.clear();
                    reset += 1;
                }
            }
            (reset, failed.clone())
        };
        atomic::write_json(&failed_syncs_path(&self.state_dir), &snapshot).await?;
        Ok(reset)
    }

    /// `CreateTask`: local-first write, then a best-effort server create.
    /// A server failure here is not fatal — the next reconciliation pass
    /// picks the task up as part of the local snapshot it sends.
    pub async fn create_task(&self, project: &str, content: &str, priority: Priority) -> Result<Task> {
        self.track_project(project).await?;

        let now = self.clock.now();
        let task = Task::new(project, content, priority, now);
        let guard = self.id_locks.get(task.id);
        let _held = guard.lock_owned().await;

        let created = self.store.create(task).await?;

        // I1: the id is client-assigned and immutable. The server's
        // create response is a liveness confirmation, not a rename —
        // we never adopt a server-returned id. The next reconciliation
        // pass true's up any other fields the server computed (e.g.
        // `created_at` clamped server-side) via the batch-sync path,
        // keyed by this same id.
        match self.backend.create_task(project, &created.content, created.priority, &created.tags, created.parent_id).await {
            Ok(_) => {
                self.mark_sync_completed(created.id).await?;
                self.bus.publish(SyncEvent::Synced { project: project.to_string(), id: created.id });
            }
            Err(err) => {
                tracing::warn!(%err, id = %created.id, "create_task: server create failed, will reconcile later");
                self.mark_sync_failed(project, created.id, &err.to_string()).await?;
            }
        }
        Ok(created)
    }

    /// `UpdateStatus`: validates I3/I4 via `Task::with_status`, commits
    /// locally, then attempts to push the change to the server.
    pub async fn update_status(&self, id: TaskId, new_status: Status) -> Result<Task> {
        let guard = self.id_locks.get(id);
        let _held = guard.lock_owned().await;

        let now = self.clock.now();
        let updated = self.store.update(id, Box::new(move |current| current.with_status(new_status, now))).await?;

        let diff = crate::backend::TaskDiff { status: Some(new_status), ..Default::default() };
        if let Err(err) = self.backend.update_task(id, diff).await {
            tracing::warn!(%err, %id, "update_status: server update failed, will reconcile later");
            self.mark_sync_failed(&updated.project, id, &err.to_string()).await?;
        } else {
            self.mark_sync_completed(id).await?;
            self.bus.publish(SyncEvent::Synced { project: updated.project.clone(), id });
        }

        Ok(updated)
    }

    /// `ListTasks`: a pure read against the Local Store; never touches
    /// the network.
    pub async fn list_tasks(&self, project: &str, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.track_project(project).await?;
        self.store.list(project, filter).await
    }

    /// `Sync`: run an immediate reconciliation pass for `project`,
    /// exclusive per project with concurrent triggers coalesced into a
    /// single follow-up pass rather than queued.
    pub async fn sync(&self, project: &str) -> Result<()> {
        self.track_project(project).await?;

        let project_lock = self.project_locks.get(project.to_string());
        let held = match project_lock.clone().try_lock_owned() {
            Ok(held) => held,
            Err(_) => {
                self.pending_reconcile.lock().await.insert(project.to_string());
                return Ok(());
            }
        };

        self.run_pass_and_drain_coalesced(project, held).await
    }

    async fn run_pass_and_drain_coalesced(&self, project: &str, held: tokio::sync::OwnedMutexGuard<()>) -> Result<()> {
        loop {
            self.pending_reconcile.lock().await.remove(project);

            if let Err(err) = self.run_one_pass(project).await {
                self.bus.publish(SyncEvent::ReconcileFailed { project: project.to_string(), error: err.to_string() });
                return Err(err);
            }

            // A trigger that arrived mid-pass coalesces into one more
            // pass instead of being dropped or separately queued; the
            // project lock stays held across the follow-up pass.
            if !self.pending_reconcile.lock().await.contains(project) {
                break;
            }
        }
        drop(held);
        Ok(())
    }

    async fn run_one_pass(&self, project: &str) -> Result<()> {
        let local = self.store.list(project, &TaskFilter::default()).await?;
        let token = self.sync_tokens.lock().await.get(project).cloned();

        let plan = self.reconciler.reconcile(project, &local, token.as_deref()).await?;
        self.apply_plan(project, plan).await
    }

    async fn apply_plan(&self, project: &str, plan: ReconcilePlan) -> Result<()> {
        for task in plan.to_create_locally {
            self.apply_server_task(project, task).await?;
        }
        for task in plan.to_update_locally {
            self.apply_server_task(project, task).await?;
        }
        for id in plan.to_delete_locally {
            let guard = self.id_locks.get(id);
            let _held = guard.lock_owned().await;
            match self.store.delete(id).await {
                Ok(()) => {
                    self.mark_sync_completed(id).await?;
                    self.bus.publish(SyncEvent::Synced { project: project.to_string(), id });
                }
                Err(e) => return Err(e),
            }
        }
        for conflict in plan.conflicts {
            self.apply_server_task(project, conflict.resolved).await?;
            self.bus.publish(SyncEvent::ConflictResolved { project: project.to_string(), id: conflict.id, strategy: conflict.strategy });
        }

        self.set_sync_token(project, plan.new_sync_token).await
    }

    /// Create-or-update a server-sourced snapshot under the per-id lock;
    /// `EntityExists` on create falls back to an update (plan step
    /// 1: "on EntityExists, treat as to_update_locally").
    async fn apply_server_task(&self, project: &str, task: Task) -> Result<()> {
        let id = task.id;
        let guard = self.id_locks.get(id);
        let _held = guard.lock_owned().await;

        match self.store.create(task.clone()).await {
            Ok(_) => {}
            Err(Error::EntityExists(_)) => {
                self.store.update(id, Box::new(move |_| Ok(task.clone()))).await?;
            }
            Err(e) => return Err(e),
        }
        self.mark_sync_completed(id).await?;
        self.bus.publish(SyncEvent::Synced { project: project.to_string(), id });
        Ok(())
    }

    async fn set_sync_token(&self, project: &str, token: String) -> Result<()> {
        let snapshot = {
            let mut tokens = self.sync_tokens.lock().await;
            tokens.insert(project.to_string(), token);
            tokens.clone()
        };
        atomic::write_json(&sync_state_path(&self.state_dir), &snapshot).await
    }

    /// Consume one event off the Push Channel (a push event
    /// for an unknown local id is itself a reconciliation trigger).
    /// Idempotency rule: `if local.updated_at >= event.updated_at:
    /// ignore; else apply through the same serialized path.`
    pub async fn handle_push_event(&self, event: PushEvent) -> Result<()> {
        match event {
            PushEvent::TaskCreated { project, id, task } | PushEvent::TaskUpdated { project, id, task } => {
                match self.store.get(id).await {
                    Ok(existing) => {
                        if existing.updated_at >= task.updated_at {
                            return Ok(());
                        }
                        self.apply_server_task(&project, task).await
                    }
                    Err(Error::NotFound(_)) => {
                        self.apply_server_task(&project, task).await?;
                        self.sync(&project).await
                    }
                    Err(e) => Err(e),
                }
            }
            PushEvent::TaskDeleted { project, id } => {
                let guard = self.id_locks.get(id);
                let _held = guard.lock_owned().await;
                match self.store.delete(id).await {
                    Ok(()) => {
                        self.mark_sync_completed(id).await?;
                        self.bus.publish(SyncEvent::Synced { project, id });
                        Ok(())
                    }
                    Err(Error::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            PushEvent::Resubscribed => {
                let projects: Vec<String> = self.known_projects.lock().await.iter().cloned().collect();
                for project in projects {
                    self.sync(&project).await?;
                }
                Ok(())
            }
        }
    }
}
