// lib.rs - main library entry point
//
// A client-side, offline-capable bidirectional task-sync engine: the
// Local Store (C1) is the only thing application code reads from
// directly; the Sync Coordinator (C6) is the only thing that writes
// through to it, fanning out to the Request Mediator (C2), Push
// Channel (C3), Pull/Push Reconciler (C4) and Conflict Resolver (C5)
// to keep it converged with the server's Backend Adapter (C7).

pub mod atomic;
pub mod backend;
pub mod bus;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mediator;
pub mod model;
pub mod push;
pub mod reconciler;
pub mod resolver;
pub mod store;

pub use backend::{Backend, HttpBackend};
pub use bus::{Bus, SyncEvent};
pub use clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use config::Config;
pub use coordinator::{SyncCoordinator, SyncQueueStats};
pub use error::{Error, Result};
pub use mediator::RequestMediator;
pub use model::{MetadataValue, Priority, Status, Task, TaskId};
pub use push::{PushChannel, PushEvent, PushState};
pub use resolver::ConflictResolver;
pub use store::{FileStore, LocalStore, TaskFilter};

use std::sync::Arc;

/// Everything the binary (or an embedding application) needs to drive
/// the engine: the coordinator plus the push channel it feeds from.
pub struct Engine {
    pub coordinator: Arc<SyncCoordinator<FileStore, HttpBackend>>,
    pub push: Arc<PushChannel>,
}

/// Wire up every component per the configuration surface and
/// persisted-state layout. Does not start the background drive
/// loop — call [`Engine::run`] for that.
pub async fn build(config: Config) -> Result<Engine> {
    let state_dir = store::default_base_dir()?;
    let store = Arc::new(FileStore::open(&state_dir).await?);

    let mediator = Arc::new(RequestMediator::new(config.retry.clone()));
    let backend = Arc::new(HttpBackend::new(config.server.url.clone(), config.server.timeout, mediator.clone())?);

    let resolver = ConflictResolver::new(config.sync.skew_tolerance);
    let bus = Arc::new(Bus::default());

    let clock: SharedClock = Arc::new(SystemClock);
    let coordinator = Arc::new(SyncCoordinator::new(store, backend.clone(), resolver, bus, clock, &state_dir).await?);

    let subscriptions = coordinator.load_subscriptions().await?;
    let push = Arc::new(PushChannel::spawn(backend.push_url(), config.push.clone(), mediator.reachability()));
    if !subscriptions.is_empty() {
        push.subscribe(subscriptions).await;
    }

    Ok(Engine { coordinator, push })
}

impl Engine {
    /// Drive reconciliation forever: a periodic timer as the
    /// default trigger, plus immediate handling of every push event and
    /// a sync pass on every channel (re)connect. `seed_projects` is
    /// synced once up front (so a project nobody has touched yet this
    /// run still gets its first pass); every trigger after that covers
    /// every project the coordinator has ever seen, not just the seed
    /// set, since `create_task`/`list_tasks` can grow that set at any
    /// time. Returns only if the push channel's command loop shuts
    /// down.
    pub async fn run(&self, seed_projects: &[String], sync_interval: std::time::Duration) {
        for project in seed_projects {
            if let Err(err) = self.coordinator.sync(project).await {
                tracing::warn!(%err, %project, "initial sync pass failed");
            }
        }

        let mut ticker = tokio::time::interval(sync_interval);
        let mut push_state = self.push.watch_state();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_known_projects("periodic sync pass failed").await;
                }
                event = self.push.recv() => {
                    if self.push.take_resync_needed() {
                        self.sync_known_projects("resync after dropped push events failed").await;
                    }
                    if let Err(err) = self.coordinator.handle_push_event(event).await {
                        tracing::warn!(%err, "failed to apply push event");
                    }
                }
                changed = push_state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *push_state.borrow() == PushState::Connected {
                        self.sync_known_projects("sync on reconnect failed").await;
                    }
                }
            }
        }
    }

    /// Reconcile every project the coordinator has ever been asked to
    /// touch, logging (but not aborting the loop on) a per-project
    /// failure.
    async fn sync_known_projects(&self, failure_msg: &str) {
        for project in self.coordinator.known_projects().await {
            if let Err(err) = self.coordinator.sync(&project).await {
                tracing::warn!(%err, %project, "{}", failure_msg);
            }
        }
    }
}
