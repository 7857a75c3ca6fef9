// push/mod.rs - the push channel
//
// A `tokio::select!` loop over `read.next()` and a shutdown signal,
// reconnect-with-backoff around the connect step, translating inbound
// frames to typed events over a bounded queue.

pub mod frame;

use crate::config::PushConfig;
use crate::model::{Task, TaskId};
use frame::{Frame, TaskEventKind};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;

const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

#[derive(Debug, Clone)]
pub enum PushEvent {
    TaskCreated { project: String, id: TaskId, task: Task },
    TaskUpdated { project: String, id: TaskId, task: Task },
    TaskDeleted { project: String, id: TaskId },
    /// The channel (re)connected; subscriptions were just re-asserted.
    /// Callers should treat this as a hint to force a reconciliation
    /// pass, since no replay of missed events is claimed.
    Resubscribed,
}

enum Command {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Shutdown,
}

/// Bounded event queue with drop-oldest overflow: once full,
/// the oldest undelivered event is discarded and `resync_needed` latches
/// until a caller observes it.
struct EventQueue {
    items: Mutex<VecDeque<PushEvent>>,
    notify: Notify,
    capacity: usize,
    resync_needed: AtomicBool,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            notify: Notify::new(),
            capacity,
            resync_needed: AtomicBool::new(false),
        }
    }

    async fn push(&self, event: PushEvent) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            items.pop_front();
            self.resync_needed.store(true, Ordering::SeqCst);
        }
        items.push_back(event);
        drop(items);
        self.notify.notify_one();
    }

    async fn recv(&self) -> PushEvent {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(event) = items.pop_front() {
                    return event;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Returns whether events were dropped since the last call, clearing
    /// the flag (a caller is expected to force a reconciliation pass
    /// when this is true).
    fn take_resync_needed(&self) -> bool {
        self.resync_needed.swap(false, Ordering::SeqCst)
    }
}

/// Handle to a running push channel; the background connection task is
/// owned by the handle's `tokio::spawn`.
pub struct PushChannel {
    cmd_tx: mpsc::Sender<Command>,
    queue: Arc<EventQueue>,
    state_rx: watch::Receiver<PushState>,
}

impl PushChannel {
    /// Spawn the connection task against `url` and return a handle.
    /// `reachability` lets the channel skip reconnect attempts while the
    /// Request Mediator has already marked the server unreachable.
    pub fn spawn(url: String, config: PushConfig, reachability: watch::Receiver<bool>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let queue = Arc::new(EventQueue::new(config.max_queued_events));
        let (state_tx, state_rx) = watch::channel(PushState::Disconnected);

        let task_queue = queue.clone();
        tokio::spawn(run(url, config, cmd_rx, task_queue, state_tx, reachability));

        Self { cmd_tx, queue, state_rx }
    }

    pub async fn subscribe<I, S>(&self, projects: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let projects = projects.into_iter().map(Into::into).collect();
        let _ = self.cmd_tx.send(Command::Subscribe(projects)).await;
    }

    pub async fn unsubscribe<I, S>(&self, projects: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let projects = projects.into_iter().map(Into::into).collect();
        let _ = self.cmd_tx.send(Command::Unsubscribe(projects)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    pub async fn recv(&self) -> PushEvent {
        self.queue.recv().await
    }

    pub fn take_resync_needed(&self) -> bool {
        self.queue.take_resync_needed()
    }

    pub fn state(&self) -> PushState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PushState> {
        self.state_rx.clone()
    }
}

async fn send_frame(write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin), frame: &Frame) -> bool {
    match frame.to_text() {
        Ok(text) => write.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn run(
    url: String,
    config: PushConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    queue: Arc<EventQueue>,
    state_tx: watch::Sender<PushState>,
    mut reachability: watch::Receiver<bool>,
) {
    let mut subscriptions: HashSet<String> = HashSet::new();
    let mut backoff = RECONNECT_INITIAL_BACKOFF;

    loop {
        if !*reachability.borrow() {
            tokio::select! {
                changed = reachability.changed() => { if changed.is_err() { return; } continue; }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => return,
                        Some(Command::Subscribe(projects)) => subscriptions.extend(projects),
                        Some(Command::Unsubscribe(projects)) => { for p in projects { subscriptions.remove(&p); } }
                    }
                    continue;
                }
            }
        }

        let _ = state_tx.send(PushState::Connecting);
        let connected = match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _response)) => stream,
            Err(err) => {
                tracing::warn!(%err, %url, "push channel: connect failed, backing off");
                let _ = state_tx.send(PushState::Disconnected);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
                continue;
            }
        };
        tracing::info!(%url, "push channel connected");
        backoff = RECONNECT_INITIAL_BACKOFF;
        let _ = state_tx.send(PushState::Connected);

        let (mut write, mut read) = connected.split();
        if !subscriptions.is_empty() {
            let projects: Vec<String> = subscriptions.iter().cloned().collect();
            send_frame(&mut write, &Frame::Subscribe { projects }).await;
        }
        queue.push(PushEvent::Resubscribed).await;

        let mut ping_ticker = tokio::time::interval(config.ping_interval);
        ping_ticker.tick().await; // consume the immediate first tick
        let mut last_pong = tokio::time::Instant::now();

        'session: loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match Frame::from_text(&text) {
                                Ok(Frame::TaskEvent { event: TaskEventKind::Created, project, id, task: Some(task) }) => {
                                    queue.push(PushEvent::TaskCreated { project, id, task }).await;
                                }
                                Ok(Frame::TaskEvent { event: TaskEventKind::Updated, project, id, task: Some(task) }) => {
                                    queue.push(PushEvent::TaskUpdated { project, id, task }).await;
                                }
                                Ok(Frame::TaskEvent { event: TaskEventKind::Deleted, project, id, .. }) => {
                                    queue.push(PushEvent::TaskDeleted { project, id }).await;
                                }
                                Ok(Frame::TaskEvent { .. }) => {
                                    tracing::warn!("push channel: task_event missing required snapshot");
                                }
                                Ok(Frame::Pong) => last_pong = tokio::time::Instant::now(),
                                Ok(_) => {}
                                Err(err) => tracing::warn!(%err, "push channel: malformed frame"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("push channel: server closed connection");
                            break 'session;
                        }
                        Some(Err(err)) => {
                            tracing::warn!(%err, "push channel: read error");
                            break 'session;
                        }
                        _ => {} // binary/ping/pong frames at the transport level
                    }
                }
                _ = ping_ticker.tick() => {
                    if last_pong.elapsed() > config.ping_interval * 2 {
                        tracing::warn!("push channel: ping timeout, reconnecting");
                        break 'session;
                    }
                    if !send_frame(&mut write, &Frame::Ping).await {
                        break 'session;
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            let _ = state_tx.send(PushState::Draining);
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                        Some(Command::Subscribe(projects)) => {
                            subscriptions.extend(projects.iter().cloned());
                            send_frame(&mut write, &Frame::Subscribe { projects }).await;
                        }
                        Some(Command::Unsubscribe(projects)) => {
                            for p in &projects { subscriptions.remove(p); }
                            send_frame(&mut write, &Frame::Unsubscribe { projects }).await;
                        }
                    }
                }
            }
        }

        let _ = state_tx.send(PushState::Disconnected);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use tokio::net::TcpListener;

    async fn echo_server(listener: TcpListener, task: Task) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        if let Some(Ok(Message::Text(_subscribe))) = ws.next().await {
            let frame = Frame::TaskEvent {
                event: TaskEventKind::Created,
                project: "inbox".into(),
                id: task.id,
                task: Some(task),
            };
            ws.send(Message::Text(frame.to_text().unwrap().into())).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn delivers_task_events_and_resubscribes_on_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = Task::new("inbox", "pushed", Priority::Medium, chrono::Utc::now());
        let server = tokio::spawn(echo_server(listener, task.clone()));

        let (reachable_tx, reachable_rx) = watch::channel(true);
        let _keep_alive = reachable_tx;
        let channel = PushChannel::spawn(
            format!("ws://{addr}"),
            PushConfig { ping_interval: Duration::from_secs(30), max_queued_events: 64 },
            reachable_rx,
        );
        channel.subscribe(["inbox"]).await;

        let first = tokio::time::timeout(Duration::from_secs(2), channel.recv()).await.unwrap();
        assert!(matches!(first, PushEvent::Resubscribed));
        let second = tokio::time::timeout(Duration::from_secs(2), channel.recv()).await.unwrap();
        match second {
            PushEvent::TaskCreated { task, .. } => assert_eq!(task.content, "pushed"),
            other => panic!("expected a task-created event, got {other:?}"),
        }

        server.await.unwrap();
    }

    #[tokio::test]
    async fn drop_oldest_sets_resync_flag() {
        let queue = EventQueue::new(2);
        let evt = |p: &str| PushEvent::TaskDeleted { project: p.into(), id: TaskId::new() };
        queue.push(evt("a")).await;
        queue.push(evt("b")).await;
        assert!(!queue.take_resync_needed());
        queue.push(evt("c")).await; // evicts "a"
        assert!(queue.take_resync_needed());
        assert!(!queue.take_resync_needed()); // cleared after read

        let first = queue.recv().await;
        match first {
            PushEvent::TaskDeleted { project, .. } => assert_eq!(project, "b"),
            _ => panic!("expected event b"),
        }
    }
}
