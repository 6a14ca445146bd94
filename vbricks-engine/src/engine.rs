//! Shared handle over the registry plus its background loop.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, broadcast, mpsc, watch};
use tracing::info;

use crate::error::Result;
use crate::notify::{Notification, TopologySnapshot};
use crate::registry::Registry;
use crate::settings::Settings;

/// Cloneable engine handle. Every mutation goes through one async mutex;
/// snapshots and notifications never wait on it.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Mutex<Registry>>,
    snapshot: watch::Receiver<TopologySnapshot>,
    notify: broadcast::Sender<Notification>,
    shutdown_tx: mpsc::Sender<()>,
}

impl Engine {
    /// Create the runtime directory, the registry and the loop that runs
    /// fired events and reaps exited processes.
    pub async fn start(settings: Settings) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.base_dir).await?;
        info!(base_dir = %settings.base_dir.display(), "Starting engine");

        let watch_interval = settings.watch_interval();
        let (registry, mut fired_rx) = Registry::new(settings);
        let snapshot = registry.watch();
        let notify = registry.notifier();
        let registry = Arc::new(Mutex::new(registry));

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let looped = registry.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(watch_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Engine loop shutting down");
                        break;
                    }
                    Some(fired) = fired_rx.recv() => {
                        looped.lock().await.fire_event(fired).await;
                    }
                    _ = tick.tick() => {
                        looped.lock().await.reap_exited().await;
                    }
                }
            }
        });

        Ok(Self {
            registry,
            snapshot,
            notify,
            shutdown_tx,
        })
    }

    /// Run one console command under the registry lock.
    pub async fn exec(&self, line: &str) -> Result<String> {
        self.registry.lock().await.exec(line).await
    }

    /// Direct access for callers that need several steps under one lock.
    pub async fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TopologySnapshot> {
        self.snapshot.clone()
    }

    /// Stop the loop, every event timer and every running brick.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
        self.registry.lock().await.shutdown().await;
    }
}
