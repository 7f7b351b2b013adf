//! Connectivity-aware orchestration of the action queue.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::action::ActionPayload;
use crate::capabilities::{AppliedRecord, Connectivity, RemoteError, RemoteExecutor};
use crate::queue::{ActionQueue, DrainStatus, QueueError, QueuedAction, SyncReport};
use crate::DEFAULT_SYNC_INTERVAL_MS;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The service answered and refused; queueing would not help.
    #[error("remote rejected action: {0}")]
    Remote(#[from] RemoteError),

    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    #[serde(with = "crate::config::duration_ms")]
    pub periodic_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            periodic_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.periodic_interval.is_zero() {
            return Err(SyncError::Validation(
                "periodic_interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Where an action ended up after going through the sync seam.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    Persisted(AppliedRecord),
    /// Saved locally, will sync.
    Queued(QueuedAction),
}

/// Notifications for views that mirror queue state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    QueueChanged { pending: usize },
    Drained(SyncReport),
}

pub struct SyncCoordinator {
    queue: Arc<ActionQueue>,
    executor: Arc<dyn RemoteExecutor>,
    connectivity: Connectivity,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<ActionQueue>,
        executor: Arc<dyn RemoteExecutor>,
        connectivity: Connectivity,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            queue,
            executor,
            connectivity,
            config,
            events,
        })
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Runs `immediate` when online, otherwise queues `payload`.
    ///
    /// Connectivity-class failures fall back to the queue. So does anything
    /// submitted while older actions for the same reference are still
    /// queued, to keep that reference's actions in order.
    #[instrument(
        skip(self, payload, immediate),
        fields(kind = %payload.kind(), reference = %payload.reference())
    )]
    pub async fn execute_or_queue<F, Fut>(
        &self,
        payload: ActionPayload,
        immediate: F,
    ) -> Result<ExecutionOutcome, SyncError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<AppliedRecord, RemoteError>> + Send,
    {
        if !self.connectivity.is_online() {
            debug!("offline, queueing");
            return self.enqueue(payload).await;
        }
        if self.queue.has_pending_for(payload.reference()).await {
            debug!("older actions for this reference are queued, queueing behind them");
            return self.enqueue(payload).await;
        }

        match immediate().await {
            Ok(record) => Ok(ExecutionOutcome::Persisted(record)),
            Err(e) if e.is_connectivity() => {
                warn!(error = %e, "immediate attempt failed, queueing");
                self.enqueue(payload).await
            }
            Err(e) => Err(SyncError::Remote(e)),
        }
    }

    /// [`Self::execute_or_queue`] with the shared remote executor as the immediate path.
    pub async fn submit(&self, payload: ActionPayload) -> Result<ExecutionOutcome, SyncError> {
        let executor = self.executor.clone();
        let attempt = payload.clone();
        self.execute_or_queue(payload, move || async move { executor.apply(&attempt).await })
            .await
    }

    async fn enqueue(&self, payload: ActionPayload) -> Result<ExecutionOutcome, SyncError> {
        let queued = self.queue.enqueue(payload).await?;
        self.emit(SyncEvent::QueueChanged {
            pending: self.queue.len().await,
        });
        Ok(ExecutionOutcome::Queued(queued))
    }

    pub async fn drain(&self) -> SyncReport {
        let report = self.queue.drain().await;
        if !matches!(
            report.status,
            DrainStatus::AlreadyRunning | DrainStatus::Offline
        ) {
            self.emit(SyncEvent::Drained(report));
        }
        report
    }

    /// Spawns the background loop: drains at start, whenever connectivity
    /// comes back, and on every periodic tick while online.
    pub fn start(self: &Arc<Self>) -> SyncHandle {
        let coordinator = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let mut online_rx = coordinator.connectivity.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.periodic_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = coordinator.config.periodic_interval.as_millis() as u64,
                "sync loop started"
            );

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if coordinator.connectivity.is_online() {
                            coordinator.drain().await;
                        }
                    }
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *online_rx.borrow_and_update();
                        if online {
                            info!("connectivity restored, draining");
                            coordinator.drain().await;
                        }
                    }
                }
            }
            info!("sync loop stopped");
        });

        SyncHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Running sync loop. Dropping it stops the loop without waiting.
pub struct SyncHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Stops the loop after any drain in progress has finished.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "sync loop ended abnormally");
            }
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
