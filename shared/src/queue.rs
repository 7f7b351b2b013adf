//! Durable FIFO of field actions awaiting delivery to the remote service.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::action::{ActionKind, ActionPayload};
use crate::capabilities::{Connectivity, KeyNamespace, KvError, KvKey, KvStore, RemoteExecutor};
use crate::model::{ActionId, Clock, ReferenceId, UnixTimeMs};
use crate::queue_store::{QueueSnapshot, StoreError};
use crate::DEFAULT_MAX_RETRIES;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] StoreError),
}

/// One action waiting for delivery. The payload never changes once queued.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: ActionId,
    pub payload: ActionPayload,
    pub enqueued_at: UnixTimeMs,
    pub retry_count: u32,
}

impl QueuedAction {
    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    pub fn reference(&self) -> &ReferenceId {
        self.payload.reference()
    }
}

/// An action dropped after exhausting its retries, kept for manual reconciliation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub action: QueuedAction,
    pub last_error: String,
    pub dropped_at: UnixTimeMs,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    /// Oldest dead letters are evicted past this size. Zero keeps none.
    pub dead_letter_capacity: usize,
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            dead_letter_capacity: 50,
            storage_key: "pending_actions".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_retries == 0 {
            return Err(QueueError::Validation("max_retries must be > 0".into()));
        }
        if self.storage_key.trim().is_empty() {
            return Err(QueueError::Validation("storage_key cannot be empty".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainStatus {
    /// Every item present at the start was attempted.
    Completed,
    /// Connectivity went away mid-drain; the rest stays queued.
    Interrupted,
    /// Another drain was already running.
    AlreadyRunning,
    Offline,
}

/// Outcome of one drain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub succeeded: usize,
    /// Items dropped after their final failed attempt.
    pub failed: usize,
    /// Items held back behind an earlier failure on the same reference.
    pub skipped: usize,
    pub status: DrainStatus,
}

impl SyncReport {
    fn empty(status: DrainStatus) -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            skipped: 0,
            status,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total: usize,
    pub by_kind: BTreeMap<ActionKind, usize>,
    pub dead_letters: usize,
    pub dropped_total: u64,
    pub syncing: bool,
}

/// Clears the single-flight flag even if the drain future is dropped.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ActionQueue {
    store: Arc<dyn KvStore>,
    executor: Arc<dyn RemoteExecutor>,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    storage_key: KvKey,
    state: Mutex<QueueSnapshot>,
    syncing: AtomicBool,
}

impl ActionQueue {
    /// Restores the queue from `store`. A snapshot that fails its integrity
    /// check is moved aside and the queue starts empty.
    #[instrument(skip_all)]
    pub async fn open(
        store: Arc<dyn KvStore>,
        executor: Arc<dyn RemoteExecutor>,
        connectivity: Connectivity,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let storage_key = KvKey::new(KeyNamespace::Queue, config.storage_key.clone())?;

        let snapshot = match store.get(&storage_key).await? {
            None => QueueSnapshot::default(),
            Some(bytes) => match QueueSnapshot::decode(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(error = %e, "quarantining unreadable queue snapshot");
                    Self::quarantine(store.as_ref(), &config.storage_key, bytes).await;
                    QueueSnapshot::default()
                }
            },
        };

        info!(
            pending = snapshot.pending.len(),
            dead_letters = snapshot.dead_letters.len(),
            "action queue loaded"
        );

        Ok(Self {
            store,
            executor,
            connectivity,
            clock,
            config,
            storage_key,
            state: Mutex::new(snapshot),
            syncing: AtomicBool::new(false),
        })
    }

    async fn quarantine(store: &dyn KvStore, storage_key: &str, bytes: Vec<u8>) {
        let moved = async {
            let aside = KvKey::new(KeyNamespace::Queue, format!("{storage_key}.quarantine"))?;
            store.set(&aside, bytes).await?;
            store
                .remove(&KvKey::new(KeyNamespace::Queue, storage_key)?)
                .await
        };
        if let Err(e) = moved.await {
            error!(error = %e, "failed to quarantine queue snapshot");
        }
    }

    async fn persist(&self, snapshot: &QueueSnapshot) -> Result<(), QueueError> {
        let bytes = snapshot.encode()?;
        self.store.set(&self.storage_key, bytes).await?;
        Ok(())
    }

    /// Appends an action and writes the queue through before returning.
    /// On a storage failure the append is rolled back.
    #[instrument(
        skip(self, payload),
        fields(kind = %payload.kind(), reference = %payload.reference())
    )]
    pub async fn enqueue(&self, payload: ActionPayload) -> Result<QueuedAction, QueueError> {
        let action = QueuedAction {
            id: ActionId::generate(),
            payload,
            enqueued_at: self.clock.now(),
            retry_count: 0,
        };

        let mut state = self.state.lock().await;
        state.pending.push_back(action.clone());

        if let Err(e) = self.persist(&state).await {
            state.pending.pop_back();
            error!(error = %e, "failed to persist queued action");
            return Err(e);
        }

        info!(id = %action.id, pending = state.pending.len(), "action queued");
        Ok(action)
    }

    /// Replays queued actions in enqueue order, one at a time.
    ///
    /// A no-op while offline or while another drain is running. Storage
    /// failures are logged and do not abort the drain; the in-memory queue
    /// is written through again on the next mutation.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> SyncReport {
        if !self.connectivity.is_online() {
            return SyncReport::empty(DrainStatus::Offline);
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return SyncReport::empty(DrainStatus::AlreadyRunning);
        }
        let _guard = SyncingGuard(&self.syncing);

        let ids: Vec<ActionId> = {
            let state = self.state.lock().await;
            state.pending.iter().map(|a| a.id.clone()).collect()
        };

        let mut report = SyncReport::empty(DrainStatus::Completed);
        let mut blocked: HashSet<ReferenceId> = HashSet::new();

        for id in ids {
            if !self.connectivity.is_online() {
                report.status = DrainStatus::Interrupted;
                break;
            }

            let action = {
                let state = self.state.lock().await;
                state.pending.iter().find(|a| a.id == id).cloned()
            };
            let Some(action) = action else { continue };

            if blocked.contains(action.reference()) {
                report.skipped += 1;
                continue;
            }

            match self.executor.apply(&action.payload).await {
                Ok(_) => {
                    let mut state = self.state.lock().await;
                    state.pending.retain(|a| a.id != id);
                    if let Err(e) = self.persist(&state).await {
                        error!(error = %e, "failed to persist queue after delivery");
                    }
                    report.succeeded += 1;
                }
                Err(e) if e.is_connectivity() && !self.connectivity.is_online() => {
                    info!(id = %id, "connectivity lost during drain");
                    report.status = DrainStatus::Interrupted;
                    break;
                }
                Err(e) => {
                    let dropped = self.record_failure(&id, &e.to_string()).await;
                    if dropped {
                        report.failed += 1;
                    } else {
                        blocked.insert(action.reference().clone());
                    }
                }
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            status = ?report.status,
            "drain finished"
        );
        report
    }

    /// Bumps the retry counter; returns true when the action was dropped.
    async fn record_failure(&self, id: &ActionId, last_error: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let Some(position) = state.pending.iter().position(|a| &a.id == id) else {
            return false;
        };

        let exhausted = {
            let action = &mut state.pending[position];
            action.retry_count = action.retry_count.saturating_add(1);
            warn!(
                id = %id,
                retry_count = action.retry_count,
                error = last_error,
                "queued action failed"
            );
            action.retry_count >= self.config.max_retries
        };

        if exhausted {
            if let Some(action) = state.pending.remove(position) {
                warn!(id = %id, kind = %action.kind(), "dropping action after max retries");
                state.dropped_total = state.dropped_total.saturating_add(1);
                if self.config.dead_letter_capacity > 0 {
                    if state.dead_letters.len() >= self.config.dead_letter_capacity {
                        state.dead_letters.pop_front();
                    }
                    state.dead_letters.push_back(DeadLetter {
                        action,
                        last_error: last_error.to_string(),
                        dropped_at: now,
                    });
                }
            }
        }

        if let Err(e) = self.persist(&state).await {
            error!(error = %e, "failed to persist queue after failure");
        }
        exhausted
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        let mut by_kind = BTreeMap::new();
        for action in &state.pending {
            *by_kind.entry(action.kind()).or_insert(0) += 1;
        }
        QueueStatus {
            total: state.pending.len(),
            by_kind,
            dead_letters: state.dead_letters.len(),
            dropped_total: state.dropped_total,
            syncing: self.is_syncing(),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    pub async fn pending(&self) -> Vec<QueuedAction> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    /// Whether anything for `reference` is still waiting for delivery.
    pub async fn has_pending_for(&self, reference: &ReferenceId) -> bool {
        self.state
            .lock()
            .await
            .pending
            .iter()
            .any(|a| a.reference() == reference)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.iter().cloned().collect()
    }

    /// Forgets the dead-letter log once it has been reconciled by hand.
    #[instrument(skip(self))]
    pub async fn clear_dead_letters(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let cleared = std::mem::take(&mut state.dead_letters);
        if let Err(e) = self.persist(&state).await {
            state.dead_letters = cleared;
            return Err(e);
        }
        Ok(cleared.len())
    }
}
