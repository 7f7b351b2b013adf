//! On-disk envelope for the action queue.
//!
//! The whole queue is rewritten on every mutation, so the format favors a
//! cheap integrity check over incremental updates.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use crate::queue::{DeadLetter, QueuedAction};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 8 * 1024 * 1024;
const MAX_QUEUED_ACTIONS: usize = 10_000;
const STORE_MAGIC: &[u8; 4] = b"FSAQ";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("too many queued actions: {count}, max {max}")]
    TooManyActions { count: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

/// Everything the queue needs to resume after a restart.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub pending: VecDeque<QueuedAction>,
    pub dead_letters: VecDeque<DeadLetter>,
    pub dropped_total: u64,
}

impl QueueSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        if self.pending.len() > MAX_QUEUED_ACTIONS {
            return Err(StoreError::TooManyActions {
                count: self.pending.len(),
                max: MAX_QUEUED_ACTIONS,
            });
        }

        let mut payload_bytes = Vec::new();
        ciborium::into_writer(self, &mut payload_bytes)?;

        let checksum = blake3::hash(&payload_bytes);

        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload: payload_bytes,
        };

        let mut envelope_bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut envelope_bytes)?;

        if envelope_bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: envelope_bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        Ok(envelope_bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::Corrupted {
                reason: "empty snapshot",
            });
        }
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }

        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }
        if envelope.schema_version < CURRENT_SCHEMA_VERSION {
            return Err(StoreError::UnknownSchema(envelope.schema_version));
        }

        let actual_checksum = blake3::hash(&envelope.payload);
        if actual_checksum.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual_checksum.as_bytes()),
            });
        }

        let snapshot: QueueSnapshot = ciborium::from_reader(&envelope.payload[..])?;

        if snapshot.pending.len() > MAX_QUEUED_ACTIONS {
            return Err(StoreError::TooManyActions {
                count: snapshot.pending.len(),
                max: MAX_QUEUED_ACTIONS,
            });
        }

        Ok(snapshot)
    }
}
