//! Dead-letter sinks for records the migration engine could not archive.
//!
//! A dead letter is informational: the record stays inline and the next
//! sweep retries it. Sinks exist so operators can see persistent failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::error;

use super::error::{StoreError, TierError};
use crate::types::RecordId;

/// One failed archival attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: RecordId,
    /// Stable label from [`TierError::kind`]
    pub error_kind: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_error(id: RecordId, error: &TierError, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            error_kind: error.kind().to_string(),
            error: error.to_string(),
            timestamp,
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: DeadLetter) -> Result<(), StoreError>;
}

/// Forwards dead letters over a bounded channel
pub struct ChannelDeadLetterSink {
    tx: mpsc::Sender<DeadLetter>,
}

impl ChannelDeadLetterSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<DeadLetter>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DeadLetterSink for ChannelDeadLetterSink {
    async fn publish(&self, letter: DeadLetter) -> Result<(), StoreError> {
        // Never block a sweep on a slow consumer
        self.tx.try_send(letter).map_err(|e| match e {
            mpsc::error::TrySendError::Full(letter) => {
                StoreError::Unavailable(format!("dead-letter channel full, dropped {}", letter.id))
            }
            mpsc::error::TrySendError::Closed(letter) => {
                StoreError::Backend(format!("dead-letter channel closed, dropped {}", letter.id))
            }
        })
    }
}

/// Logs dead letters at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for TracingDeadLetterSink {
    async fn publish(&self, letter: DeadLetter) -> Result<(), StoreError> {
        error!(
            record_id = %letter.id,
            error_kind = %letter.error_kind,
            error = %letter.error,
            "Record could not be archived"
        );
        Ok(())
    }
}

/// Keeps dead letters in memory
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn publish(&self, letter: DeadLetter) -> Result<(), StoreError> {
        self.letters.lock().await.push(letter);
        Ok(())
    }
}
