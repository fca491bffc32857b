//! The upgrade mutex.
//!
//! A remote queue doubles as a distributed lock and a handoff channel:
//!
//! - the queue **existing** means an upgrade is in progress,
//! - a **message** in it names the node that must run its own upgrade next.
//!
//! Only the node named by the head message may consume it, so a broadcast wake-up cannot make
//! every manager race for the handoff.

use std::sync::Arc;

use crate::error::{ApiError, ignore_not_found};
use crate::node::RejoinSignal;
use crate::storage::QueueService;

#[cfg(test)]
#[path = "mutex.test.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum MutexError {
    #[error("Queue error: {0}")]
    Api(#[from] ApiError),

    #[error("Malformed rejoin signal '{text}': {reason}")]
    MalformedSignal { text: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquire {
    Acquired,
    AlreadyLocked,
}

#[derive(Clone)]
pub struct UpgradeMutex {
    queue: Arc<dyn QueueService>,
    name: String,
}

impl UpgradeMutex {
    pub fn new(queue: Arc<dyn QueueService>, name: impl Into<String>) -> Self {
        UpgradeMutex {
            queue,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock_exists(&self) -> Result<bool, MutexError> {
        Ok(self.queue.queue_exists(&self.name).await?)
    }

    /// Take the lock. Never proceeds silently over an existing lock.
    pub async fn acquire(&self) -> Result<LockAcquire, MutexError> {
        if self.lock_exists().await? {
            tracing::warn!(queue=%self.name, "Upgrade lock already held");
            return Ok(LockAcquire::AlreadyLocked);
        }
        // The create call is the arbiter: two racing callers cannot both see `true`.
        match self.queue.create_queue(&self.name).await {
            Ok(true) => {
                tracing::info!(queue=%self.name, "Upgrade lock acquired");
                Ok(LockAcquire::Acquired)
            }
            Ok(false) | Err(ApiError::Conflict(_)) => {
                tracing::warn!(queue=%self.name, "Lost race for the upgrade lock");
                Ok(LockAcquire::AlreadyLocked)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn release(&self) -> Result<(), MutexError> {
        ignore_not_found(self.queue.delete_queue(&self.name).await)?;
        tracing::info!(queue=%self.name, "Upgrade lock released");
        Ok(())
    }

    pub async fn enqueue_rejoin(&self, node_id: &str) -> Result<RejoinSignal, MutexError> {
        let signal = RejoinSignal::new(node_id);
        let text = serde_json::to_string(&signal).map_err(|e| MutexError::MalformedSignal {
            text: node_id.to_string(),
            reason: e.to_string(),
        })?;
        self.queue.put_message(&self.name, &text).await?;
        tracing::info!(queue=%self.name, node_id=%node_id, "Rejoin signal queued");
        Ok(signal)
    }

    pub async fn pending_signals(&self) -> Result<usize, MutexError> {
        Ok(self.queue.approximate_message_count(&self.name).await?)
    }

    /// The node that must act next, without consuming the signal.
    pub async fn peek_rejoin(&self) -> Result<Option<RejoinSignal>, MutexError> {
        match self.queue.peek_message(&self.name).await {
            Ok(Some(message)) => decode_signal(&message.text).map(Some),
            Ok(None) | Err(ApiError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Consume the head signal only if it names `node_id`.
    pub async fn consume_rejoin_if_self(
        &self,
        node_id: &str,
    ) -> Result<Option<RejoinSignal>, MutexError> {
        match self.peek_rejoin().await? {
            Some(signal) if signal.is_for(node_id) => {}
            Some(signal) => {
                tracing::debug!(target_node=%signal.node_id, node_id=%node_id, "Rejoin signal is for another node");
                return Ok(None);
            }
            None => return Ok(None),
        }

        let Some(message) = self.queue.get_message(&self.name).await? else {
            return Ok(None);
        };
        let signal = decode_signal(&message.text)?;
        if !signal.is_for(node_id) {
            // The head moved between peek and get; leave it for its owner.
            return Ok(None);
        }
        self.queue.delete_message(&self.name, &message).await?;
        tracing::info!(queue=%self.name, node_id=%node_id, "Rejoin signal consumed");
        Ok(Some(signal))
    }
}

fn decode_signal(text: &str) -> Result<RejoinSignal, MutexError> {
    serde_json::from_str(text).map_err(|e| MutexError::MalformedSignal {
        text: text.to_string(),
        reason: e.to_string(),
    })
}
