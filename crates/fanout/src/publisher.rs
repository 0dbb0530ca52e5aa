use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use thiserror::Error;
use tracing::{debug, error, warn};

use shared::domain::EntryId;
use storage::{
    conversation_log_key, FanoutPointer, FanoutStore, NewLogEntry, StoreError, TrimPolicy,
    FANOUT_LOG_KEY,
};

use crate::{
    metrics::{Counter, FanoutMetrics},
    retry::{retry_transient, Backoff},
};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to append message to conversation log: {0}")]
    Append(#[source] StoreError),
    /// The message is durable in its conversation log; only live fan-out was missed.
    /// Reconnecting clients still receive it from the backlog.
    #[error("message {entry_id} stored but its fan-out pointer was not: {source}")]
    Fanout {
        entry_id: EntryId,
        #[source]
        source: StoreError,
    },
}

/// Writes messages: conversation log first, then a pointer into the fan-out log.
pub struct Publisher {
    store: Arc<dyn FanoutStore>,
    metrics: Arc<FanoutMetrics>,
    backoff: Backoff,
    attempts: u32,
    max_len: usize,
    trim_every: u64,
    published: AtomicU64,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn FanoutStore>,
        metrics: Arc<FanoutMetrics>,
        backoff: Backoff,
        attempts: u32,
        max_len: usize,
        trim_every: u64,
    ) -> Self {
        Self {
            store,
            metrics,
            backoff,
            attempts,
            max_len,
            trim_every: trim_every.max(1),
            published: AtomicU64::new(0),
        }
    }

    pub async fn publish(&self, message: NewLogEntry) -> Result<EntryId, PublishError> {
        let conversation_id = message.conversation_id;
        let log_key = conversation_log_key(conversation_id);
        let entry_id = self
            .store
            .append(&log_key, message.into_fields())
            .await
            .map_err(PublishError::Append)?;

        let pointer = FanoutPointer::new(conversation_id, entry_id).into_fields();
        let appended = retry_transient(self.backoff, self.attempts, &self.metrics, "append_pointer", || {
            self.store.append(FANOUT_LOG_KEY, pointer.clone())
        })
        .await;
        self.metrics.incr(Counter::Published);
        self.maybe_trim(log_key);

        match appended {
            Ok(pointer_id) => {
                debug!(%conversation_id, %entry_id, %pointer_id, "published");
                Ok(entry_id)
            }
            Err(source) => {
                self.metrics.incr(Counter::PublishFanoutFailures);
                error!(%conversation_id, %entry_id, error = %source, "fan-out pointer append failed");
                Err(PublishError::Fanout { entry_id, source })
            }
        }
    }

    fn maybe_trim(&self, log_key: String) {
        let published = self.published.fetch_add(1, Ordering::Relaxed) + 1;
        if published % self.trim_every != 0 {
            return;
        }
        let store = self.store.clone();
        let max_len = self.max_len;
        tokio::spawn(async move {
            match store.trim(&log_key, TrimPolicy::MaxLen(max_len)).await {
                Ok(removed) => debug!(log_key, removed, "trimmed conversation log"),
                Err(error) => warn!(log_key, %error, "failed to trim conversation log"),
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/publisher_tests.rs"]
mod tests;
