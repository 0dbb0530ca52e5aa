use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{debug, error};

use shared::domain::{ClientId, ConversationId, EntryId, UserId};
use storage::{
    conversation_log_key, ClientSyncState, CursorUpdate, FanoutStore, LogEntry, Range,
    StoreResult,
};

use crate::{
    metrics::FanoutMetrics,
    retry::{retry_transient, Backoff},
};

/// One window of a conversation log. Undecodable entries are dropped from `entries` but
/// still counted in `scanned`, so paging never stalls on them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacklogPage {
    pub entries: Vec<LogEntry>,
    pub scanned: usize,
    pub last_scanned: Option<EntryId>,
}

/// Durable per-client cursors and "everything since X" queries over conversation logs.
#[derive(Clone)]
pub struct OfflineSync {
    store: Arc<dyn FanoutStore>,
    metrics: Arc<FanoutMetrics>,
    backoff: Backoff,
    attempts: u32,
    cursor_ttl: Duration,
    offline_ttl: Duration,
}

impl OfflineSync {
    pub fn new(
        store: Arc<dyn FanoutStore>,
        metrics: Arc<FanoutMetrics>,
        backoff: Backoff,
        attempts: u32,
        cursor_ttl: Duration,
        offline_ttl: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            backoff,
            attempts,
            cursor_ttl,
            offline_ttl,
        }
    }

    /// Every retained entry after `last_message_id` (exclusive), oldest first.
    pub async fn get_since(
        &self,
        conversation_id: ConversationId,
        last_message_id: Option<EntryId>,
    ) -> StoreResult<Vec<LogEntry>> {
        let page = self
            .get_page(conversation_id, Range::since(last_message_id))
            .await?;
        Ok(page.entries)
    }

    pub async fn get_since_page(
        &self,
        conversation_id: ConversationId,
        last_message_id: Option<EntryId>,
        limit: usize,
    ) -> StoreResult<BacklogPage> {
        self.get_page(conversation_id, Range::since(last_message_id).limit(limit))
            .await
    }

    /// Entries in `(after, until]`, at most `limit` of them.
    pub async fn get_between(
        &self,
        conversation_id: ConversationId,
        after: Option<EntryId>,
        until: EntryId,
        limit: usize,
    ) -> StoreResult<BacklogPage> {
        let range = Range {
            after,
            until: Some(until),
            limit: Some(limit),
        };
        self.get_page(conversation_id, range).await
    }

    async fn get_page(
        &self,
        conversation_id: ConversationId,
        range: Range,
    ) -> StoreResult<BacklogPage> {
        let log_key = conversation_log_key(conversation_id);
        let raw = retry_transient(self.backoff, self.attempts, &self.metrics, "range", || {
            self.store.range(&log_key, range)
        })
        .await?;
        let scanned = raw.len();
        let last_scanned = raw.last().map(|entry| entry.entry_id);
        let entries = raw
            .iter()
            .filter_map(|entry| match LogEntry::from_stream_entry(entry) {
                Ok(decoded) => Some(decoded),
                Err(reason) => {
                    error!(
                        %conversation_id,
                        entry_id = %entry.entry_id,
                        %reason,
                        "skipping undecodable log entry"
                    );
                    None
                }
            })
            .collect();
        Ok(BacklogPage {
            entries,
            scanned,
            last_scanned,
        })
    }

    /// Monotonic: an id at or below the stored cursor for the same conversation is a no-op.
    pub async fn update_cursor(
        &self,
        user_id: UserId,
        client_id: ClientId,
        conversation_id: ConversationId,
        last_message_id: EntryId,
    ) -> StoreResult<CursorUpdate> {
        let state = ClientSyncState {
            user_id,
            client_id,
            conversation_id,
            last_message_id,
            last_sync_at: Utc::now(),
        };
        let update = retry_transient(
            self.backoff,
            self.attempts,
            &self.metrics,
            "store_cursor",
            || self.store.store_cursor(&state, self.cursor_ttl),
        )
        .await?;
        debug!(%user_id, %client_id, %conversation_id, %last_message_id, ?update, "cursor");
        Ok(update)
    }

    /// `None` for unknown or expired clients, which resync from the beginning.
    pub async fn get_cursor(
        &self,
        user_id: UserId,
        client_id: ClientId,
    ) -> StoreResult<Option<ClientSyncState>> {
        retry_transient(self.backoff, self.attempts, &self.metrics, "load_cursor", || {
            self.store.load_cursor(user_id, client_id)
        })
        .await
    }

    /// Forgets a client, e.g. after logout.
    pub async fn clear_cursor(&self, user_id: UserId, client_id: ClientId) -> StoreResult<bool> {
        self.store.clear_cursor(user_id, client_id).await
    }

    pub async fn conversation_clients(
        &self,
        conversation_id: ConversationId,
    ) -> StoreResult<Vec<ClientId>> {
        self.store.conversation_clients(conversation_id).await
    }

    pub async fn record_offline_message(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<u64> {
        self.store
            .increment_offline(user_id, conversation_id, self.offline_ttl)
            .await
    }

    pub async fn offline_count(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<u64> {
        self.store.offline_count(user_id, conversation_id).await
    }

    pub async fn clear_offline(
        &self,
        user_id: UserId,
        conversation_ids: &[ConversationId],
    ) -> StoreResult<()> {
        self.store.clear_offline(user_id, conversation_ids).await
    }

    /// Announces a live session to every instance sharing the store.
    pub async fn mark_present(
        &self,
        user_id: UserId,
        client_id: ClientId,
        conversation_id: ConversationId,
        ttl: Duration,
    ) -> StoreResult<()> {
        retry_transient(self.backoff, self.attempts, &self.metrics, "mark_present", || {
            self.store
                .mark_present(user_id, client_id, conversation_id, ttl)
        })
        .await
    }

    pub async fn clear_presence(
        &self,
        user_id: UserId,
        client_id: ClientId,
        conversation_id: ConversationId,
    ) -> StoreResult<()> {
        self.store
            .clear_presence(user_id, client_id, conversation_id)
            .await
    }

    /// Whether the user holds a session on the conversation on any instance.
    pub async fn is_present(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<bool> {
        self.store.is_present(user_id, conversation_id).await
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
