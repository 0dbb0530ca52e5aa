use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;

use shared::domain::{ClientId, ConversationId, EntryId, UserId};
use storage::{
    ClientSyncState, CursorStore, CursorUpdate, DeadLetter, Fields, GroupEntry, GroupInfo,
    GroupRead, GroupStart, LogStore, MemoryStore, PendingEntry, Range, StoreError, StoreResult,
    StreamEntry, TrimPolicy, FANOUT_LOG_KEY,
};

/// Memory store that fails a configurable number of calls with a transient error.
#[derive(Default)]
pub(crate) struct FlakyStore {
    pub(crate) inner: MemoryStore,
    pub(crate) pointer_append_failures: AtomicU32,
    pub(crate) range_failures: AtomicU32,
    pub(crate) read_group_failures: AtomicU32,
}

fn take_failure(counter: &AtomicU32) -> StoreResult<()> {
    let failed = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok();
    if failed {
        Err(StoreError::Unavailable("injected failure".into()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl LogStore for FlakyStore {
    async fn append(&self, log_key: &str, fields: Fields) -> StoreResult<EntryId> {
        if log_key == FANOUT_LOG_KEY {
            take_failure(&self.pointer_append_failures)?;
        }
        self.inner.append(log_key, fields).await
    }

    async fn range(&self, log_key: &str, range: Range) -> StoreResult<Vec<StreamEntry>> {
        take_failure(&self.range_failures)?;
        self.inner.range(log_key, range).await
    }

    async fn create_group(&self, group: &str, log_key: &str, start: GroupStart) -> StoreResult<()> {
        self.inner.create_group(group, log_key, start).await
    }

    async fn read_group(
        &self,
        group: &str,
        member: &str,
        read: GroupRead,
    ) -> StoreResult<Vec<GroupEntry>> {
        take_failure(&self.read_group_failures)?;
        self.inner.read_group(group, member, read).await
    }

    async fn ack(&self, group: &str, entry_id: EntryId) -> StoreResult<bool> {
        self.inner.ack(group, entry_id).await
    }

    async fn pending(&self, group: &str) -> StoreResult<Vec<PendingEntry>> {
        self.inner.pending(group).await
    }

    async fn dead_letter(&self, letter: DeadLetter) -> StoreResult<()> {
        self.inner.dead_letter(letter).await
    }

    async fn dead_letters(&self, group: Option<&str>) -> StoreResult<Vec<DeadLetter>> {
        self.inner.dead_letters(group).await
    }

    async fn groups(&self) -> StoreResult<Vec<GroupInfo>> {
        self.inner.groups().await
    }

    async fn destroy_group(&self, group: &str) -> StoreResult<bool> {
        self.inner.destroy_group(group).await
    }

    async fn trim(&self, log_key: &str, policy: TrimPolicy) -> StoreResult<u64> {
        self.inner.trim(log_key, policy).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }
}

#[async_trait]
impl CursorStore for FlakyStore {
    async fn load_cursor(
        &self,
        user_id: UserId,
        client_id: ClientId,
    ) -> StoreResult<Option<ClientSyncState>> {
        self.inner.load_cursor(user_id, client_id).await
    }

    async fn store_cursor(
        &self,
        state: &ClientSyncState,
        ttl: Duration,
    ) -> StoreResult<CursorUpdate> {
        self.inner.store_cursor(state, ttl).await
    }

    async fn clear_cursor(&self, user_id: UserId, client_id: ClientId) -> StoreResult<bool> {
        self.inner.clear_cursor(user_id, client_id).await
    }

    async fn conversation_clients(
        &self,
        conversation_id: ConversationId,
    ) -> StoreResult<Vec<ClientId>> {
        self.inner.conversation_clients(conversation_id).await
    }

    async fn increment_offline(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        ttl: Duration,
    ) -> StoreResult<u64> {
        self.inner.increment_offline(user_id, conversation_id, ttl).await
    }

    async fn offline_count(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<u64> {
        self.inner.offline_count(user_id, conversation_id).await
    }

    async fn clear_offline(
        &self,
        user_id: UserId,
        conversation_ids: &[ConversationId],
    ) -> StoreResult<()> {
        self.inner.clear_offline(user_id, conversation_ids).await
    }

    async fn mark_present(
        &self,
        user_id: UserId,
        client_id: ClientId,
        conversation_id: ConversationId,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.inner
            .mark_present(user_id, client_id, conversation_id, ttl)
            .await
    }

    async fn clear_presence(
        &self,
        user_id: UserId,
        client_id: ClientId,
        conversation_id: ConversationId,
    ) -> StoreResult<()> {
        self.inner
            .clear_presence(user_id, client_id, conversation_id)
            .await
    }

    async fn is_present(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<bool> {
        self.inner.is_present(user_id, conversation_id).await
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        self.inner.purge_expired().await
    }
}
