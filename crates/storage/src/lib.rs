use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shared::domain::{ClientId, ConversationId, EntryId, UserId};

mod memory;
mod records;
mod sqlite;

pub use memory::MemoryStore;
pub use records::{
    conversation_log_key, FanoutPointer, LogEntry, NewLogEntry, RecordError, FANOUT_LOG_KEY,
};
pub use sqlite::SqliteStore;

/// Field map carried by every log entry.
pub type Fields = BTreeMap<String, String>;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unknown consumer group '{0}'")]
    UnknownGroup(String),
    #[error("log key must not be empty")]
    InvalidLogKey,
    #[error("corrupt record in '{log_key}': {reason}")]
    Corrupt { log_key: String, reason: String },
}

impl StoreError {
    /// Errors worth retrying with backoff: the store may answer on the next attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(error) => match error {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
                    true
                }
                sqlx::Error::Database(db) => db
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    // SQLITE_BUSY and SQLITE_LOCKED, ignoring extended result bits
                    .map(|code| matches!(code & 0xff, 5 | 6))
                    .unwrap_or(false),
                _ => false,
            },
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub entry_id: EntryId,
    pub fields: Fields,
}

/// Bounds for [`LogStore::range`]. `after` is exclusive, `until` inclusive; a missing
/// bound means the start or the tail of retained history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Range {
    pub after: Option<EntryId>,
    pub until: Option<EntryId>,
    pub limit: Option<usize>,
}

impl Range {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(after: Option<EntryId>) -> Self {
        Self {
            after,
            ..Self::default()
        }
    }

    /// Window containing exactly `entry_id`, if it is still retained.
    pub fn single(entry_id: EntryId) -> Self {
        Self {
            after: entry_id.predecessor(),
            until: Some(entry_id),
            limit: Some(1),
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn admits(&self, entry_id: EntryId) -> bool {
        self.after.map_or(true, |after| entry_id > after)
            && self.until.map_or(true, |until| entry_id <= until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Deliver everything retained in the log.
    Beginning,
    /// Deliver only entries appended after the group is created.
    Tail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupRead {
    pub count: usize,
    /// How long to wait for entries when none are available right away.
    pub block: Duration,
    /// Visibility timeout: pending entries idle this long are handed out again.
    pub claim_idle: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub entry_id: EntryId,
    pub fields: Fields,
    /// 1 on first delivery, incremented on each redelivery.
    pub delivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub entry_id: EntryId,
    pub member: String,
    pub delivery_count: u32,
    pub idle: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub group: String,
    pub entry_id: EntryId,
    pub fields: Fields,
    pub delivery_count: u32,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

impl DeadLetter {
    pub const TRIMMED_BEFORE_ACK: &'static str = "trimmed before ack";

    /// Record for a pending entry whose log entry was trimmed away; its fields are gone.
    pub(crate) fn trimmed(group: &str, entry_id: EntryId, delivery_count: u32) -> Self {
        Self {
            group: group.to_string(),
            entry_id,
            fields: Fields::new(),
            delivery_count,
            reason: Self::TRIMMED_BEFORE_ACK.to_string(),
            dead_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub log_key: String,
    pub last_delivered_id: EntryId,
    pub pending: usize,
    pub members: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimPolicy {
    /// Keep at most this many of the newest entries.
    MaxLen(usize),
    /// Drop every entry older than this id.
    MinId(EntryId),
}

/// Append-only, replayable logs plus consumer-group bookkeeping over them.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, log_key: &str, fields: Fields) -> StoreResult<EntryId>;

    async fn range(&self, log_key: &str, range: Range) -> StoreResult<Vec<StreamEntry>>;

    /// Creates `group` over `log_key`; an existing group is left untouched.
    async fn create_group(&self, group: &str, log_key: &str, start: GroupStart)
        -> StoreResult<()>;

    async fn read_group(
        &self,
        group: &str,
        member: &str,
        read: GroupRead,
    ) -> StoreResult<Vec<GroupEntry>>;

    /// Returns whether the entry was pending.
    async fn ack(&self, group: &str, entry_id: EntryId) -> StoreResult<bool>;

    async fn pending(&self, group: &str) -> StoreResult<Vec<PendingEntry>>;

    /// Records a terminal failure and acknowledges the entry.
    async fn dead_letter(&self, letter: DeadLetter) -> StoreResult<()>;

    async fn dead_letters(&self, group: Option<&str>) -> StoreResult<Vec<DeadLetter>>;

    async fn groups(&self) -> StoreResult<Vec<GroupInfo>>;

    async fn destroy_group(&self, group: &str) -> StoreResult<bool>;

    /// Returns the number of entries removed.
    async fn trim(&self, log_key: &str, policy: TrimPolicy) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSyncState {
    pub user_id: UserId,
    pub client_id: ClientId,
    pub conversation_id: ConversationId,
    pub last_message_id: EntryId,
    pub last_sync_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorUpdate {
    Advanced,
    /// The stored cursor was already at or past the offered id.
    Stale,
}

/// Per-client cursors, offline notification counters and connection presence.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Unknown and expired cursors both read as `None`.
    async fn load_cursor(
        &self,
        user_id: UserId,
        client_id: ClientId,
    ) -> StoreResult<Option<ClientSyncState>>;

    /// Monotonic write: an id at or below the stored one for the same conversation is
    /// ignored. A cursor for another conversation, or an expired one, is replaced.
    async fn store_cursor(&self, state: &ClientSyncState, ttl: Duration)
        -> StoreResult<CursorUpdate>;

    async fn clear_cursor(&self, user_id: UserId, client_id: ClientId) -> StoreResult<bool>;

    async fn conversation_clients(
        &self,
        conversation_id: ConversationId,
    ) -> StoreResult<Vec<ClientId>>;

    async fn increment_offline(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        ttl: Duration,
    ) -> StoreResult<u64>;

    async fn offline_count(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<u64>;

    async fn clear_offline(
        &self,
        user_id: UserId,
        conversation_ids: &[ConversationId],
    ) -> StoreResult<()>;

    /// Records that a client of `user_id` holds a session on `conversation_id` somewhere.
    /// Rows lapse after `ttl` unless marked again, so a crashed instance leaves none behind.
    async fn mark_present(
        &self,
        user_id: UserId,
        client_id: ClientId,
        conversation_id: ConversationId,
        ttl: Duration,
    ) -> StoreResult<()>;

    async fn clear_presence(
        &self,
        user_id: UserId,
        client_id: ClientId,
        conversation_id: ConversationId,
    ) -> StoreResult<()>;

    /// True while any client of `user_id` has an unexpired presence row on the conversation.
    async fn is_present(&self, user_id: UserId, conversation_id: ConversationId)
        -> StoreResult<bool>;

    /// Drops expired cursors, counters and presence rows, returning how many were removed.
    async fn purge_expired(&self) -> StoreResult<u64>;
}

/// Everything the fan-out core needs from shared state.
pub trait FanoutStore: LogStore + CursorStore {}

impl<T: LogStore + CursorStore + ?Sized> FanoutStore for T {}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
