use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, SqliteConnection,
};
use tokio::sync::Notify;
use tracing::warn;

use shared::domain::{ClientId, ConversationId, EntryId, UserId};

use crate::{
    memory::now_ms, ClientSyncState, CursorStore, CursorUpdate, DeadLetter, Fields, GroupEntry,
    GroupInfo, GroupRead, GroupStart, LogStore, PendingEntry, Range, StoreError, StoreResult,
    StreamEntry, TrimPolicy,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// SQLite-backed store. Every process opening the same database file shares the logs,
/// consumer groups and cursors.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    appended: Arc<Notify>,
    poll_interval: Duration,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let in_memory = database_url.starts_with("sqlite::memory:");
        let mut connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }
        // an in-memory database lives and dies with its single connection
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            appended: Arc::new(Notify::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// How often a blocked group read re-checks for entries appended by other processes.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    async fn try_read_group(
        &self,
        group: &str,
        member: &str,
        read: &GroupRead,
    ) -> StoreResult<(Vec<GroupEntry>, Option<i64>)> {
        let mut tx = self.pool.begin().await?;
        // take the write lock first so two readers never hand out the same entry
        let touched = sqlx::query("UPDATE consumer_groups SET last_ms = last_ms WHERE group_name = ?")
            .bind(group)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if touched == 0 {
            return Err(StoreError::UnknownGroup(group.to_string()));
        }

        let row = sqlx::query(
            "SELECT log_key, last_ms, last_seq FROM consumer_groups WHERE group_name = ?",
        )
        .bind(group)
        .fetch_one(&mut *tx)
        .await?;
        let log_key: String = row.get(0);
        let mut last_delivered = entry_id_from(row.get(1), row.get(2));

        let now = now_ms_i64();
        let claim_idle = duration_ms(read.claim_idle);
        let count = read.count.max(1);
        sqlx::query(
            "INSERT INTO group_members (group_name, member_id, seen_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(group_name, member_id) DO UPDATE SET seen_at_ms = excluded.seen_at_ms",
        )
        .bind(group)
        .bind(member)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut batch = Vec::new();
        let stale = sqlx::query(
            "SELECT id_ms, id_seq, delivery_count FROM group_pending
             WHERE group_name = ? AND delivered_at_ms <= ?
             ORDER BY id_ms, id_seq
             LIMIT ?",
        )
        .bind(group)
        .bind(now.saturating_sub(claim_idle))
        .bind(sql_limit(count))
        .fetch_all(&mut *tx)
        .await?;
        for row in stale {
            let entry_id = entry_id_from(row.get(0), row.get(1));
            let previous_count = row.get::<i64, _>(2);
            let delivery_count = previous_count.saturating_add(1);
            match fetch_fields(&mut tx, &log_key, entry_id).await? {
                Some(fields) => {
                    sqlx::query(
                        "UPDATE group_pending
                         SET member_id = ?, delivery_count = ?, delivered_at_ms = ?
                         WHERE group_name = ? AND id_ms = ? AND id_seq = ?",
                    )
                    .bind(member)
                    .bind(delivery_count)
                    .bind(now)
                    .bind(group)
                    .bind(sql_int(entry_id.ms))
                    .bind(sql_int(entry_id.seq))
                    .execute(&mut *tx)
                    .await?;
                    batch.push(GroupEntry {
                        entry_id,
                        fields,
                        delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
                    });
                }
                None => {
                    warn!(group, %entry_id, "pending entry trimmed from the log before ack");
                    let letter = DeadLetter::trimmed(
                        group,
                        entry_id,
                        u32::try_from(previous_count).unwrap_or(u32::MAX),
                    );
                    insert_dead_letter(&mut tx, &letter).await?;
                }
            }
        }

        let remaining = count.saturating_sub(batch.len());
        if remaining > 0 {
            let fresh = sqlx::query(
                "SELECT id_ms, id_seq, fields FROM log_entries
                 WHERE log_key = ? AND (id_ms > ? OR (id_ms = ? AND id_seq > ?))
                 ORDER BY id_ms, id_seq
                 LIMIT ?",
            )
            .bind(&log_key)
            .bind(sql_int(last_delivered.ms))
            .bind(sql_int(last_delivered.ms))
            .bind(sql_int(last_delivered.seq))
            .bind(sql_limit(remaining))
            .fetch_all(&mut *tx)
            .await?;
            for row in fresh {
                let entry = stream_entry_from_row(&log_key, &row)?;
                sqlx::query(
                    "INSERT INTO group_pending (group_name, id_ms, id_seq, member_id, delivery_count, delivered_at_ms)
                     VALUES (?, ?, ?, ?, 1, ?)
                     ON CONFLICT(group_name, id_ms, id_seq) DO NOTHING",
                )
                .bind(group)
                .bind(sql_int(entry.entry_id.ms))
                .bind(sql_int(entry.entry_id.seq))
                .bind(member)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                last_delivered = entry.entry_id;
                batch.push(GroupEntry {
                    entry_id: entry.entry_id,
                    fields: entry.fields,
                    delivery_count: 1,
                });
            }
            sqlx::query("UPDATE consumer_groups SET last_ms = ?, last_seq = ? WHERE group_name = ?")
                .bind(sql_int(last_delivered.ms))
                .bind(sql_int(last_delivered.seq))
                .bind(group)
                .execute(&mut *tx)
                .await?;
        }

        let oldest: Option<i64> =
            sqlx::query_scalar("SELECT MIN(delivered_at_ms) FROM group_pending WHERE group_name = ?")
                .bind(group)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;

        let next_claim_in = oldest.map(|delivered_at| {
            delivered_at
                .saturating_add(claim_idle)
                .saturating_sub(now_ms_i64())
                .max(0)
        });
        Ok((batch, next_claim_in))
    }
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn append(&self, log_key: &str, fields: Fields) -> StoreResult<EntryId> {
        if log_key.is_empty() {
            return Err(StoreError::InvalidLogKey);
        }
        let encoded = encode_fields(log_key, &fields)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO log_heads (log_key, last_ms, last_seq) VALUES (?, 0, 0)
             ON CONFLICT(log_key) DO NOTHING",
        )
        .bind(log_key)
        .execute(&mut *tx)
        .await?;
        let head = sqlx::query("SELECT last_ms, last_seq FROM log_heads WHERE log_key = ?")
            .bind(log_key)
            .fetch_one(&mut *tx)
            .await?;
        let entry_id = entry_id_from(head.get(0), head.get(1)).successor(now_ms());

        sqlx::query("INSERT INTO log_entries (log_key, id_ms, id_seq, fields) VALUES (?, ?, ?, ?)")
            .bind(log_key)
            .bind(sql_int(entry_id.ms))
            .bind(sql_int(entry_id.seq))
            .bind(encoded)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE log_heads SET last_ms = ?, last_seq = ? WHERE log_key = ?")
            .bind(sql_int(entry_id.ms))
            .bind(sql_int(entry_id.seq))
            .bind(log_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.appended.notify_waiters();
        Ok(entry_id)
    }

    async fn range(&self, log_key: &str, range: Range) -> StoreResult<Vec<StreamEntry>> {
        let (after_ms, after_seq) = range
            .after
            .map_or((-1, -1), |after| (sql_int(after.ms), sql_int(after.seq)));
        let until = range.until.unwrap_or(EntryId::MAX);
        let rows = sqlx::query(
            "SELECT id_ms, id_seq, fields FROM log_entries
             WHERE log_key = ?
               AND (id_ms > ? OR (id_ms = ? AND id_seq > ?))
               AND (id_ms < ? OR (id_ms = ? AND id_seq <= ?))
             ORDER BY id_ms, id_seq
             LIMIT ?",
        )
        .bind(log_key)
        .bind(after_ms)
        .bind(after_ms)
        .bind(after_seq)
        .bind(sql_int(until.ms))
        .bind(sql_int(until.ms))
        .bind(sql_int(until.seq))
        .bind(range.limit.map_or(-1, sql_limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| stream_entry_from_row(log_key, row))
            .collect()
    }

    async fn create_group(
        &self,
        group: &str,
        log_key: &str,
        start: GroupStart,
    ) -> StoreResult<()> {
        if log_key.is_empty() {
            return Err(StoreError::InvalidLogKey);
        }
        let start_at = match start {
            GroupStart::Beginning => EntryId::MIN,
            GroupStart::Tail => sqlx::query("SELECT last_ms, last_seq FROM log_heads WHERE log_key = ?")
                .bind(log_key)
                .fetch_optional(&self.pool)
                .await?
                .map_or(EntryId::MIN, |row| entry_id_from(row.get(0), row.get(1))),
        };
        sqlx::query(
            "INSERT INTO consumer_groups (group_name, log_key, last_ms, last_seq)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(group_name) DO NOTHING",
        )
        .bind(group)
        .bind(log_key)
        .bind(sql_int(start_at.ms))
        .bind(sql_int(start_at.seq))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        member: &str,
        read: GroupRead,
    ) -> StoreResult<Vec<GroupEntry>> {
        let deadline = tokio::time::Instant::now() + read.block;
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let (batch, next_claim_in) = self.try_read_group(group, member, &read).await?;
            let now = tokio::time::Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            let mut wake_at = deadline.min(now + self.poll_interval);
            if let Some(wait_ms) = next_claim_in {
                wake_at = wake_at.min(now + Duration::from_millis(wait_ms as u64));
            }
            tokio::select! {
                _ = &mut appended => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, group: &str, entry_id: EntryId) -> StoreResult<bool> {
        let removed = sqlx::query(
            "DELETE FROM group_pending WHERE group_name = ? AND id_ms = ? AND id_seq = ?",
        )
        .bind(group)
        .bind(sql_int(entry_id.ms))
        .bind(sql_int(entry_id.seq))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if removed == 0 && !self.group_exists(group).await? {
            return Err(StoreError::UnknownGroup(group.to_string()));
        }
        Ok(removed > 0)
    }

    async fn pending(&self, group: &str) -> StoreResult<Vec<PendingEntry>> {
        if !self.group_exists(group).await? {
            return Err(StoreError::UnknownGroup(group.to_string()));
        }
        let rows = sqlx::query(
            "SELECT id_ms, id_seq, member_id, delivery_count, delivered_at_ms
             FROM group_pending WHERE group_name = ?
             ORDER BY id_ms, id_seq",
        )
        .bind(group)
        .fetch_all(&self.pool)
        .await?;
        let now = now_ms_i64();
        Ok(rows
            .into_iter()
            .map(|row| PendingEntry {
                entry_id: entry_id_from(row.get(0), row.get(1)),
                member: row.get(2),
                delivery_count: u32::try_from(row.get::<i64, _>(3)).unwrap_or(u32::MAX),
                idle: Duration::from_millis(
                    u64::try_from(now.saturating_sub(row.get::<i64, _>(4))).unwrap_or(0),
                ),
            })
            .collect())
    }

    async fn dead_letter(&self, letter: DeadLetter) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_dead_letter(&mut tx, &letter).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn dead_letters(&self, group: Option<&str>) -> StoreResult<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT group_name, id_ms, id_seq, fields, delivery_count, reason, dead_at
             FROM dead_letters
             WHERE ? IS NULL OR group_name = ?
             ORDER BY group_name, id_ms, id_seq",
        )
        .bind(group)
        .bind(group)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let group: String = row.get(0);
                let fields = decode_fields(&group, row.get(3))?;
                let dead_at = DateTime::parse_from_rfc3339(&row.get::<String, _>(6))
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|e| StoreError::Corrupt {
                        log_key: group.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(DeadLetter {
                    entry_id: entry_id_from(row.get(1), row.get(2)),
                    fields,
                    delivery_count: u32::try_from(row.get::<i64, _>(4)).unwrap_or(u32::MAX),
                    reason: row.get(5),
                    dead_at,
                    group,
                })
            })
            .collect()
    }

    async fn groups(&self) -> StoreResult<Vec<GroupInfo>> {
        let rows = sqlx::query(
            "SELECT g.group_name, g.log_key, g.last_ms, g.last_seq,
                    (SELECT COUNT(*) FROM group_pending p WHERE p.group_name = g.group_name),
                    (SELECT COUNT(*) FROM group_members m WHERE m.group_name = g.group_name)
             FROM consumer_groups g
             ORDER BY g.group_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| GroupInfo {
                name: row.get(0),
                log_key: row.get(1),
                last_delivered_id: entry_id_from(row.get(2), row.get(3)),
                pending: usize::try_from(row.get::<i64, _>(4)).unwrap_or(0),
                members: usize::try_from(row.get::<i64, _>(5)).unwrap_or(0),
            })
            .collect())
    }

    async fn destroy_group(&self, group: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM consumer_groups WHERE group_name = ?")
            .bind(group)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM group_pending WHERE group_name = ?")
            .bind(group)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM group_members WHERE group_name = ?")
            .bind(group)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn trim(&self, log_key: &str, policy: TrimPolicy) -> StoreResult<u64> {
        let min_id = match policy {
            TrimPolicy::MinId(min_id) => Some(min_id),
            TrimPolicy::MaxLen(0) => None,
            TrimPolicy::MaxLen(max_len) => {
                let oldest_kept = sqlx::query(
                    "SELECT id_ms, id_seq FROM log_entries WHERE log_key = ?
                     ORDER BY id_ms DESC, id_seq DESC
                     LIMIT 1 OFFSET ?",
                )
                .bind(log_key)
                .bind(sql_limit(max_len - 1))
                .fetch_optional(&self.pool)
                .await?;
                match oldest_kept {
                    Some(row) => Some(entry_id_from(row.get(0), row.get(1))),
                    None => return Ok(0),
                }
            }
        };
        let removed = match min_id {
            Some(min_id) => sqlx::query(
                "DELETE FROM log_entries
                 WHERE log_key = ? AND (id_ms < ? OR (id_ms = ? AND id_seq < ?))",
            )
            .bind(log_key)
            .bind(sql_int(min_id.ms))
            .bind(sql_int(min_id.ms))
            .bind(sql_int(min_id.seq))
            .execute(&self.pool)
            .await?
            .rows_affected(),
            None => sqlx::query("DELETE FROM log_entries WHERE log_key = ?")
                .bind(log_key)
                .execute(&self.pool)
                .await?
                .rows_affected(),
        };
        Ok(removed)
    }

    async fn ping(&self) -> StoreResult<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

impl SqliteStore {
    async fn group_exists(&self, group: &str) -> StoreResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM consumer_groups WHERE group_name = ?")
                .bind(group)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl CursorStore for SqliteStore {
    async fn load_cursor(
        &self,
        user_id: UserId,
        client_id: ClientId,
    ) -> StoreResult<Option<ClientSyncState>> {
        let row = sqlx::query(
            "SELECT conversation_id, last_ms, last_seq, last_sync_at
             FROM client_sync_state
             WHERE user_id = ? AND client_id = ? AND expires_at_ms > ?",
        )
        .bind(user_id.to_string())
        .bind(client_id.to_string())
        .bind(now_ms_i64())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let corrupt = |reason: String| StoreError::Corrupt {
                log_key: "client_sync_state".into(),
                reason,
            };
            Ok(ClientSyncState {
                user_id,
                client_id,
                conversation_id: row
                    .get::<String, _>(0)
                    .parse()
                    .map_err(|e: uuid::Error| corrupt(e.to_string()))?,
                last_message_id: entry_id_from(row.get(1), row.get(2)),
                last_sync_at: DateTime::from_timestamp_millis(row.get(3))
                    .ok_or_else(|| corrupt("last_sync_at out of range".into()))?,
            })
        })
        .transpose()
    }

    async fn store_cursor(
        &self,
        cursor: &ClientSyncState,
        ttl: Duration,
    ) -> StoreResult<CursorUpdate> {
        let now = now_ms_i64();
        let written = sqlx::query(
            "INSERT INTO client_sync_state
                (user_id, client_id, conversation_id, last_ms, last_seq, last_sync_at, expires_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, client_id) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                last_ms = excluded.last_ms,
                last_seq = excluded.last_seq,
                last_sync_at = excluded.last_sync_at,
                expires_at_ms = excluded.expires_at_ms
             WHERE client_sync_state.conversation_id <> excluded.conversation_id
                OR client_sync_state.expires_at_ms <= ?
                OR excluded.last_ms > client_sync_state.last_ms
                OR (excluded.last_ms = client_sync_state.last_ms
                    AND excluded.last_seq > client_sync_state.last_seq)",
        )
        .bind(cursor.user_id.to_string())
        .bind(cursor.client_id.to_string())
        .bind(cursor.conversation_id.to_string())
        .bind(sql_int(cursor.last_message_id.ms))
        .bind(sql_int(cursor.last_message_id.seq))
        .bind(cursor.last_sync_at.timestamp_millis())
        .bind(now.saturating_add(duration_ms(ttl)))
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(if written > 0 {
            CursorUpdate::Advanced
        } else {
            CursorUpdate::Stale
        })
    }

    async fn clear_cursor(&self, user_id: UserId, client_id: ClientId) -> StoreResult<bool> {
        let removed = sqlx::query("DELETE FROM client_sync_state WHERE user_id = ? AND client_id = ?")
            .bind(user_id.to_string())
            .bind(client_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    async fn conversation_clients(
        &self,
        conversation_id: ConversationId,
    ) -> StoreResult<Vec<ClientId>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT client_id FROM client_sync_state
             WHERE conversation_id = ? AND expires_at_ms > ?
             ORDER BY client_id",
        )
        .bind(conversation_id.to_string())
        .bind(now_ms_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|raw| {
                raw.parse().map_err(|e: uuid::Error| StoreError::Corrupt {
                    log_key: "client_sync_state".into(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn increment_offline(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        ttl: Duration,
    ) -> StoreResult<u64> {
        let now = now_ms_i64();
        let count: i64 = sqlx::query_scalar(
            "INSERT INTO offline_counters (user_id, conversation_id, message_count, expires_at_ms)
             VALUES (?, ?, 1, ?)
             ON CONFLICT(user_id, conversation_id) DO UPDATE SET
                message_count = CASE WHEN offline_counters.expires_at_ms <= ? THEN 1
                                     ELSE offline_counters.message_count + 1 END,
                expires_at_ms = excluded.expires_at_ms
             RETURNING message_count",
        )
        .bind(user_id.to_string())
        .bind(conversation_id.to_string())
        .bind(now.saturating_add(duration_ms(ttl)))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn offline_count(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<u64> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT message_count FROM offline_counters
             WHERE user_id = ? AND conversation_id = ? AND expires_at_ms > ?",
        )
        .bind(user_id.to_string())
        .bind(conversation_id.to_string())
        .bind(now_ms_i64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.map_or(0, |count| u64::try_from(count).unwrap_or(0)))
    }

    async fn clear_offline(
        &self,
        user_id: UserId,
        conversation_ids: &[ConversationId],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for conversation_id in conversation_ids {
            sqlx::query("DELETE FROM offline_counters WHERE user_id = ? AND conversation_id = ?")
                .bind(user_id.to_string())
                .bind(conversation_id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_present(
        &self,
        user_id: UserId,
        client_id: ClientId,
        conversation_id: ConversationId,
        ttl: Duration,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO presence (user_id, conversation_id, client_id, expires_at_ms)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, conversation_id, client_id) DO UPDATE SET
                expires_at_ms = excluded.expires_at_ms",
        )
        .bind(user_id.to_string())
        .bind(conversation_id.to_string())
        .bind(client_id.to_string())
        .bind(now_ms_i64().saturating_add(duration_ms(ttl)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_presence(
        &self,
        user_id: UserId,
        client_id: ClientId,
        conversation_id: ConversationId,
    ) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM presence WHERE user_id = ? AND conversation_id = ? AND client_id = ?",
        )
        .bind(user_id.to_string())
        .bind(conversation_id.to_string())
        .bind(client_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_present(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<bool> {
        let present: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM presence
             WHERE user_id = ? AND conversation_id = ? AND expires_at_ms > ?)",
        )
        .bind(user_id.to_string())
        .bind(conversation_id.to_string())
        .bind(now_ms_i64())
        .fetch_one(&self.pool)
        .await?;
        Ok(present != 0)
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let now = now_ms_i64();
        let cursors = sqlx::query("DELETE FROM client_sync_state WHERE expires_at_ms <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let counters = sqlx::query("DELETE FROM offline_counters WHERE expires_at_ms <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let presence = sqlx::query("DELETE FROM presence WHERE expires_at_ms <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(cursors + counters + presence)
    }
}

async fn fetch_fields(
    conn: &mut SqliteConnection,
    log_key: &str,
    entry_id: EntryId,
) -> StoreResult<Option<Fields>> {
    let raw: Option<String> = sqlx::query_scalar(
        "SELECT fields FROM log_entries WHERE log_key = ? AND id_ms = ? AND id_seq = ?",
    )
    .bind(log_key)
    .bind(sql_int(entry_id.ms))
    .bind(sql_int(entry_id.seq))
    .fetch_optional(&mut *conn)
    .await?;
    raw.map(|raw| decode_fields(log_key, raw)).transpose()
}

/// Stores `letter` and drops its pending record.
async fn insert_dead_letter(conn: &mut SqliteConnection, letter: &DeadLetter) -> StoreResult<()> {
    let encoded = encode_fields(&letter.group, &letter.fields)?;
    sqlx::query(
        "INSERT INTO dead_letters (group_name, id_ms, id_seq, fields, delivery_count, reason, dead_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(group_name, id_ms, id_seq) DO UPDATE SET
            fields = excluded.fields,
            delivery_count = excluded.delivery_count,
            reason = excluded.reason,
            dead_at = excluded.dead_at",
    )
    .bind(&letter.group)
    .bind(sql_int(letter.entry_id.ms))
    .bind(sql_int(letter.entry_id.seq))
    .bind(encoded)
    .bind(i64::from(letter.delivery_count))
    .bind(&letter.reason)
    .bind(letter.dead_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;
    delete_pending(conn, &letter.group, letter.entry_id).await
}

async fn delete_pending(
    conn: &mut SqliteConnection,
    group: &str,
    entry_id: EntryId,
) -> StoreResult<()> {
    sqlx::query("DELETE FROM group_pending WHERE group_name = ? AND id_ms = ? AND id_seq = ?")
        .bind(group)
        .bind(sql_int(entry_id.ms))
        .bind(sql_int(entry_id.seq))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn stream_entry_from_row(log_key: &str, row: &SqliteRow) -> StoreResult<StreamEntry> {
    Ok(StreamEntry {
        entry_id: entry_id_from(row.get(0), row.get(1)),
        fields: decode_fields(log_key, row.get(2))?,
    })
}

fn encode_fields(log_key: &str, fields: &Fields) -> StoreResult<String> {
    serde_json::to_string(fields).map_err(|e| StoreError::Corrupt {
        log_key: log_key.to_string(),
        reason: e.to_string(),
    })
}

fn decode_fields(log_key: &str, raw: String) -> StoreResult<Fields> {
    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
        log_key: log_key.to_string(),
        reason: e.to_string(),
    })
}

fn entry_id_from(ms: i64, seq: i64) -> EntryId {
    EntryId::new(
        u64::try_from(ms).unwrap_or(0),
        u64::try_from(seq).unwrap_or(0),
    )
}

/// SQLite integers are signed; ids past `i64::MAX` only appear as open bounds.
fn sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn sql_limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn now_ms_i64() -> i64 {
    sql_int(now_ms())
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> StoreResult<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).map_err(|e| {
        StoreError::Unavailable(format!(
            "failed to create parent directory '{}' for database url '{database_url}': {e}",
            parent.display()
        ))
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return None;
    }
    Some(Path::new(path).to_path_buf())
}
