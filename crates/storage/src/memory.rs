use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::Bound,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{sync::Notify, time::Instant};
use tracing::warn;

use shared::domain::{ClientId, ConversationId, EntryId, UserId};

use crate::{
    ClientSyncState, CursorStore, CursorUpdate, DeadLetter, Fields, GroupEntry, GroupInfo,
    GroupRead, GroupStart, LogStore, PendingEntry, Range, StoreError, StoreResult, StreamEntry,
    TrimPolicy,
};

/// Process-local store. Every clone shares the same state, so several consumers in one
/// process behave like instances sharing one backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    appended: Notify,
}

#[derive(Default)]
struct State {
    logs: HashMap<String, MemoryLog>,
    groups: HashMap<String, MemoryGroup>,
    dead_letters: Vec<DeadLetter>,
    cursors: HashMap<(UserId, ClientId), Expiring<ClientSyncState>>,
    offline: HashMap<(UserId, ConversationId), Expiring<u64>>,
    presence: HashMap<(UserId, ConversationId, ClientId), Instant>,
}

#[derive(Default)]
struct MemoryLog {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
}

struct MemoryGroup {
    log_key: String,
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingRecord>,
    members: BTreeSet<String>,
}

struct PendingRecord {
    member: String,
    delivery_count: u32,
    delivered_at: Instant,
}

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.shared
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// One non-blocking pass of a group read. Also reports when the earliest pending
    /// entry becomes claimable, so a blocked reader knows when to look again.
    fn try_read_group(
        &self,
        group: &str,
        member: &str,
        read: &GroupRead,
    ) -> StoreResult<(Vec<GroupEntry>, Option<Instant>)> {
        let mut state = self.lock()?;
        let State {
            logs,
            groups,
            dead_letters,
            ..
        } = &mut *state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| StoreError::UnknownGroup(group.to_string()))?;
        group_state.members.insert(member.to_string());

        let now = Instant::now();
        let count = read.count.max(1);
        let log = logs.get(&group_state.log_key);
        let mut batch = Vec::new();

        let claimable: Vec<EntryId> = group_state
            .pending
            .iter()
            .filter(|(_, record)| now.duration_since(record.delivered_at) >= read.claim_idle)
            .map(|(entry_id, _)| *entry_id)
            .take(count)
            .collect();
        for entry_id in claimable {
            let Some(fields) = log.and_then(|log| log.entries.get(&entry_id)) else {
                if let Some(record) = group_state.pending.remove(&entry_id) {
                    warn!(group, %entry_id, "pending entry trimmed from the log before ack");
                    dead_letters.retain(|old| !(old.group == group && old.entry_id == entry_id));
                    dead_letters.push(DeadLetter::trimmed(group, entry_id, record.delivery_count));
                }
                continue;
            };
            if let Some(record) = group_state.pending.get_mut(&entry_id) {
                record.member = member.to_string();
                record.delivery_count += 1;
                record.delivered_at = now;
                batch.push(GroupEntry {
                    entry_id,
                    fields: fields.clone(),
                    delivery_count: record.delivery_count,
                });
            }
        }

        let remaining = count.saturating_sub(batch.len());
        if remaining > 0 {
            if let Some(log) = log {
                let fresh: Vec<(EntryId, Fields)> = log
                    .entries
                    .range((Bound::Excluded(group_state.last_delivered), Bound::Unbounded))
                    .take(remaining)
                    .map(|(entry_id, fields)| (*entry_id, fields.clone()))
                    .collect();
                for (entry_id, fields) in fresh {
                    group_state.last_delivered = entry_id;
                    group_state.pending.insert(
                        entry_id,
                        PendingRecord {
                            member: member.to_string(),
                            delivery_count: 1,
                            delivered_at: now,
                        },
                    );
                    batch.push(GroupEntry {
                        entry_id,
                        fields,
                        delivery_count: 1,
                    });
                }
            }
        }

        let next_claim = group_state
            .pending
            .values()
            .map(|record| record.delivered_at + read.claim_idle)
            .min();
        Ok((batch, next_claim))
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append(&self, log_key: &str, fields: Fields) -> StoreResult<EntryId> {
        if log_key.is_empty() {
            return Err(StoreError::InvalidLogKey);
        }
        let entry_id = {
            let mut state = self.lock()?;
            let log = state.logs.entry(log_key.to_string()).or_default();
            let entry_id = log.last_id.successor(now_ms());
            log.last_id = entry_id;
            log.entries.insert(entry_id, fields);
            entry_id
        };
        self.shared.appended.notify_waiters();
        Ok(entry_id)
    }

    async fn range(&self, log_key: &str, range: Range) -> StoreResult<Vec<StreamEntry>> {
        let state = self.lock()?;
        let Some(log) = state.logs.get(log_key) else {
            return Ok(Vec::new());
        };
        let lower = range.after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(log
            .entries
            .range((lower, Bound::Unbounded))
            .take_while(|(entry_id, _)| range.admits(**entry_id))
            .take(range.limit.unwrap_or(usize::MAX))
            .map(|(entry_id, fields)| StreamEntry {
                entry_id: *entry_id,
                fields: fields.clone(),
            })
            .collect())
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
        let mut state = self.lock()?;
        let last_delivered = match start {
            GroupStart::Beginning => EntryId::MIN,
            GroupStart::Tail => state
                .logs
                .get(log_key)
                .map(|log| log.last_id)
                .unwrap_or(EntryId::MIN),
        };
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| MemoryGroup {
                log_key: log_key.to_string(),
                last_delivered,
                pending: BTreeMap::new(),
                members: BTreeSet::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        member: &str,
        read: GroupRead,
    ) -> StoreResult<Vec<GroupEntry>> {
        let deadline = Instant::now() + read.block;
        loop {
            let appended = self.shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let (batch, next_claim) = self.try_read_group(group, member, &read)?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            let wake_at = next_claim.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut appended => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, group: &str, entry_id: EntryId) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| StoreError::UnknownGroup(group.to_string()))?;
        Ok(group_state.pending.remove(&entry_id).is_some())
    }

    async fn pending(&self, group: &str) -> StoreResult<Vec<PendingEntry>> {
        let state = self.lock()?;
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| StoreError::UnknownGroup(group.to_string()))?;
        let now = Instant::now();
        Ok(group_state
            .pending
            .iter()
            .map(|(entry_id, record)| PendingEntry {
                entry_id: *entry_id,
                member: record.member.clone(),
                delivery_count: record.delivery_count,
                idle: now.duration_since(record.delivered_at),
            })
            .collect())
    }

    async fn dead_letter(&self, letter: DeadLetter) -> StoreResult<()> {
        let mut state = self.lock()?;
        if let Some(group_state) = state.groups.get_mut(&letter.group) {
            group_state.pending.remove(&letter.entry_id);
        }
        state
            .dead_letters
            .retain(|old| !(old.group == letter.group && old.entry_id == letter.entry_id));
        state.dead_letters.push(letter);
        Ok(())
    }

    async fn dead_letters(&self, group: Option<&str>) -> StoreResult<Vec<DeadLetter>> {
        let state = self.lock()?;
        let mut letters: Vec<DeadLetter> = state
            .dead_letters
            .iter()
            .filter(|letter| group.map_or(true, |group| letter.group == group))
            .cloned()
            .collect();
        letters.sort_by(|a, b| (&a.group, a.entry_id).cmp(&(&b.group, b.entry_id)));
        Ok(letters)
    }

    async fn groups(&self) -> StoreResult<Vec<GroupInfo>> {
        let state = self.lock()?;
        let mut groups: Vec<GroupInfo> = state
            .groups
            .iter()
            .map(|(name, group)| GroupInfo {
                name: name.clone(),
                log_key: group.log_key.clone(),
                last_delivered_id: group.last_delivered,
                pending: group.pending.len(),
                members: group.members.len(),
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn destroy_group(&self, group: &str) -> StoreResult<bool> {
        Ok(self.lock()?.groups.remove(group).is_some())
    }

    async fn trim(&self, log_key: &str, policy: TrimPolicy) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let Some(log) = state.logs.get_mut(log_key) else {
            return Ok(0);
        };
        let before = log.entries.len();
        match policy {
            TrimPolicy::MaxLen(max_len) => {
                while log.entries.len() > max_len {
                    log.entries.pop_first();
                }
            }
            TrimPolicy::MinId(min_id) => {
                log.entries = log.entries.split_off(&min_id);
            }
        }
        Ok((before - log.entries.len()) as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(
        &self,
        user_id: UserId,
        client_id: ClientId,
    ) -> StoreResult<Option<ClientSyncState>> {
        let state = self.lock()?;
        let now = Instant::now();
        Ok(state
            .cursors
            .get(&(user_id, client_id))
            .filter(|cursor| cursor.live(now))
            .map(|cursor| cursor.value.clone()))
    }

    async fn store_cursor(
        &self,
        cursor: &ClientSyncState,
        ttl: Duration,
    ) -> StoreResult<CursorUpdate> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let key = (cursor.user_id, cursor.client_id);
        let stale = state.cursors.get(&key).is_some_and(|existing| {
            existing.live(now)
                && existing.value.conversation_id == cursor.conversation_id
                && existing.value.last_message_id >= cursor.last_message_id
        });
        if stale {
            return Ok(CursorUpdate::Stale);
        }
        state.cursors.insert(
            key,
            Expiring {
                value: cursor.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(CursorUpdate::Advanced)
    }

    async fn clear_cursor(&self, user_id: UserId, client_id: ClientId) -> StoreResult<bool> {
        Ok(self.lock()?.cursors.remove(&(user_id, client_id)).is_some())
    }

    async fn conversation_clients(
        &self,
        conversation_id: ConversationId,
    ) -> StoreResult<Vec<ClientId>> {
        let state = self.lock()?;
        let now = Instant::now();
        let mut clients: Vec<ClientId> = state
            .cursors
            .values()
            .filter(|cursor| cursor.live(now) && cursor.value.conversation_id == conversation_id)
            .map(|cursor| cursor.value.client_id)
            .collect();
        clients.sort();
        Ok(clients)
    }

    async fn increment_offline(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        ttl: Duration,
    ) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let counter = state
            .offline
            .entry((user_id, conversation_id))
            .or_insert(Expiring {
                value: 0,
                expires_at: now,
            });
        if !counter.live(now) {
            counter.value = 0;
        }
        counter.value += 1;
        counter.expires_at = now + ttl;
        Ok(counter.value)
    }

    async fn offline_count(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<u64> {
        let state = self.lock()?;
        let now = Instant::now();
        Ok(state
            .offline
            .get(&(user_id, conversation_id))
            .filter(|counter| counter.live(now))
            .map_or(0, |counter| counter.value))
    }

    async fn clear_offline(
        &self,
        user_id: UserId,
        conversation_ids: &[ConversationId],
    ) -> StoreResult<()> {
        let mut state = self.lock()?;
        for conversation_id in conversation_ids {
            state.offline.remove(&(user_id, *conversation_id));
        }
        Ok(())
    }

    async fn mark_present(
        &self,
        user_id: UserId,
        client_id: ClientId,
        conversation_id: ConversationId,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut state = self.lock()?;
        state
            .presence
            .insert((user_id, conversation_id, client_id), Instant::now() + ttl);
        Ok(())
    }

    async fn clear_presence(
        &self,
        user_id: UserId,
        client_id: ClientId,
        conversation_id: ConversationId,
    ) -> StoreResult<()> {
        let mut state = self.lock()?;
        state.presence.remove(&(user_id, conversation_id, client_id));
        Ok(())
    }

    async fn is_present(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<bool> {
        let state = self.lock()?;
        let now = Instant::now();
        Ok(state
            .presence
            .iter()
            .any(|(&(user, conversation, _), &expires_at)| {
                user == user_id && conversation == conversation_id && expires_at > now
            }))
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let before = state.cursors.len() + state.offline.len() + state.presence.len();
        state.cursors.retain(|_, cursor| cursor.live(now));
        state.offline.retain(|_, counter| counter.live(now));
        state.presence.retain(|_, expires_at| *expires_at > now);
        let after = state.cursors.len() + state.offline.len() + state.presence.len();
        Ok((before - after) as u64)
    }
}

pub(crate) fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}
