//! In-process registry of live subscribers, keyed by conversation.
//!
//! Each subscriber owns a bounded queue. Broadcasting never waits on a subscriber: a
//! full queue evicts that subscriber and leaves every other one untouched.

use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use shared::domain::{ConversationId, UserId};
use storage::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(Arc<LogEntry>),
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub evicted: usize,
}

type ShardMap = HashMap<ConversationId, Vec<SubscriberSlot>>;

struct SubscriberSlot {
    id: u64,
    user_id: UserId,
    tx: mpsc::Sender<Delivery>,
    evicted: Arc<AtomicBool>,
}

struct HubInner {
    shards: Vec<RwLock<ShardMap>>,
    queue_capacity: usize,
    next_id: AtomicU64,
}

impl HubInner {
    fn shard(&self, conversation_id: ConversationId) -> &RwLock<ShardMap> {
        let mut hasher = DefaultHasher::new();
        conversation_id.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    fn remove(&self, conversation_id: ConversationId, ids: &[u64]) {
        let mut shard = self
            .shard(conversation_id)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(slots) = shard.get_mut(&conversation_id) {
            slots.retain(|slot| !ids.contains(&slot.id));
            if slots.is_empty() {
                shard.remove(&conversation_id);
            }
        }
    }
}

/// Cheap to clone; every clone shares the same registry.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(shards: usize, queue_capacity: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            inner: Arc::new(HubInner {
                shards,
                queue_capacity: queue_capacity.max(1),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a subscriber. Deliveries broadcast after this returns are queued for it.
    pub fn subscribe(&self, conversation_id: ConversationId, user_id: UserId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let evicted = Arc::new(AtomicBool::new(false));
        self.inner
            .shard(conversation_id)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id)
            .or_default()
            .push(SubscriberSlot {
                id,
                user_id,
                tx,
                evicted: evicted.clone(),
            });
        debug!(%conversation_id, %user_id, subscriber = id, "subscribed");
        Subscription {
            hub: self.inner.clone(),
            id,
            conversation_id,
            user_id,
            rx,
            evicted,
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    pub fn broadcast(&self, conversation_id: ConversationId, delivery: Delivery) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let mut gone = Vec::new();
        {
            let shard = self
                .inner
                .shard(conversation_id)
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(slots) = shard.get(&conversation_id) else {
                return outcome;
            };
            for slot in slots {
                match slot.tx.try_send(delivery.clone()) {
                    Ok(()) => outcome.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            %conversation_id,
                            user_id = %slot.user_id,
                            subscriber = slot.id,
                            "subscriber queue full, evicting"
                        );
                        slot.evicted.store(true, Ordering::Release);
                        outcome.evicted += 1;
                        gone.push(slot.id);
                    }
                    Err(TrySendError::Closed(_)) => gone.push(slot.id),
                }
            }
        }
        if !gone.is_empty() {
            self.inner.remove(conversation_id, &gone);
        }
        outcome
    }

    pub fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        self.inner
            .shard(conversation_id)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conversation_id)
            .map_or(0, Vec::len)
    }

    pub fn subscriber_counts(&self) -> BTreeMap<ConversationId, usize> {
        let mut counts = BTreeMap::new();
        for shard in &self.inner.shards {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            for (conversation_id, slots) in shard.iter() {
                counts.insert(*conversation_id, slots.len());
            }
        }
        counts
    }

    pub fn is_user_connected(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.inner
            .shard(conversation_id)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conversation_id)
            .is_some_and(|slots| slots.iter().any(|slot| slot.user_id == user_id))
    }
}

/// A live registration. Dropping it unregisters the subscriber.
pub struct Subscription {
    hub: Arc<HubInner>,
    id: u64,
    conversation_id: ConversationId,
    user_id: UserId,
    rx: mpsc::Receiver<Delivery>,
    evicted: Arc<AtomicBool>,
}

impl Subscription {
    /// Next queued delivery. `None` once the hub dropped this subscriber; check
    /// [`Subscription::is_evicted`] to tell eviction apart.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.remove(self.conversation_id, &[self.id]);
        debug!(
            conversation_id = %self.conversation_id,
            user_id = %self.user_id,
            subscriber = self.id,
            "unsubscribed"
        );
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
