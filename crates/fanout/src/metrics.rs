use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use shared::domain::ConversationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Published,
    PublishFanoutFailures,
    PointersProcessed,
    Broadcasts,
    Delivered,
    Evicted,
    DuplicatesSuppressed,
    ResolutionFailures,
    DeadLettered,
    StoreRetries,
    SessionsOpened,
    SessionsClosed,
    BacklogDelivered,
    LiveDelivered,
}

/// Pipeline counters, updated lock-free from every task.
#[derive(Debug, Default)]
pub struct FanoutMetrics {
    published: AtomicU64,
    publish_fanout_failures: AtomicU64,
    pointers_processed: AtomicU64,
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    evicted: AtomicU64,
    duplicates_suppressed: AtomicU64,
    resolution_failures: AtomicU64,
    dead_lettered: AtomicU64,
    store_retries: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    backlog_delivered: AtomicU64,
    live_delivered: AtomicU64,
}

impl FanoutMetrics {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Published => &self.published,
            Counter::PublishFanoutFailures => &self.publish_fanout_failures,
            Counter::PointersProcessed => &self.pointers_processed,
            Counter::Broadcasts => &self.broadcasts,
            Counter::Delivered => &self.delivered,
            Counter::Evicted => &self.evicted,
            Counter::DuplicatesSuppressed => &self.duplicates_suppressed,
            Counter::ResolutionFailures => &self.resolution_failures,
            Counter::DeadLettered => &self.dead_lettered,
            Counter::StoreRetries => &self.store_retries,
            Counter::SessionsOpened => &self.sessions_opened,
            Counter::SessionsClosed => &self.sessions_closed,
            Counter::BacklogDelivered => &self.backlog_delivered,
            Counter::LiveDelivered => &self.live_delivered,
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, value: u64) {
        self.slot(counter).fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            published: self.get(Counter::Published),
            publish_fanout_failures: self.get(Counter::PublishFanoutFailures),
            pointers_processed: self.get(Counter::PointersProcessed),
            broadcasts: self.get(Counter::Broadcasts),
            delivered: self.get(Counter::Delivered),
            evicted: self.get(Counter::Evicted),
            duplicates_suppressed: self.get(Counter::DuplicatesSuppressed),
            resolution_failures: self.get(Counter::ResolutionFailures),
            dead_lettered: self.get(Counter::DeadLettered),
            store_retries: self.get(Counter::StoreRetries),
            sessions_opened: self.get(Counter::SessionsOpened),
            sessions_closed: self.get(Counter::SessionsClosed),
            backlog_delivered: self.get(Counter::BacklogDelivered),
            live_delivered: self.get(Counter::LiveDelivered),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub published: u64,
    pub publish_fanout_failures: u64,
    pub pointers_processed: u64,
    pub broadcasts: u64,
    pub delivered: u64,
    pub evicted: u64,
    pub duplicates_suppressed: u64,
    pub resolution_failures: u64,
    pub dead_lettered: u64,
    pub store_retries: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub backlog_delivered: u64,
    pub live_delivered: u64,
}

/// Point-in-time view of one instance, served by `GET /metrics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub instance_id: String,
    pub group: String,
    pub pending: usize,
    pub oldest_pending_ms: u64,
    pub dead_letters: usize,
    pub dedup_keys: usize,
    pub subscribers: BTreeMap<ConversationId, usize>,
    pub counters: PipelineCounters,
}
