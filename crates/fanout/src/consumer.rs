//! Fan-out consumer loops: pull pointers from the fan-out log through this instance's
//! consumer group, resolve them against conversation logs and hand them to the hub.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use storage::{
    DeadLetter, FanoutPointer, FanoutStore, GroupEntry, GroupRead, GroupStart, LogEntry, Range,
    StoreError, StoreResult, FANOUT_LOG_KEY,
};

use crate::{
    dedup::DedupGuard,
    hub::{BroadcastHub, BroadcastOutcome, Delivery},
    metrics::{Counter, FanoutMetrics},
    retry::{retry_transient, Backoff},
};

/// What happened to one group entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Broadcast(BroadcastOutcome),
    /// Already broadcast by this group; acknowledged without a second broadcast.
    Duplicate,
    /// Left pending for redelivery after the visibility timeout.
    Deferred,
    DeadLettered,
}

#[derive(Clone)]
pub struct FanoutConsumer {
    store: Arc<dyn FanoutStore>,
    hub: BroadcastHub,
    dedup: Arc<DedupGuard>,
    metrics: Arc<FanoutMetrics>,
    group: String,
    member: String,
    read: GroupRead,
    max_deliveries: u32,
    backoff: Backoff,
    attempts: u32,
}

pub struct ConsumerSettings {
    pub group: String,
    pub member: String,
    pub read: GroupRead,
    pub max_deliveries: u32,
    pub backoff: Backoff,
    pub attempts: u32,
}

impl FanoutConsumer {
    pub fn new(
        store: Arc<dyn FanoutStore>,
        hub: BroadcastHub,
        dedup: Arc<DedupGuard>,
        metrics: Arc<FanoutMetrics>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            store,
            hub,
            dedup,
            metrics,
            group: settings.group,
            member: settings.member,
            read: settings.read,
            max_deliveries: settings.max_deliveries,
            backoff: settings.backoff,
            attempts: settings.attempts,
        }
    }

    /// Creates the group at the fan-out log tail; a no-op when it already exists.
    pub async fn ensure_group(&self) -> StoreResult<()> {
        retry_transient(self.backoff, self.attempts, &self.metrics, "create_group", || {
            self.store
                .create_group(&self.group, FANOUT_LOG_KEY, GroupStart::Tail)
        })
        .await
    }

    /// One group read followed by in-order processing of the batch. Returns the batch size.
    pub async fn poll_once(&self) -> StoreResult<usize> {
        let batch = self.store.read_group(&self.group, &self.member, self.read).await?;
        let size = batch.len();
        for entry in batch {
            self.process(entry).await;
        }
        Ok(size)
    }

    pub async fn process(&self, entry: GroupEntry) -> Processed {
        let entry_id = entry.entry_id;
        self.metrics.incr(Counter::PointersProcessed);

        if entry.delivery_count > self.max_deliveries {
            let reason = format!(
                "gave up after {} deliveries (max {})",
                entry.delivery_count - 1,
                self.max_deliveries
            );
            return self.dead_letter(entry, reason).await;
        }

        let pointer = match FanoutPointer::from_fields(&entry.fields) {
            Ok(pointer) => pointer,
            Err(reason) => {
                return self
                    .dead_letter(entry, format!("malformed pointer: {reason}"))
                    .await
            }
        };

        if self.hub.subscriber_count(pointer.conversation_id) == 0 {
            // nobody here to deliver to; the backlog serves later connections
            self.metrics.incr(Counter::Broadcasts);
            self.ack(&entry).await;
            return Processed::Broadcast(BroadcastOutcome::default());
        }

        if !self.dedup.try_claim(&self.group, entry_id) {
            debug!(group = %self.group, %entry_id, "duplicate pointer, acknowledging only");
            self.metrics.incr(Counter::DuplicatesSuppressed);
            self.ack(&entry).await;
            return Processed::Duplicate;
        }

        let resolved = retry_transient(self.backoff, self.attempts, &self.metrics, "resolve", || {
            self.store
                .range(&pointer.source_log_key, Range::single(pointer.source_entry_id))
        })
        .await;
        let source = match resolved {
            Ok(entries) => entries
                .into_iter()
                .find(|candidate| candidate.entry_id == pointer.source_entry_id),
            Err(error) => {
                warn!(
                    group = %self.group,
                    %entry_id,
                    delivery_count = entry.delivery_count,
                    %error,
                    "pointer resolution failed, leaving pending"
                );
                return self.defer(&entry);
            }
        };
        let Some(source) = source else {
            warn!(
                group = %self.group,
                %entry_id,
                log_key = %pointer.source_log_key,
                source_entry_id = %pointer.source_entry_id,
                delivery_count = entry.delivery_count,
                "pointer target missing, leaving pending"
            );
            return self.defer(&entry);
        };
        let message = match LogEntry::from_stream_entry(&source) {
            Ok(message) => message,
            Err(reason) => {
                self.dedup.release(&self.group, entry_id);
                return self
                    .dead_letter(entry, format!("undecodable log entry: {reason}"))
                    .await;
            }
        };

        let conversation_id = message.conversation_id;
        let outcome = self
            .hub
            .broadcast(conversation_id, Delivery::Message(Arc::new(message)));
        self.metrics.incr(Counter::Broadcasts);
        self.metrics.add(Counter::Delivered, outcome.delivered as u64);
        self.metrics.add(Counter::Evicted, outcome.evicted as u64);
        debug!(
            group = %self.group,
            member = %self.member,
            %entry_id,
            %conversation_id,
            delivered = outcome.delivered,
            evicted = outcome.evicted,
            "broadcast"
        );
        self.ack(&entry).await;
        Processed::Broadcast(outcome)
    }

    fn defer(&self, entry: &GroupEntry) -> Processed {
        self.dedup.release(&self.group, entry.entry_id);
        self.metrics.incr(Counter::ResolutionFailures);
        Processed::Deferred
    }

    async fn ack(&self, entry: &GroupEntry) {
        let acked = retry_transient(self.backoff, self.attempts, &self.metrics, "ack", || {
            self.store.ack(&self.group, entry.entry_id)
        })
        .await;
        if let Err(error) = acked {
            // stays pending; the dedup guard absorbs the redelivery
            warn!(group = %self.group, entry_id = %entry.entry_id, %error, "ack failed");
        }
    }

    async fn dead_letter(&self, entry: GroupEntry, reason: String) -> Processed {
        error!(
            group = %self.group,
            entry_id = %entry.entry_id,
            delivery_count = entry.delivery_count,
            %reason,
            "dead-lettering fan-out entry"
        );
        let letter = DeadLetter {
            group: self.group.clone(),
            entry_id: entry.entry_id,
            fields: entry.fields,
            delivery_count: entry.delivery_count,
            reason,
            dead_at: Utc::now(),
        };
        let recorded = retry_transient(self.backoff, self.attempts, &self.metrics, "dead_letter", || {
            self.store.dead_letter(letter.clone())
        })
        .await;
        match recorded {
            Ok(()) => {
                self.metrics.incr(Counter::DeadLettered);
                Processed::DeadLettered
            }
            Err(error) => {
                error!(group = %self.group, entry_id = %letter.entry_id, %error, "dead-letter write failed");
                Processed::Deferred
            }
        }
    }

    /// Polls until `shutdown` flips. Store failures back off and retry; they never end the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(group = %self.group, member = %self.member, "fan-out consumer started");
        let mut failures: u32 = 0;
        while !*shutdown.borrow() {
            let polled = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                polled = self.poll_once() => polled,
            };
            let delay = match polled {
                Ok(size) => {
                    failures = 0;
                    if size == 0 {
                        tokio::task::yield_now().await;
                    }
                    continue;
                }
                Err(StoreError::UnknownGroup(group)) => {
                    warn!(%group, member = %self.member, "consumer group missing, recreating");
                    if let Err(error) = self.ensure_group().await {
                        warn!(%group, %error, "failed to recreate consumer group");
                    }
                    self.backoff.delay(failures)
                }
                Err(error) => {
                    let delay = self.backoff.delay(failures);
                    warn!(
                        group = %self.group,
                        member = %self.member,
                        %error,
                        ?delay,
                        "group read failed"
                    );
                    delay
                }
            };
            failures = failures.saturating_add(1);
            if wait_or_shutdown(&mut shutdown, delay).await {
                break;
            }
        }
        info!(group = %self.group, member = %self.member, "fan-out consumer stopped");
    }
}

/// Sleeps for `delay`; returns `true` if shutdown was signalled first.
pub(crate) async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
#[path = "tests/consumer_tests.rs"]
mod tests;
