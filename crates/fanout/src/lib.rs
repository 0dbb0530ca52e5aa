//! Live fan-out and offline recovery for conversation logs.
//!
//! Writers append to a conversation log and then to the shared fan-out log. Every
//! instance consumes the fan-out log through its own consumer group, resolves each
//! pointer and broadcasts it to the sessions connected locally. Sessions replay what a
//! client missed from its cursor before going live.

use std::{fmt::Display, sync::Arc, time::Duration};

use chrono::Utc;
use futures::{Sink, Stream};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use shared::{
    domain::{ConversationId, EntryId, UserId},
    protocol::{ClientFrame, ServerFrame},
};
use storage::{FanoutStore, GroupRead, NewLogEntry, StoreError, StoreResult};

pub mod config;
pub mod consumer;
pub mod dedup;
pub mod hub;
pub mod maintenance;
pub mod metrics;
pub mod publisher;
pub mod retry;
pub mod session;
pub mod sync;

pub use config::{ConfigError, FanoutConfig};
pub use consumer::{ConsumerSettings, FanoutConsumer, Processed};
pub use dedup::DedupGuard;
pub use hub::{BroadcastHub, BroadcastOutcome, Delivery, Subscription};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use metrics::{Counter, FanoutMetrics, MetricsSnapshot, PipelineCounters};
pub use publisher::{PublishError, Publisher};
pub use retry::Backoff;
pub use session::{run_session, SessionContext, SessionError, SessionParams, SessionReport};
pub use sync::{BacklogPage, OfflineSync};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

struct CoreInner {
    config: FanoutConfig,
    store: Arc<dyn FanoutStore>,
    hub: BroadcastHub,
    dedup: Arc<DedupGuard>,
    metrics: Arc<FanoutMetrics>,
    sync: OfflineSync,
    publisher: Publisher,
    shutdown: watch::Sender<bool>,
}

/// One instance of the fan-out core. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct FanoutCore {
    inner: Arc<CoreInner>,
}

impl FanoutCore {
    pub fn new(store: Arc<dyn FanoutStore>, config: FanoutConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let metrics = Arc::new(FanoutMetrics::default());
        let hub = BroadcastHub::new(config.hub_shards, config.subscriber_queue_capacity);
        let dedup = Arc::new(DedupGuard::new(config.dedup_ttl));
        let sync = OfflineSync::new(
            store.clone(),
            metrics.clone(),
            config.backoff,
            config.store_retry_attempts,
            config.cursor_ttl,
            config.offline_counter_ttl,
        );
        let publisher = Publisher::new(
            store.clone(),
            metrics.clone(),
            config.backoff,
            config.store_retry_attempts,
            config.conversation_max_len,
            config.conversation_trim_every,
        );
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(CoreInner {
                config,
                store,
                hub,
                dedup,
                metrics,
                sync,
                publisher,
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn FanoutStore> {
        &self.inner.store
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    pub fn sync(&self) -> &OfflineSync {
        &self.inner.sync
    }

    pub fn metrics(&self) -> &Arc<FanoutMetrics> {
        &self.inner.metrics
    }

    pub fn group_name(&self) -> String {
        self.inner.config.group_name()
    }

    /// Consumer loop `index` of this instance's group.
    pub fn consumer(&self, index: usize) -> FanoutConsumer {
        let config = &self.inner.config;
        FanoutConsumer::new(
            self.inner.store.clone(),
            self.inner.hub.clone(),
            self.inner.dedup.clone(),
            self.inner.metrics.clone(),
            ConsumerSettings {
                group: config.group_name(),
                member: config.member_name(index),
                read: GroupRead {
                    count: config.batch_size,
                    block: config.block_timeout,
                    claim_idle: config.visibility_timeout,
                },
                max_deliveries: config.max_deliveries,
                backoff: config.backoff,
                attempts: config.store_retry_attempts,
            },
        )
    }

    pub fn maintenance(&self) -> Maintenance {
        Maintenance::new(
            self.inner.store.clone(),
            self.inner.dedup.clone(),
            self.inner.config.fanout_max_age,
            self.inner.config.maintenance_interval,
        )
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext::new(
            self.inner.hub.clone(),
            self.inner.sync.clone(),
            self.inner.metrics.clone(),
            self.inner.config.backlog_page_size,
            self.inner.config.session_idle_timeout,
        )
    }

    /// Creates this instance's consumer group at the fan-out log tail, then spawns the
    /// consumer loops and the maintenance task. They run until [`FanoutCore::shutdown`].
    pub async fn start(&self) -> StoreResult<Vec<JoinHandle<()>>> {
        let first = self.consumer(0);
        first.ensure_group().await?;
        let mut tasks = Vec::with_capacity(self.inner.config.consumer_loops + 1);
        tasks.push(tokio::spawn(first.run(self.inner.shutdown.subscribe())));
        for index in 1..self.inner.config.consumer_loops {
            let consumer = self.consumer(index);
            tasks.push(tokio::spawn(consumer.run(self.inner.shutdown.subscribe())));
        }
        tasks.push(tokio::spawn(
            self.maintenance().run(self.inner.shutdown.subscribe()),
        ));
        info!(
            group = %self.group_name(),
            consumers = self.inner.config.consumer_loops,
            "fan-out core started"
        );
        Ok(tasks)
    }

    pub async fn publish(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        ciphertext: Vec<u8>,
        nonce: Vec<u8>,
    ) -> Result<EntryId, PublishError> {
        let message = NewLogEntry {
            conversation_id,
            sender_id,
            ciphertext,
            nonce,
            created_at: Utc::now(),
        };
        self.inner.publisher.publish(message).await
    }

    /// Publishes, then bumps the offline counter of each listed recipient that has no
    /// session on the conversation on any instance. Counters are bumped whenever the entry
    /// is durable, even if its fan-out pointer was lost. Counter failures are logged, never
    /// surfaced.
    pub async fn publish_with_offline(
        &self,
        message: NewLogEntry,
        offline_recipients: &[UserId],
    ) -> Result<EntryId, PublishError> {
        let conversation_id = message.conversation_id;
        let published = self.inner.publisher.publish(message).await;
        if let Err(PublishError::Append(_)) = published {
            return published;
        }
        for &user_id in offline_recipients {
            if self.inner.hub.is_user_connected(conversation_id, user_id) {
                continue;
            }
            match self.inner.sync.is_present(user_id, conversation_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                // unknown presence counts as offline
                Err(error) => {
                    warn!(%user_id, %conversation_id, %error, "presence lookup failed")
                }
            }
            if let Err(error) = self
                .inner
                .sync
                .record_offline_message(user_id, conversation_id)
                .await
            {
                warn!(%user_id, %conversation_id, %error, "failed to bump offline counter");
            }
        }
        published
    }

    /// Spawns a session over an already-authenticated connection.
    pub fn open_session<Si, St>(
        &self,
        params: SessionParams,
        sink: Si,
        stream: St,
    ) -> JoinHandle<SessionReport>
    where
        Si: Sink<ServerFrame> + Unpin + Send + 'static,
        Si::Error: Display,
        St: Stream<Item = ClientFrame> + Unpin + Send + 'static,
    {
        tokio::spawn(run_session(
            self.session_context(),
            params,
            sink,
            stream,
            self.inner.shutdown.subscribe(),
        ))
    }

    pub async fn metrics_snapshot(&self) -> StoreResult<MetricsSnapshot> {
        let group = self.group_name();
        let pending = match self.inner.store.pending(&group).await {
            Ok(pending) => pending,
            // not started yet, or already left
            Err(StoreError::UnknownGroup(_)) => Vec::new(),
            Err(error) => return Err(error),
        };
        let oldest_pending_ms = pending
            .iter()
            .map(|entry| entry.idle)
            .max()
            .unwrap_or(Duration::ZERO)
            .as_millis();
        let dead_letters = self.inner.store.dead_letters(Some(&group)).await?.len();
        Ok(MetricsSnapshot {
            instance_id: self.inner.config.instance_id.clone(),
            group,
            pending: pending.len(),
            oldest_pending_ms: u64::try_from(oldest_pending_ms).unwrap_or(u64::MAX),
            dead_letters,
            dedup_keys: self.inner.dedup.len(),
            subscribers: self.inner.hub.subscriber_counts(),
            counters: self.inner.metrics.counters(),
        })
    }

    /// Signals every consumer loop, the maintenance task and every open session to stop.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Destroys this instance's consumer group. Call after [`FanoutCore::shutdown`] when
    /// the instance is leaving for good; its pending entries go with it.
    pub async fn leave(&self) -> StoreResult<bool> {
        let group = self.group_name();
        let destroyed = self.inner.store.destroy_group(&group).await?;
        info!(%group, destroyed, "left fan-out");
        Ok(destroyed)
    }
}
