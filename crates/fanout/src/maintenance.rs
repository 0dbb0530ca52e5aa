//! Periodic housekeeping: fan-out log retention, expired cursors and counters, and the
//! dedup window.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use shared::domain::EntryId;
use storage::{FanoutStore, StoreResult, TrimPolicy, FANOUT_LOG_KEY};

use crate::{consumer::wait_or_shutdown, dedup::DedupGuard};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub fanout_trimmed: u64,
    pub expired_state: u64,
    pub dedup_purged: usize,
}

#[derive(Clone)]
pub struct Maintenance {
    store: Arc<dyn FanoutStore>,
    dedup: Arc<DedupGuard>,
    fanout_max_age: Duration,
    interval: Duration,
}

impl Maintenance {
    pub fn new(
        store: Arc<dyn FanoutStore>,
        dedup: Arc<DedupGuard>,
        fanout_max_age: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            dedup,
            fanout_max_age,
            interval,
        }
    }

    /// Pointers older than `fanout_max_age` are dropped even if some group never read them.
    pub async fn run_once(&self) -> StoreResult<MaintenanceReport> {
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let max_age_ms = u64::try_from(self.fanout_max_age.as_millis()).unwrap_or(u64::MAX);
        let cutoff = EntryId::new(now_ms.saturating_sub(max_age_ms), 0);

        let fanout_trimmed = self
            .store
            .trim(FANOUT_LOG_KEY, TrimPolicy::MinId(cutoff))
            .await?;
        let expired_state = self.store.purge_expired().await?;
        let dedup_purged = self.dedup.purge_expired();
        let report = MaintenanceReport {
            fanout_trimmed,
            expired_state,
            dedup_purged,
        };
        debug!(?report, %cutoff, "maintenance pass");
        Ok(report)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "maintenance started");
        loop {
            if wait_or_shutdown(&mut shutdown, self.interval).await {
                break;
            }
            if let Err(error) = self.run_once().await {
                warn!(%error, "maintenance pass failed");
            }
        }
        info!("maintenance stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use storage::{CursorStore, LogStore, MemoryStore, Range};

    #[tokio::test]
    async fn old_pointers_are_trimmed_and_recent_ones_kept() {
        let store = MemoryStore::new();
        let mut stale = storage::Fields::new();
        stale.insert("marker".into(), "stale".into());
        store.append(FANOUT_LOG_KEY, stale).await.expect("append");
        let dedup = Arc::new(DedupGuard::new(Duration::from_secs(60)));
        let maintenance = Maintenance::new(
            Arc::new(store.clone()),
            dedup,
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );

        let first = maintenance.run_once().await.expect("first pass");
        assert_eq!(first.fanout_trimmed, 0);
        assert_eq!(
            store.range(FANOUT_LOG_KEY, Range::all()).await.expect("range").len(),
            1
        );

        let expiring = Maintenance::new(
            Arc::new(store.clone()),
            Arc::new(DedupGuard::new(Duration::from_secs(60))),
            Duration::ZERO,
            Duration::from_secs(60),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = expiring.run_once().await.expect("second pass");
        assert_eq!(second.fanout_trimmed, 1);
        assert_eq!(store.purge_expired().await.expect("purge"), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let maintenance = Maintenance::new(
            Arc::new(MemoryStore::new()),
            Arc::new(DedupGuard::new(Duration::from_secs(60))),
            Duration::from_secs(3600),
            Duration::from_millis(5),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(maintenance.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).expect("shutdown");
        running.await.expect("join");
    }
}
