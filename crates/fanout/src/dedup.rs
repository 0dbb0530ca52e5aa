use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use shared::domain::EntryId;

/// Short-lived memory of `(group, entry_id)` keys already broadcast.
pub struct DedupGuard {
    ttl: Duration,
    seen: Mutex<HashMap<(String, EntryId), Instant>>,
}

impl DedupGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically records the key. Returns `false` when it was already recorded and has
    /// not expired.
    pub fn try_claim(&self, group: &str, entry_id: EntryId) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (group.to_string(), entry_id);
        match seen.get(&key) {
            Some(expires_at) if *expires_at > now => false,
            _ => {
                seen.insert(key, now + self.ttl);
                true
            }
        }
    }

    /// Forgets a claim whose processing failed, so a redelivery may broadcast it.
    pub fn release(&self, group: &str, entry_id: EntryId) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(group.to_string(), entry_id));
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let before = seen.len();
        seen.retain(|_, expires_at| *expires_at > now);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_claim_is_rejected_until_expiry() {
        let guard = DedupGuard::new(Duration::from_secs(60));
        let id = EntryId::new(10, 0);
        assert!(guard.try_claim("fanout-a", id));
        assert!(!guard.try_claim("fanout-a", id));
        assert!(guard.try_claim("fanout-b", id));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(guard.try_claim("fanout-a", id));
    }

    #[tokio::test]
    async fn released_claims_can_be_taken_again() {
        let guard = DedupGuard::new(Duration::from_secs(60));
        let id = EntryId::new(10, 0);
        assert!(guard.try_claim("g", id));
        guard.release("g", id);
        assert!(guard.try_claim("g", id));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_keys() {
        let guard = DedupGuard::new(Duration::from_secs(10));
        guard.try_claim("g", EntryId::new(1, 0));
        tokio::time::advance(Duration::from_secs(6)).await;
        guard.try_claim("g", EntryId::new(2, 0));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(guard.purge_expired(), 1);
        assert_eq!(guard.len(), 1);
    }
}
