// In-memory lease store used by tests and as the reference semantics for
// the contract. Lease expiry runs on tokio's clock so paused-time tests can
// drive it deterministically.

use super::{LeaseStore, LeaseToken, RenewOutcome, WriteOutcome};
use crate::errors::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Default)]
struct TargetState {
    metadata: HashMap<String, String>,
    lease: Option<GrantedLease>,
}

struct GrantedLease {
    token: LeaseToken,
    duration: Duration,
    expires_at: Instant,
}

impl GrantedLease {
    fn is_valid(&self, token: &LeaseToken, now: Instant) -> bool {
        self.token == *token && self.expires_at > now
    }
}

/// In-memory implementation of the object-store contract.
///
/// Clones share state, so a fleet of simulated processes can point at the
/// same store the way real processes point at the same remote account.
#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    targets: Arc<Mutex<HashMap<String, TargetState>>>,
    renew_counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of renewal calls the store has seen for `token`, regardless
    /// of outcome. Test observation hook.
    pub async fn renew_count(&self, token: &LeaseToken) -> usize {
        self.renew_counts
            .lock()
            .await
            .get(token.as_str())
            .copied()
            .unwrap_or(0)
    }

    /// Forcibly clear the current grant, simulating a store-side break or
    /// expiry while a holder still believes it owns the lease.
    pub async fn break_lease(&self, target: &str) {
        if let Some(state) = self.targets.lock().await.get_mut(target) {
            state.lease = None;
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn exists(&self, target: &str) -> Result<bool, StoreError> {
        Ok(self.targets.lock().await.contains_key(target))
    }

    async fn create_if_absent(&self, target: &str) -> Result<(), StoreError> {
        self.targets
            .lock()
            .await
            .entry(target.to_string())
            .or_default();
        Ok(())
    }

    async fn acquire_lease(
        &self,
        target: &str,
        duration: Duration,
    ) -> Result<Option<LeaseToken>, StoreError> {
        let mut targets = self.targets.lock().await;
        let state = targets.entry(target.to_string()).or_default();
        let now = Instant::now();

        if let Some(lease) = &state.lease {
            if lease.expires_at > now {
                return Ok(None);
            }
        }

        let token = LeaseToken::generate();
        state.lease = Some(GrantedLease {
            token: token.clone(),
            duration,
            expires_at: now + duration,
        });
        Ok(Some(token))
    }

    async fn renew_lease(
        &self,
        target: &str,
        token: &LeaseToken,
    ) -> Result<RenewOutcome, StoreError> {
        *self
            .renew_counts
            .lock()
            .await
            .entry(token.as_str().to_string())
            .or_insert(0) += 1;

        let mut targets = self.targets.lock().await;
        let now = Instant::now();
        let Some(state) = targets.get_mut(target) else {
            return Ok(RenewOutcome::Rejected);
        };
        match &mut state.lease {
            Some(lease) if lease.is_valid(token, now) => {
                lease.expires_at = now + lease.duration;
                Ok(RenewOutcome::Renewed)
            }
            _ => Ok(RenewOutcome::Rejected),
        }
    }

    async fn release_lease(&self, target: &str, token: &LeaseToken) -> Result<(), StoreError> {
        let mut targets = self.targets.lock().await;
        if let Some(state) = targets.get_mut(target) {
            if matches!(&state.lease, Some(lease) if lease.token == *token) {
                state.lease = None;
            }
        }
        Ok(())
    }

    async fn read_metadata(&self, target: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .targets
            .lock()
            .await
            .get(target)
            .map(|state| state.metadata.clone())
            .unwrap_or_default())
    }

    async fn write_metadata(
        &self,
        target: &str,
        entries: HashMap<String, String>,
        token: &LeaseToken,
    ) -> Result<WriteOutcome, StoreError> {
        let mut targets = self.targets.lock().await;
        let now = Instant::now();
        let Some(state) = targets.get_mut(target) else {
            return Ok(WriteOutcome::Conflict);
        };
        match &state.lease {
            Some(lease) if lease.is_valid(token, now) => {
                state.metadata.extend(entries);
                Ok(WriteOutcome::Written)
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_if_absent_is_idempotent() {
        let store = InMemoryLeaseStore::new();
        store.create_if_absent("job").await.unwrap();
        store.create_if_absent("job").await.unwrap();
        assert!(store.exists("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_second_acquire_conflicts_while_held() {
        let store = InMemoryLeaseStore::new();
        let token = store
            .acquire_lease("job", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(token.is_some());

        let second = store
            .acquire_lease("job", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_renewal() {
        let store = InMemoryLeaseStore::new();
        let first = store
            .acquire_lease("job", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(first.is_some());

        tokio::time::advance(Duration::from_secs(11)).await;

        let second = store
            .acquire_lease("job", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(second.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_rearms_expiry() {
        let store = InMemoryLeaseStore::new();
        let token = store
            .acquire_lease("job", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(
            store.renew_lease("job", &token).await.unwrap(),
            RenewOutcome::Renewed
        );

        // Original grant would have lapsed by now; renewal pushed it out.
        tokio::time::advance(Duration::from_secs(8)).await;
        let contender = store
            .acquire_lease("job", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(contender.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_rejected_after_expiry() {
        let store = InMemoryLeaseStore::new();
        let token = store
            .acquire_lease("job", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            store.renew_lease("job", &token).await.unwrap(),
            RenewOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn test_write_with_stale_token_conflicts() {
        let store = InMemoryLeaseStore::new();
        let stale = store
            .acquire_lease("job", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store.release_lease("job", &stale).await.unwrap();

        let entries = HashMap::from([("progress".to_string(), "done".to_string())]);
        let outcome = store.write_metadata("job", entries, &stale).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
        assert!(store.read_metadata("job").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_with_current_token_merges() {
        let store = InMemoryLeaseStore::new();
        let token = store
            .acquire_lease("job", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let first = HashMap::from([("progress".to_string(), "done".to_string())]);
        assert_eq!(
            store.write_metadata("job", first, &token).await.unwrap(),
            WriteOutcome::Written
        );
        let second = HashMap::from([("owner".to_string(), "worker-1".to_string())]);
        assert_eq!(
            store.write_metadata("job", second, &token).await.unwrap(),
            WriteOutcome::Written
        );

        let metadata = store.read_metadata("job").await.unwrap();
        assert_eq!(metadata.get("progress").map(String::as_str), Some("done"));
        assert_eq!(metadata.get("owner").map(String::as_str), Some("worker-1"));
    }

    #[tokio::test]
    async fn test_release_with_stale_token_is_noop() {
        let store = InMemoryLeaseStore::new();
        let old = store
            .acquire_lease("job", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store.release_lease("job", &old).await.unwrap();

        let current = store
            .acquire_lease("job", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        // Releasing with the superseded token must not evict the new holder.
        store.release_lease("job", &old).await.unwrap();
        let contender = store
            .acquire_lease("job", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(contender.is_none());

        store.release_lease("job", &current).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_count_tracks_calls() {
        let store = InMemoryLeaseStore::new();
        let token = store
            .acquire_lease("job", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.renew_count(&token).await, 0);
        store.renew_lease("job", &token).await.unwrap();
        store.renew_lease("job", &token).await.unwrap();
        assert_eq!(store.renew_count(&token).await, 2);
    }
}
