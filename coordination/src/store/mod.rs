// Object-store contract consumed by the lease lifecycle.
//
// The store is the only thing fleet members share. It enforces lease
// exclusivity and token-conditioned metadata writes; this layer adds no
// consensus of its own on top.

pub mod memory;
pub mod redis;

pub use memory::InMemoryLeaseStore;
pub use self::redis::{RedisLeaseStore, RedisPool};

use crate::errors::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Opaque value identifying one specific grant of a lease.
///
/// Every operation that depends on currently holding the lease carries the
/// token; the store rejects it once the grant has lapsed or been released.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a renewal call. `Rejected` means the lease lapsed or was
/// granted to someone else; it is an expected outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    Rejected,
}

/// Outcome of a token-conditioned metadata write. `Conflict` means the
/// supplied token no longer matches the current grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Conflict,
}

/// Shared object store with create-if-absent, an exclusive time-bounded
/// lease, and a metadata map guarded by the lease token.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Check whether the coordination target exists.
    async fn exists(&self, target: &str) -> Result<bool, StoreError>;

    /// Create the target as an empty object. Creating a target that already
    /// exists is success, not an error.
    async fn create_if_absent(&self, target: &str) -> Result<(), StoreError>;

    /// Try to acquire the exclusive lease for `duration`. Returns `None`
    /// when another holder currently owns it.
    async fn acquire_lease(
        &self,
        target: &str,
        duration: Duration,
    ) -> Result<Option<LeaseToken>, StoreError>;

    /// Re-arm the lease to its original duration, provided `token` still
    /// identifies the current grant.
    async fn renew_lease(&self, target: &str, token: &LeaseToken)
        -> Result<RenewOutcome, StoreError>;

    /// Hand the lease back. Best-effort: releasing with a stale token is a
    /// no-op on the store side.
    async fn release_lease(&self, target: &str, token: &LeaseToken) -> Result<(), StoreError>;

    /// Read the target's metadata map. A missing target reads as empty.
    async fn read_metadata(&self, target: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Merge `entries` into the target's metadata, conditioned on `token`
    /// still being the current grant.
    async fn write_metadata(
        &self,
        target: &str,
        entries: HashMap<String, String>,
        token: &LeaseToken,
    ) -> Result<WriteOutcome, StoreError>;
}
