// Redis-backed implementation of the object-store contract.
//
// The lease lives in a hash at `lease:{target}` (fields `token`, `ttl_ms`)
// whose key TTL is the lease duration; renewal re-arms the TTL recorded at
// acquisition. All check-and-act steps run as Lua scripts so the token
// comparison and the mutation are atomic.

use super::{LeaseStore, LeaseToken, RenewOutcome, WriteOutcome};
use crate::config::RedisConfig;
use crate::errors::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const ACQUIRE_SCRIPT: &str = r#"
    if redis.call("exists", KEYS[1]) == 1 then
        return 0
    end
    redis.call("hset", KEYS[1], "token", ARGV[1], "ttl_ms", ARGV[2])
    redis.call("pexpire", KEYS[1], ARGV[2])
    return 1
"#;

const RENEW_SCRIPT: &str = r#"
    if redis.call("hget", KEYS[1], "token") == ARGV[1] then
        local ttl = redis.call("hget", KEYS[1], "ttl_ms")
        redis.call("pexpire", KEYS[1], ttl)
        return 1
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("hget", KEYS[1], "token") == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

const WRITE_METADATA_SCRIPT: &str = r#"
    if redis.call("hget", KEYS[1], "token") ~= ARGV[1] then
        return 0
    end
    for i = 2, #ARGV, 2 do
        redis.call("hset", KEYS[2], ARGV[i], ARGV[i + 1])
    end
    return 1
"#;

/// Redis connection wrapper
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
}

impl RedisPool {
    /// Create a new Redis connection pool
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub async fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        info!("Initializing Redis connection pool");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            StoreError::Connection(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::Connection(format!("Failed to create connection manager: {}", e))
        })?;

        info!("Redis connection pool initialized successfully");

        Ok(Self { manager })
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Health check - verify Redis connection is working
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.get_connection();

        let response: String = redis::cmd("PING").query_async(&mut conn).await?;

        if response != "PONG" {
            return Err(StoreError::Transient(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}

/// Object-store contract backed by Redis.
pub struct RedisLeaseStore {
    pool: RedisPool,
}

impl RedisLeaseStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn object_key(target: &str) -> String {
        format!("target:{}", target)
    }

    fn lease_key(target: &str) -> String {
        format!("lease:{}", target)
    }

    fn metadata_key(target: &str) -> String {
        format!("meta:{}", target)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    #[instrument(skip(self))]
    async fn exists(&self, target: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.get_connection();
        let exists: bool = conn.exists(Self::object_key(target)).await?;
        Ok(exists)
    }

    #[instrument(skip(self))]
    async fn create_if_absent(&self, target: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.get_connection();

        // SET NX; a pre-existing target makes this a no-op, which is success.
        let created: Option<String> = redis::cmd("SET")
            .arg(Self::object_key(target))
            .arg("")
            .arg("NX")
            .query_async(&mut conn)
            .await?;

        if created.is_some() {
            debug!(lease_target = %target, "Coordination target created");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(lease_target = %target, ttl_ms = %duration.as_millis()))]
    async fn acquire_lease(
        &self,
        target: &str,
        duration: Duration,
    ) -> Result<Option<LeaseToken>, StoreError> {
        let mut conn = self.pool.get_connection();
        let token = LeaseToken::generate();

        let granted: i32 = Script::new(ACQUIRE_SCRIPT)
            .key(Self::lease_key(target))
            .arg(token.as_str())
            .arg(duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if granted == 1 {
            debug!(token = %token, "Lease acquired");
            Ok(Some(token))
        } else {
            debug!("Lease already held elsewhere");
            Ok(None)
        }
    }

    #[instrument(skip(self, token), fields(lease_target = %target))]
    async fn renew_lease(
        &self,
        target: &str,
        token: &LeaseToken,
    ) -> Result<RenewOutcome, StoreError> {
        let mut conn = self.pool.get_connection();

        let renewed: i32 = Script::new(RENEW_SCRIPT)
            .key(Self::lease_key(target))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;

        if renewed == 1 {
            Ok(RenewOutcome::Renewed)
        } else {
            Ok(RenewOutcome::Rejected)
        }
    }

    #[instrument(skip(self, token), fields(lease_target = %target))]
    async fn release_lease(&self, target: &str, token: &LeaseToken) -> Result<(), StoreError> {
        let mut conn = self.pool.get_connection();

        let released: i32 = Script::new(RELEASE_SCRIPT)
            .key(Self::lease_key(target))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;

        if released == 1 {
            debug!("Lease released");
        } else {
            warn!("Lease was not owned or already expired");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn read_metadata(&self, target: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.pool.get_connection();
        let metadata: HashMap<String, String> = conn.hgetall(Self::metadata_key(target)).await?;
        Ok(metadata)
    }

    #[instrument(skip(self, entries, token), fields(lease_target = %target, entry_count = entries.len()))]
    async fn write_metadata(
        &self,
        target: &str,
        entries: HashMap<String, String>,
        token: &LeaseToken,
    ) -> Result<WriteOutcome, StoreError> {
        let mut conn = self.pool.get_connection();

        let script = Script::new(WRITE_METADATA_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(Self::lease_key(target))
            .key(Self::metadata_key(target))
            .arg(token.as_str());
        for (key, value) in &entries {
            invocation.arg(key).arg(value);
        }

        let written: i32 = invocation.invoke_async(&mut conn).await?;

        if written == 1 {
            Ok(WriteOutcome::Written)
        } else {
            Ok(WriteOutcome::Conflict)
        }
    }
}
