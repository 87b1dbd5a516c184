//! Distributed lease over a coordination store.
//!
//! The store only needs atomic set-if-absent with TTL plus compare-and-set
//! refresh/release keyed on the holder id. Redis provides that with SET NX
//! EX and two small Lua scripts; an in-memory implementation backs tests
//! and single-node deployments.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Result, StandbyError};

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically acquire the lease if nobody holds it. Returns whether this
    /// holder now owns it.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Extend the lease, but only if `holder` still owns it (CAS). Returns
    /// false when the lease was lost.
    async fn refresh(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release the lease if `holder` owns it, so a peer can take over
    /// without waiting for the TTL.
    async fn release(&self, key: &str, holder: &str) -> Result<bool>;
}

pub struct RedisLeaseStore {
    conn: ConnectionManager,
}

impl RedisLeaseStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StandbyError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn refresh(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                redis.call("EXPIRE", KEYS[1], ARGV[2])
                return 1
            else
                return 0
            end
        "#;

        let mut conn = self.conn.clone();
        let result: i32 = redis::Script::new(script)
            .key(key)
            .arg(holder)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                redis.call("DEL", KEYS[1])
                return 1
            else
                return 0
            end
        "#;

        let mut conn = self.conn.clone();
        let result: i32 = redis::Script::new(script)
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %key, released = result == 1, "lease release attempted");
        Ok(result == 1)
    }
}

/// In-process lease store for tests and single-node setups.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(leases: &mut HashMap<String, (String, Instant)>) {
        let now = Instant::now();
        leases.retain(|_, (_, expires)| *expires > now);
    }

    /// Current holder, if the lease is live. Test inspection helper.
    pub fn holder(&self, key: &str) -> Option<String> {
        let mut leases = self.leases.lock();
        Self::purge_expired(&mut leases);
        leases.get(key).map(|(h, _)| h.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock();
        Self::purge_expired(&mut leases);

        if leases.contains_key(key) {
            return Ok(false);
        }
        leases.insert(key.to_string(), (holder.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn refresh(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock();
        Self::purge_expired(&mut leases);

        match leases.get_mut(key) {
            Some((owner, expires)) if owner == holder => {
                *expires = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let mut leases = self.leases.lock();
        match leases.get(key) {
            Some((owner, _)) if owner == holder => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_exclusive() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire("lock", "a", ttl).await.unwrap());
        assert!(!store.try_acquire("lock", "b", ttl).await.unwrap());
        assert_eq!(store.holder("lock").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn refresh_requires_ownership() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(30);

        store.try_acquire("lock", "a", ttl).await.unwrap();
        assert!(store.refresh("lock", "a", ttl).await.unwrap());
        assert!(!store.refresh("lock", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn release_lets_peer_acquire() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(30);

        store.try_acquire("lock", "a", ttl).await.unwrap();
        assert!(store.release("lock", "a").await.unwrap());
        assert!(store.try_acquire("lock", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_reacquirable() {
        let store = MemoryLeaseStore::new();

        store
            .try_acquire("lock", "a", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store
            .try_acquire("lock", "b", Duration::from_secs(30))
            .await
            .unwrap());
    }
}
