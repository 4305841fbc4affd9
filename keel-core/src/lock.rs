//! Fleet-wide mutual exclusion for check cycles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),

    #[error("lock database: {0}")]
    Database(#[from] sqlx::Error),
}

/// Named TTL lock shared by every engine in a fleet.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Take or renew the lease on `name` for `ttl`.
    ///
    /// Returns `false` if another holder has an unexpired lease.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Give up the lease early. Leases also expire on their own.
    async fn release(&self, _name: &str) -> Result<(), LockError> {
        Ok(())
    }
}

struct Lease {
    holder: String,
    expires_at: Instant,
}

/// Process-local lease table. Handles created with [`MemoryLock::for_holder`]
/// share one table, which is enough to model a fleet in one process.
#[derive(Clone)]
pub struct MemoryLock {
    holder: String,
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl MemoryLock {
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Another handle on the same lease table.
    pub fn for_holder(&self, holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            leases: self.leases.clone(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

#[async_trait]
impl LockProvider for MemoryLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;

        if let Some(lease) = leases.get(name)
            && lease.holder != self.holder
            && lease.expires_at > now
        {
            return Ok(false);
        }

        leases.insert(
            name.to_string(),
            Lease {
                holder: self.holder.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str) -> Result<(), LockError> {
        let mut leases = self.leases.lock().await;
        if leases.get(name).is_some_and(|l| l.holder == self.holder) {
            leases.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_until_expiry() {
        let a = MemoryLock::new("a");
        let b = a.for_holder("b");
        let ttl = Duration::from_secs(55);

        assert!(a.try_acquire("cycle", ttl).await.unwrap());
        assert!(!b.try_acquire("cycle", ttl).await.unwrap());
        assert!(a.try_acquire("cycle", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(56)).await;
        assert!(b.try_acquire("cycle", ttl).await.unwrap());
        assert!(!a.try_acquire("cycle", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let a = MemoryLock::new("a");
        let b = a.for_holder("b");
        let ttl = Duration::from_secs(55);

        assert!(a.try_acquire("cycle", ttl).await.unwrap());
        b.release("cycle").await.unwrap();
        assert!(!b.try_acquire("cycle", ttl).await.unwrap());

        a.release("cycle").await.unwrap();
        assert!(b.try_acquire("cycle", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_independent_names() {
        let a = MemoryLock::new("a");
        let b = a.for_holder("b");
        let ttl = Duration::from_secs(55);
        assert!(a.try_acquire("one", ttl).await.unwrap());
        assert!(b.try_acquire("two", ttl).await.unwrap());
    }
}
