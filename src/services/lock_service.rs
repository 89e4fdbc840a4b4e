//! Per-game mutual exclusion on the cache backend, with a process-local fallback.

use std::{fmt, sync::Arc, time::Duration};

use dashmap::DashMap;
use rand::Rng;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time::{Instant, sleep},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::LockConfig,
    services::resilient_client::{BackendError, ResilientClient},
    state::game::{GameId, unix_millis},
};

/// Why a lock could not be taken or released.
#[derive(Debug, Error)]
pub enum LockError {
    /// The backend is unreachable or the breaker is open; callers may use [`LocalLocks`].
    #[error("lock backend unavailable")]
    BackendUnavailable(#[source] BackendError),
    /// Another holder kept the lock for the whole wait.
    #[error("timed out after {waited:?} waiting for lock `{key}`")]
    Timeout {
        /// Lock key.
        key: String,
        /// Time spent waiting.
        waited: Duration,
    },
}

/// Proof of ownership of one game's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    game_id: GameId,
    key: String,
    holder: String,
    expires_at: Instant,
}

impl LockToken {
    /// Game the lock protects.
    pub fn game_id(&self) -> GameId {
        self.game_id
    }

    /// Backend key of the lock record.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Holder identity stored in the record.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// When the record expires on its own.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.holder, self.key)
    }
}

/// Lock service: set-if-absent with TTL to acquire, compare-and-delete to release.
pub struct DistributedLock {
    client: Arc<ResilientClient>,
    prefix: String,
    ttl: Duration,
    timeout: Duration,
    retry_interval: Duration,
}

impl DistributedLock {
    /// Lock service over `client`, namespacing keys under `prefix`.
    pub fn new(client: Arc<ResilientClient>, prefix: &str, config: &LockConfig) -> Self {
        Self {
            client,
            prefix: prefix.to_owned(),
            ttl: config.ttl(),
            timeout: config.timeout(),
            retry_interval: config.retry_interval(),
        }
    }

    /// Backend key guarding game `id`.
    pub fn key_for(&self, id: GameId) -> String {
        format!("{}:lock:game:{id}", self.prefix)
    }

    /// Acquire the lock of game `id` within the configured timeout.
    pub async fn acquire(&self, id: GameId) -> Result<LockToken, LockError> {
        self.acquire_with_timeout(id, self.timeout).await
    }

    /// Acquire the lock of game `id`, retrying with jitter until `timeout` elapses.
    pub async fn acquire_with_timeout(
        &self,
        id: GameId,
        timeout: Duration,
    ) -> Result<LockToken, LockError> {
        let key = self.key_for(id);
        let holder = holder_identity();
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let ttl = self.ttl;
            let attempt_key = key.clone();
            let attempt_holder = holder.clone();
            let acquired = self
                .client
                .call(move |backend| backend.set_if_absent(attempt_key, attempt_holder, ttl))
                .await
                .map_err(LockError::BackendUnavailable)?;

            if acquired {
                debug!(game_id = id, holder = %holder, "lock acquired");
                return Ok(LockToken {
                    game_id: id,
                    key,
                    holder,
                    expires_at: Instant::now() + ttl,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                warn!(game_id = id, waited_ms = waited.as_millis() as u64, "lock acquisition timed out");
                return Err(LockError::Timeout { key, waited });
            }
            sleep(self.next_delay().min(deadline - now)).await;
        }
    }

    fn next_delay(&self) -> Duration {
        let max_jitter = self.retry_interval.as_millis() as u64 / 2;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::rng().random_range(0..=max_jitter)
        };
        self.retry_interval + Duration::from_millis(jitter)
    }

    /// Release `token`. Returns `false` when the record expired or belongs to someone else.
    pub async fn release(&self, token: LockToken) -> Result<bool, LockError> {
        let LockToken {
            game_id,
            key,
            holder,
            ..
        } = token;
        let released = self
            .client
            .call(move |backend| backend.compare_and_delete(key, holder))
            .await
            .map_err(LockError::BackendUnavailable)?;
        if !released {
            warn!(game_id, "lock expired before release; left untouched");
        }
        Ok(released)
    }
}

fn holder_identity() -> String {
    format!(
        "{}:{}:{}",
        std::process::id(),
        Uuid::new_v4(),
        unix_millis(OffsetDateTime::now_utc())
    )
}

/// Process-local per-game mutexes used while the lock backend is unavailable.
#[derive(Default)]
pub struct LocalLocks {
    locks: DashMap<GameId, Arc<Mutex<()>>>,
}

impl LocalLocks {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the local mutex of game `id`.
    pub async fn lock(&self, id: GameId) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        config::CircuitConfig,
        dao::cache::{CacheBackend, MemoryCacheBackend},
    };

    async fn lock_service(ttl_ms: u64) -> (Arc<DistributedLock>, MemoryCacheBackend) {
        let backend = MemoryCacheBackend::new();
        let client = ResilientClient::with_backend(
            "test",
            &CircuitConfig::default(),
            Arc::new(backend.clone()),
        )
        .await;
        let config = LockConfig {
            timeout_ms: 5_000,
            ttl_ms,
            retry_interval_ms: 10,
        };
        (Arc::new(DistributedLock::new(client, "button", &config)), backend)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquirers_are_serialized() {
        let (locks, _backend) = lock_service(10_000).await;
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let token = locks.acquire(1).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                assert!(locks.release(token).await.unwrap());
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_holder_cannot_release_a_reacquired_lock() {
        let (locks, backend) = lock_service(100).await;
        let first = locks.acquire(1).await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        let second = locks.acquire(1).await.unwrap();
        assert_ne!(first.holder(), second.holder());
        assert!(!locks.release(first).await.unwrap());
        assert_eq!(
            backend.get(locks.key_for(1)).await.unwrap().as_deref(),
            Some(second.holder())
        );
        assert!(locks.release(second).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn held_lock_times_out() {
        let (locks, _backend) = lock_service(10_000).await;
        let _held = locks.acquire(1).await.unwrap();
        let err = locks
            .acquire_with_timeout(1, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(locks.acquire(2).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_backend_is_distinct_from_timeout() {
        let (locks, backend) = lock_service(10_000).await;
        backend.set_available(false);
        let err = locks.acquire(1).await.unwrap_err();
        assert!(matches!(err, LockError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn local_locks_serialize_per_game() {
        let locks = LocalLocks::new();
        let guard = locks.lock(1).await;
        let other = tokio::time::timeout(Duration::from_millis(10), locks.lock(2)).await;
        assert!(other.is_ok());
        let same = tokio::time::timeout(Duration::from_millis(10), locks.lock(1)).await;
        assert!(same.is_err());
        drop(guard);
        assert!(tokio::time::timeout(Duration::from_millis(10), locks.lock(1)).await.is_ok());
    }
}
