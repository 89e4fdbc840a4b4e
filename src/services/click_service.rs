//! Serialized write path for clicks: lock the game, validate against the cached state, update
//! the cache optimistically, queue the durable write, release the lock.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::{
    dao::storage::StorageError,
    services::{
        lock_service::{DistributedLock, LocalLocks, LockError, LockToken},
        state_cache::{StateCache, StateSource},
        write_queue::WriteQueue,
    },
    state::{
        game::{ClickEvent, GameId, GameState, GameStateUpdate, UserId},
        timer::{self, ColorBand},
    },
};

/// Why a click was not accepted.
#[derive(Debug, Error)]
pub enum ClickError {
    /// No such game.
    #[error("game {0} not found")]
    GameNotFound(GameId),
    /// The game is over.
    #[error("game {0} has ended")]
    GameEnded(GameId),
    /// The player made the previous click too.
    #[error("the same player cannot click twice in a row")]
    ConsecutiveClick,
    /// The player clicked again before their cooldown elapsed.
    #[error("player is on cooldown for another {}s", .remaining.as_secs_f64().ceil())]
    OnCooldown {
        /// Time left before the player may click again.
        remaining: Duration,
    },
    /// The store copy says the timer ran out, but the cache that may hold newer clicks is down.
    #[error("cannot confirm that game {0} has ended while the cache is unreachable")]
    ExpiryUnconfirmed(GameId),
    /// Another writer held the game's lock for the whole wait.
    #[error("game is busy, try again")]
    Busy,
    /// The click could be neither queued nor written to the store.
    #[error("click could not be persisted")]
    NotPersisted(#[source] StorageError),
    /// The game state could not be read.
    #[error(transparent)]
    Store(#[from] StorageError),
}

impl ClickError {
    /// Whether retrying the same click later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClickError::Busy | ClickError::ExpiryUnconfirmed(_) | ClickError::NotPersisted(_) => {
                true
            }
            ClickError::Store(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Result of an accepted click.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickOutcome {
    /// Game clicked.
    pub game_id: GameId,
    /// When the click landed.
    pub clicked_at: OffsetDateTime,
    /// Seconds that were left when the click reset the timer.
    pub timer_value: f64,
    /// Band the timer was in when clicked.
    pub band: ColorBand,
    /// Clicks so far, this one included.
    pub total_clicks: u64,
    /// Distinct players so far.
    pub unique_clickers: u64,
    /// `false` when the write-behind log was down and the click went straight to the store.
    pub queued: bool,
}

enum WriteGuard {
    Distributed(LockToken),
    Local(OwnedMutexGuard<()>),
}

/// Coordinates concurrent clicks on the same game.
pub struct ClickCoordinator {
    cache: Arc<StateCache>,
    locks: Arc<DistributedLock>,
    local_locks: LocalLocks,
    queue: Arc<WriteQueue>,
}

impl ClickCoordinator {
    /// Coordinator over the shared cache, lock service and queue.
    pub fn new(cache: Arc<StateCache>, locks: Arc<DistributedLock>, queue: Arc<WriteQueue>) -> Self {
        Self {
            cache,
            locks,
            local_locks: LocalLocks::new(),
            queue,
        }
    }

    /// Register a click by `user_id` on `game_id` now.
    pub async fn click(
        &self,
        game_id: GameId,
        user_id: UserId,
        user_name: &str,
    ) -> Result<ClickOutcome, ClickError> {
        self.click_at(game_id, user_id, user_name, OffsetDateTime::now_utc())
            .await
    }

    /// Register a click landing at `now`.
    pub async fn click_at(
        &self,
        game_id: GameId,
        user_id: UserId,
        user_name: &str,
        now: OffsetDateTime,
    ) -> Result<ClickOutcome, ClickError> {
        let guard = self.lock(game_id).await?;
        let result = self.click_locked(game_id, user_id, user_name, now).await;
        self.unlock(guard).await;
        result
    }

    /// Mark `game_id` as ended and drop its cache entry, serialized with clicks on the same game.
    /// Returns `false` when the game does not exist.
    pub async fn end_game(&self, game_id: GameId) -> Result<bool, ClickError> {
        let guard = self.lock(game_id).await?;
        let result = self.cache.store().end_game(game_id).await;
        if matches!(result, Ok(true)) {
            self.cache.invalidate(game_id).await;
        }
        self.unlock(guard).await;
        Ok(result?)
    }

    async fn lock(&self, game_id: GameId) -> Result<WriteGuard, ClickError> {
        match self.locks.acquire(game_id).await {
            Ok(token) => Ok(WriteGuard::Distributed(token)),
            Err(LockError::Timeout { .. }) => Err(ClickError::Busy),
            Err(LockError::BackendUnavailable(err)) => {
                warn!(game_id, error = %err, "lock backend unavailable; using process-local lock");
                Ok(WriteGuard::Local(self.local_locks.lock(game_id).await))
            }
        }
    }

    async fn unlock(&self, guard: WriteGuard) {
        match guard {
            WriteGuard::Distributed(token) => {
                if let Err(err) = self.locks.release(token).await {
                    warn!(error = %err, "failed to release lock; it will expire");
                }
            }
            WriteGuard::Local(guard) => drop(guard),
        }
    }

    async fn click_locked(
        &self,
        game_id: GameId,
        user_id: UserId,
        user_name: &str,
        now: OffsetDateTime,
    ) -> Result<ClickOutcome, ClickError> {
        let Some((state, source)) = self.cache.load_state(game_id).await? else {
            return Err(ClickError::GameNotFound(game_id));
        };
        if !state.is_active {
            return Err(ClickError::GameEnded(game_id));
        }

        let status = state.timer_at(now);
        if status.expired && source == StateSource::StoreFallback {
            warn!(game_id, "store copy looks expired while the cache is down; not ending game");
            return Err(ClickError::ExpiryUnconfirmed(game_id));
        }
        if status.expired {
            info!(game_id, "timer ran out; ending game");
            if let Err(err) = self.cache.store().end_game(game_id).await {
                warn!(game_id, error = %err, "failed to mark expired game as ended");
            }
            self.cache.invalidate(game_id).await;
            return Err(ClickError::GameEnded(game_id));
        }

        if state.last_clicker_id == Some(user_id) {
            return Err(ClickError::ConsecutiveClick);
        }
        if let Some(remaining) = self.cooldown_left(&state, user_id, now).await {
            return Err(ClickError::OnCooldown { remaining });
        }

        let new_clicker = self.is_new_clicker(game_id, user_id).await;
        let update = GameStateUpdate {
            last_click_at: Some(now),
            total_clicks: Some(state.total_clicks + 1),
            unique_clickers: Some(state.unique_clickers + u64::from(new_clicker)),
            last_clicker_id: Some(user_id),
            last_clicker_name: Some(user_name.to_owned()),
            is_active: None,
        };
        if let Err(err) = self.cache.update_state(game_id, &update).await {
            warn!(game_id, error = %err, "optimistic cache update failed");
        }
        if let Err(err) = self
            .cache
            .remember_click(game_id, user_id, now, state.cooldown)
            .await
        {
            debug!(game_id, user_id, error = %err, "cooldown not cached");
        }

        let event = ClickEvent {
            game_id,
            user_id,
            user_name: user_name.to_owned(),
            clicked_at: now,
            timer_value: status.remaining,
        };
        let queued = self.persist(event).await?;

        let band = timer::band_for(status.remaining, state.timer_duration);
        let mut next = state;
        next.apply(&update);
        Ok(ClickOutcome {
            game_id,
            clicked_at: now,
            timer_value: status.remaining,
            band,
            total_clicks: next.total_clicks,
            unique_clickers: next.unique_clickers,
            queued,
        })
    }

    async fn persist(&self, event: ClickEvent) -> Result<bool, ClickError> {
        let err = match self.queue.enqueue(&event).await {
            Ok(_) => return Ok(true),
            Err(err) => err,
        };
        warn!(game_id = event.game_id, error = %err, "write queue unavailable; writing click directly");

        let (game_id, user_id) = (event.game_id, event.user_id);
        match self.cache.store().insert_click(event).await {
            Ok(_) => Ok(false),
            Err(err) => {
                error!(game_id, user_id, error = %err, "click lost: queue and store both failed");
                self.cache.invalidate(game_id).await;
                self.cache.forget_click(game_id, user_id).await;
                Err(ClickError::NotPersisted(err))
            }
        }
    }

    async fn cooldown_left(
        &self,
        state: &GameState,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> Option<Duration> {
        if state.cooldown.is_zero() {
            return None;
        }
        let last = match self.cache.recent_click(state.game_id, user_id).await {
            Ok(last) => last,
            Err(err) => {
                debug!(game_id = state.game_id, error = %err, "cooldown cache unavailable; asking the store");
                match self.cache.store().last_click_by(state.game_id, user_id).await {
                    Ok(last) => last,
                    Err(err) => {
                        warn!(game_id = state.game_id, error = %err, "cooldown unknown; allowing click");
                        None
                    }
                }
            }
        }?;

        let elapsed = (now - last).as_seconds_f64().max(0.0);
        let left = state.cooldown.as_secs_f64() - elapsed;
        (left > 0.0).then(|| Duration::from_secs_f64(left))
    }

    async fn is_new_clicker(&self, game_id: GameId, user_id: UserId) -> bool {
        let unseen = match self.cache.note_clicker(game_id, user_id).await {
            Ok(false) => return false,
            Ok(true) => true,
            Err(err) => {
                debug!(game_id, error = %err, "clicker set unavailable; asking the store");
                false
            }
        };
        match self.cache.store().last_click_by(game_id, user_id).await {
            Ok(last) => last.is_none(),
            Err(err) => {
                warn!(game_id, error = %err, "cannot confirm clicker against the store");
                unseen
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{CacheConfig, CircuitConfig, LockConfig, QueueConfig},
        dao::{
            cache::{CacheBackend, MemoryCacheBackend},
            game_store::{GameStore, MemoryGameStore},
            models::GameRecord,
        },
        services::resilient_client::ResilientClient,
    };

    struct Fixture {
        clicks: ClickCoordinator,
        cache: Arc<StateCache>,
        locks: Arc<DistributedLock>,
        backend: MemoryCacheBackend,
        queue_backend: MemoryCacheBackend,
        store: MemoryGameStore,
    }

    async fn fixture() -> Fixture {
        let backend = MemoryCacheBackend::new();
        let queue_backend = MemoryCacheBackend::new();
        let store = MemoryGameStore::new();
        let circuit = CircuitConfig::default();
        let client = ResilientClient::with_backend("hot", &circuit, Arc::new(backend.clone())).await;
        let queue_client =
            ResilientClient::with_backend("queue", &circuit, Arc::new(queue_backend.clone())).await;

        let cache = Arc::new(StateCache::new(
            client.clone(),
            Arc::new(store.clone()),
            &CacheConfig::default(),
        ));
        let lock_config = LockConfig {
            timeout_ms: 200,
            ..LockConfig::default()
        };
        let locks = Arc::new(DistributedLock::new(client, "button", &lock_config));
        let queue = Arc::new(WriteQueue::new(queue_client, &QueueConfig::default()));

        store
            .save_game(GameRecord {
                game_id: 1,
                timer_duration: Duration::from_secs(600),
                cooldown: Duration::from_secs(60),
                is_active: true,
                created_at: at(0),
            })
            .await
            .unwrap();

        Fixture {
            clicks: ClickCoordinator::new(cache.clone(), locks.clone(), queue),
            cache,
            locks,
            backend,
            queue_backend,
            store,
        }
    }

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    #[tokio::test]
    async fn first_click_updates_cache_and_queues_event() {
        let fx = fixture().await;
        let outcome = fx.clicks.click_at(1, 10, "Ada", at(1_000)).await.unwrap();
        assert!(outcome.queued);
        assert_eq!(outcome.total_clicks, 1);
        assert_eq!(outcome.unique_clickers, 1);
        assert_eq!(outcome.timer_value, 600.0);
        assert_eq!(outcome.band, ColorBand::Purple);

        let state = fx.cache.get_state(1).await.unwrap().unwrap();
        assert_eq!(state.last_clicker_id, Some(10));
        assert_eq!(state.last_click_at, Some(at(1_000)));
        assert_eq!(fx.queue_backend.stream_len("button:clicks"), 1);
        assert!(fx.backend.get(fx.locks.key_for(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_player_cannot_click_twice_in_a_row() {
        let fx = fixture().await;
        fx.clicks.click_at(1, 10, "Ada", at(1_000)).await.unwrap();
        let err = fx.clicks.click_at(1, 10, "Ada", at(1_100)).await.unwrap_err();
        assert!(matches!(err, ClickError::ConsecutiveClick));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn cooldown_blocks_an_early_return() {
        let fx = fixture().await;
        fx.clicks.click_at(1, 10, "Ada", at(1_000)).await.unwrap();
        fx.clicks.click_at(1, 11, "Bo", at(1_010)).await.unwrap();

        let err = fx.clicks.click_at(1, 10, "Ada", at(1_020)).await.unwrap_err();
        match err {
            ClickError::OnCooldown { remaining } => assert_eq!(remaining, Duration::from_secs(40)),
            other => panic!("unexpected error: {other:?}"),
        }

        let outcome = fx.clicks.click_at(1, 10, "Ada", at(1_061)).await.unwrap();
        assert_eq!(outcome.total_clicks, 3);
        assert_eq!(outcome.unique_clickers, 2);
    }

    #[tokio::test]
    async fn expired_timer_ends_the_game() {
        let fx = fixture().await;
        fx.clicks.click_at(1, 10, "Ada", at(1_000)).await.unwrap();
        let err = fx.clicks.click_at(1, 11, "Bo", at(1_600)).await.unwrap_err();
        assert!(matches!(err, ClickError::GameEnded(1)));

        assert!(fx.backend.hash_get_all("button:game:1".into()).await.unwrap().is_empty());
        assert_eq!(fx.store.list_active_game_ids().await.unwrap(), Vec::<GameId>::new());
        let err = fx.clicks.click_at(1, 12, "Cy", at(1_601)).await.unwrap_err();
        assert!(matches!(err, ClickError::GameEnded(1)));
    }

    #[tokio::test]
    async fn unknown_game_is_rejected() {
        let fx = fixture().await;
        let err = fx.clicks.click_at(9, 10, "Ada", at(1_000)).await.unwrap_err();
        assert!(matches!(err, ClickError::GameNotFound(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn held_lock_reports_busy() {
        let fx = fixture().await;
        let _held = fx.locks.acquire(1).await.unwrap();
        let err = fx.clicks.click_at(1, 10, "Ada", at(1_000)).await.unwrap_err();
        assert!(matches!(err, ClickError::Busy));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn queue_outage_writes_straight_to_the_store() {
        let fx = fixture().await;
        fx.queue_backend.set_available(false);
        let outcome = fx.clicks.click_at(1, 10, "Ada", at(1_000)).await.unwrap();
        assert!(!outcome.queued);
        assert_eq!(fx.store.click_count(1), 1);
    }

    #[tokio::test]
    async fn cache_outage_uses_local_lock_and_store() {
        let fx = fixture().await;
        fx.backend.set_available(false);
        fx.queue_backend.set_available(false);
        let outcome = fx.clicks.click_at(1, 10, "Ada", at(1_000)).await.unwrap();
        assert!(!outcome.queued);
        assert_eq!(fx.store.click_count(1), 1);

        let err = fx.clicks.click_at(1, 10, "Ada", at(1_001)).await.unwrap_err();
        assert!(matches!(err, ClickError::ConsecutiveClick));
    }

    #[tokio::test]
    async fn unpersisted_click_is_undone() {
        let fx = fixture().await;
        fx.cache.get_state(1).await.unwrap();
        fx.queue_backend.set_available(false);
        fx.store.set_offline(true);

        let err = fx.clicks.click_at(1, 10, "Ada", at(1_000)).await.unwrap_err();
        assert!(matches!(err, ClickError::NotPersisted(_)));
        assert!(err.is_transient());
        assert!(fx.backend.hash_get_all("button:game:1".into()).await.unwrap().is_empty());
        assert_eq!(fx.cache.recent_click(1, 10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_store_copy_does_not_end_a_live_game() {
        let fx = fixture().await;
        fx.queue_backend.set_available(false);
        fx.clicks.click_at(1, 10, "Ada", at(100)).await.unwrap();
        fx.queue_backend.set_available(true);
        let queued = fx.clicks.click_at(1, 11, "Bo", at(600)).await.unwrap();
        assert!(queued.queued);

        fx.backend.set_available(false);
        let err = fx.clicks.click_at(1, 12, "Cy", at(800)).await.unwrap_err();
        assert!(matches!(err, ClickError::ExpiryUnconfirmed(1)));
        assert!(err.is_transient());
        assert_eq!(fx.store.list_active_game_ids().await.unwrap(), vec![1]);

        fx.backend.set_available(true);
        let outcome = fx.clicks.click_at(1, 13, "Di", at(900)).await.unwrap();
        assert_eq!(outcome.timer_value, 300.0);
        assert_eq!(outcome.total_clicks, 3);
    }

    #[tokio::test]
    async fn ending_a_game_drops_its_cache_entry() {
        let fx = fixture().await;
        fx.clicks.click_at(1, 10, "Ada", at(1_000)).await.unwrap();
        assert!(fx.clicks.end_game(1).await.unwrap());
        assert!(fx.backend.hash_get_all("button:game:1".into()).await.unwrap().is_empty());
        assert!(fx.backend.get(fx.locks.key_for(1)).await.unwrap().is_none());

        let err = fx.clicks.click_at(1, 11, "Bo", at(1_010)).await.unwrap_err();
        assert!(matches!(err, ClickError::GameEnded(1)));
        assert!(!fx.clicks.end_game(9).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn ending_waits_for_the_game_lock() {
        let fx = fixture().await;
        fx.clicks.click_at(1, 10, "Ada", at(1_000)).await.unwrap();
        let held = fx.locks.acquire(1).await.unwrap();

        let err = fx.clicks.end_game(1).await.unwrap_err();
        assert!(matches!(err, ClickError::Busy));
        assert_eq!(fx.store.list_active_game_ids().await.unwrap(), vec![1]);
        assert!(!fx.backend.hash_get_all("button:game:1".into()).await.unwrap().is_empty());

        fx.locks.release(held).await.unwrap();
        assert!(fx.clicks.end_game(1).await.unwrap());
    }
}
