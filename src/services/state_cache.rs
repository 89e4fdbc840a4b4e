//! Cache-aside access to per-game state: reads fall back to the persistent store and refill the
//! cache, writes merge fields and refresh the TTL.

use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    config::CacheConfig,
    dao::{
        game_store::GameStore,
        storage::{StorageError, StorageResult},
    },
    services::resilient_client::{BackendError, ResilientClient},
    state::{
        game::{GameId, GameState, GameStateUpdate, UserId, from_unix_millis, unix_millis},
        timer::TimerStatus,
    },
};

/// Where [`StateCache::load_state`] found a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
    /// Read from the cache.
    Cache,
    /// Not cached; loaded from the store and written back.
    StoreOnMiss,
    /// Cache unreachable; read from the store, which may lag behind queued clicks.
    StoreFallback,
}

enum CacheRead {
    Hit(GameState),
    Miss,
    Failed,
}

/// Per-game state cache in front of the persistent store.
pub struct StateCache {
    client: Arc<ResilientClient>,
    store: Arc<dyn GameStore>,
    ttl: Duration,
    prefix: String,
}

impl StateCache {
    /// Build the cache over `client` with `store` as source of truth.
    pub fn new(client: Arc<ResilientClient>, store: Arc<dyn GameStore>, config: &CacheConfig) -> Self {
        Self {
            client,
            store,
            ttl: config.ttl(),
            prefix: config.key_prefix.clone(),
        }
    }

    /// Persistent store behind the cache.
    pub fn store(&self) -> &Arc<dyn GameStore> {
        &self.store
    }

    /// Resilient client the cache talks through.
    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }

    /// Prefix shared by every key.
    pub fn key_prefix(&self) -> &str {
        &self.prefix
    }

    fn game_key(&self, id: GameId) -> String {
        format!("{}:game:{id}", self.prefix)
    }

    fn clickers_key(&self, id: GameId) -> String {
        format!("{}:clickers:{id}", self.prefix)
    }

    fn cooldown_key(&self, game_id: GameId, user_id: UserId) -> String {
        format!("{}:cooldown:{game_id}:{user_id}", self.prefix)
    }

    async fn read_cached(&self, id: GameId) -> CacheRead {
        let key = self.game_key(id);
        let fields = match self
            .client
            .call({
                let key = key.clone();
                move |backend| backend.hash_get_all(key)
            })
            .await
        {
            Ok(fields) => fields,
            Err(err) => {
                debug!(game_id = id, error = %err, "cache read failed");
                return CacheRead::Failed;
            }
        };
        if fields.is_empty() {
            return CacheRead::Miss;
        }

        match GameState::from_fields(id, &fields) {
            Ok(state) => CacheRead::Hit(state),
            Err(err) => {
                warn!(game_id = id, error = %err, "dropping malformed cache entry");
                self.client
                    .execute_with_fallback(move |backend| backend.delete(key), false)
                    .await;
                CacheRead::Miss
            }
        }
    }

    async fn fill_from_store(&self, id: GameId) -> StorageResult<Option<(GameState, bool)>> {
        let Some(state) = self.store.load_game_state(id).await? else {
            return Ok(None);
        };
        let cached = self.cache_state(&state).await;
        Ok(Some((state, cached)))
    }

    /// State of game `id`: from the cache, or loaded from the store and cached on a miss.
    pub async fn get_state(&self, id: GameId) -> StorageResult<Option<GameState>> {
        Ok(self.load_state(id).await?.map(|(state, _)| state))
    }

    /// Like [`StateCache::get_state`], also telling where the state came from.
    ///
    /// While the cache is unreachable the store is read directly. Clicks that are still queued
    /// are missing from that copy, so it may show an older last click than the cache did.
    pub async fn load_state(&self, id: GameId) -> StorageResult<Option<(GameState, StateSource)>> {
        match self.read_cached(id).await {
            CacheRead::Hit(state) => Ok(Some((state, StateSource::Cache))),
            CacheRead::Miss => Ok(self
                .fill_from_store(id)
                .await?
                .map(|(state, _)| (state, StateSource::StoreOnMiss))),
            CacheRead::Failed => Ok(self
                .store
                .load_game_state(id)
                .await?
                .map(|state| (state, StateSource::StoreFallback))),
        }
    }

    /// Write every field of `state` with a fresh TTL. Returns whether the cache accepted it.
    pub async fn cache_state(&self, state: &GameState) -> bool {
        let key = self.game_key(state.game_id);
        let fields = state.to_fields();
        let ttl = self.ttl;
        match self
            .client
            .call(move |backend| backend.hash_set(key, fields, ttl))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                debug!(game_id = state.game_id, error = %err, "skipping cache fill");
                false
            }
        }
    }

    /// Merge `update` into the cached entry and refresh its TTL without reading it first.
    ///
    /// An update landing on an evicted entry leaves a partial hash; the next read rejects it and
    /// reloads from the store.
    pub async fn update_state(
        &self,
        id: GameId,
        update: &GameStateUpdate,
    ) -> Result<(), BackendError> {
        let key = self.game_key(id);
        let fields = update.to_fields();
        let ttl = self.ttl;
        self.client
            .call(move |backend| backend.hash_set(key, fields, ttl))
            .await
    }

    /// Timer status of game `id` right now. `None` when the game does not exist.
    pub async fn calculate_timer(&self, id: GameId) -> StorageResult<Option<TimerStatus>> {
        self.calculate_timer_at(id, OffsetDateTime::now_utc()).await
    }

    /// Timer status of game `id` at `now`. Computed from the store alone while the cache is down.
    pub async fn calculate_timer_at(
        &self,
        id: GameId,
        now: OffsetDateTime,
    ) -> StorageResult<Option<TimerStatus>> {
        match self.read_cached(id).await {
            CacheRead::Hit(state) => Ok(Some(state.timer_at(now))),
            CacheRead::Miss => Ok(self
                .fill_from_store(id)
                .await?
                .map(|(state, _)| state.timer_at(now))),
            CacheRead::Failed => {
                warn!(game_id = id, "cache unreachable; computing timer from the store only");
                self.store_only_timer(id, now).await
            }
        }
    }

    /// Timer status computed from the persistent store alone, bypassing the cache.
    pub async fn store_only_timer(
        &self,
        id: GameId,
        now: OffsetDateTime,
    ) -> StorageResult<Option<TimerStatus>> {
        let state = self.store.load_game_state(id).await?;
        Ok(state.map(|state| state.timer_at(now)))
    }

    /// Drop the cached entry of game `id` and its clicker set. Deleting twice is harmless.
    pub async fn invalidate(&self, id: GameId) {
        let key = self.game_key(id);
        let clickers = self.clickers_key(id);
        let removed = self
            .client
            .execute_with_fallback(move |backend| backend.delete(key), false)
            .await;
        self.client
            .execute_with_fallback(move |backend| backend.delete(clickers), false)
            .await;
        debug!(game_id = id, removed, "cache entry invalidated");
    }

    /// Load every active game into the cache. Returns how many entries the cache now holds.
    ///
    /// Entries already cached are kept as they are; they may carry clicks the store has not seen.
    pub async fn warm_cache(&self) -> StorageResult<usize> {
        let ids = self.store.list_active_game_ids().await?;
        let mut warmed = 0;
        for id in &ids {
            match self.read_cached(*id).await {
                CacheRead::Hit(_) => warmed += 1,
                CacheRead::Failed => warn!(game_id = id, "cache unreachable; entry not warmed"),
                CacheRead::Miss => match self.fill_from_store(*id).await {
                    Ok(Some((_, true))) => warmed += 1,
                    Ok(Some((_, false))) => warn!(game_id = id, "cache refused entry while warming"),
                    Ok(None) => debug!(game_id = id, "active game vanished while warming"),
                    Err(err) => warn!(game_id = id, error = %err, "failed to warm cache entry"),
                },
            }
        }
        info!(warmed, active = ids.len(), "cache warmed");
        Ok(warmed)
    }

    /// Time of the last click of `user_id` in `game_id` still within the cooldown window.
    pub async fn recent_click(
        &self,
        game_id: GameId,
        user_id: UserId,
    ) -> Result<Option<OffsetDateTime>, BackendError> {
        let key = self.cooldown_key(game_id, user_id);
        let raw = self.client.call(move |backend| backend.get(key)).await?;
        Ok(raw
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(from_unix_millis))
    }

    /// Start the cooldown window of `user_id`, expiring after `cooldown`.
    pub async fn remember_click(
        &self,
        game_id: GameId,
        user_id: UserId,
        at: OffsetDateTime,
        cooldown: Duration,
    ) -> Result<(), BackendError> {
        if cooldown.is_zero() {
            return Ok(());
        }
        let key = self.cooldown_key(game_id, user_id);
        let value = unix_millis(at).to_string();
        self.client
            .call(move |backend| backend.set_with_ttl(key, value, cooldown))
            .await
    }

    /// Clear the cooldown window of `user_id`.
    pub async fn forget_click(&self, game_id: GameId, user_id: UserId) {
        let key = self.cooldown_key(game_id, user_id);
        self.client
            .execute_with_fallback(move |backend| backend.delete(key), false)
            .await;
    }

    /// Record `user_id` as a clicker of `game_id`. Returns whether the cache had not seen them.
    pub async fn note_clicker(&self, game_id: GameId, user_id: UserId) -> Result<bool, BackendError> {
        let key = self.clickers_key(game_id);
        let ttl = self.ttl;
        self.client
            .call(move |backend| backend.add_member(key, user_id.to_string(), ttl))
            .await
    }
}

impl From<BackendError> for StorageError {
    fn from(err: BackendError) -> Self {
        StorageError::unavailable("cache access", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CircuitConfig,
        dao::{
            cache::{CacheBackend, CacheError, MemoryCacheBackend},
            game_store::MemoryGameStore,
            models::GameRecord,
        },
        services::cache_supervisor,
        state::game::ClickEvent,
    };

    struct Fixture {
        cache: StateCache,
        backend: MemoryCacheBackend,
        store: MemoryGameStore,
    }

    async fn fixture() -> Fixture {
        let backend = MemoryCacheBackend::new();
        let store = MemoryGameStore::new();
        let client = ResilientClient::with_backend(
            "test",
            &CircuitConfig::default(),
            Arc::new(backend.clone()),
        )
        .await;
        let cache = StateCache::new(client, Arc::new(store.clone()), &CacheConfig::default());
        Fixture {
            cache,
            backend,
            store,
        }
    }

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    async fn seed(store: &MemoryGameStore, id: GameId, duration_secs: u64) {
        store
            .save_game(GameRecord {
                game_id: id,
                timer_duration: Duration::from_secs(duration_secs),
                cooldown: Duration::from_secs(60),
                is_active: true,
                created_at: at(0),
            })
            .await
            .unwrap();
    }

    fn sample_state(id: GameId) -> GameState {
        let mut state = GameState::new(id, Duration::from_secs(43_200), Duration::from_secs(60));
        state.last_click_at = Some(at(1_700_000_000) + time::Duration::nanoseconds(123_456_789));
        state.total_clicks = 7;
        state.unique_clickers = 3;
        state.last_clicker_id = Some(42);
        state.last_clicker_name = Some("Ada".into());
        state
    }

    #[tokio::test]
    async fn cached_state_round_trips() {
        let fx = fixture().await;
        let state = sample_state(1);
        assert!(fx.cache.cache_state(&state).await);
        assert_eq!(fx.cache.get_state(1).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn miss_loads_from_store_and_fills_cache() {
        let fx = fixture().await;
        seed(&fx.store, 5, 600).await;

        let state = fx.cache.get_state(5).await.unwrap().unwrap();
        assert_eq!(state.timer_duration, Duration::from_secs(600));
        let cached = fx.backend.hash_get_all("button:game:5".into()).await.unwrap();
        assert!(!cached.is_empty());

        fx.store.set_offline(true);
        assert_eq!(fx.cache.get_state(5).await.unwrap(), Some(state));
        assert!(fx.cache.get_state(6).await.is_err());
    }

    #[tokio::test]
    async fn unknown_game_is_none() {
        let fx = fixture().await;
        assert_eq!(fx.cache.get_state(99).await.unwrap(), None);
        assert_eq!(fx.cache.calculate_timer(99).await.unwrap(), None);
    }

    #[tokio::test]
    async fn backend_outage_falls_back_to_store() {
        let fx = fixture().await;
        seed(&fx.store, 2, 600).await;
        fx.backend.set_available(false);
        let state = fx.cache.get_state(2).await.unwrap().unwrap();
        assert_eq!(state.game_id, 2);
        assert!(!fx.cache.cache_state(&state).await);
    }

    #[tokio::test]
    async fn malformed_entry_is_dropped_and_reloaded() {
        let fx = fixture().await;
        seed(&fx.store, 3, 600).await;
        fx.backend
            .hash_set(
                "button:game:3".into(),
                vec![("mystery".into(), "1".into())],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let state = fx.cache.get_state(3).await.unwrap().unwrap();
        assert_eq!(state.timer_duration, Duration::from_secs(600));
        let cached = fx.backend.hash_get_all("button:game:3".into()).await.unwrap();
        assert!(!cached.contains_key("mystery"));
    }

    #[tokio::test]
    async fn update_merges_fields_without_a_read() {
        let fx = fixture().await;
        let state = GameState::new(4, Duration::from_secs(100), Duration::from_secs(5));
        fx.cache.cache_state(&state).await;

        let update = GameStateUpdate {
            last_click_at: Some(at(1_000)),
            total_clicks: Some(1),
            unique_clickers: Some(1),
            last_clicker_id: Some(9),
            last_clicker_name: Some("Bo".into()),
            ..GameStateUpdate::default()
        };
        fx.cache.update_state(4, &update).await.unwrap();

        let mut expected = state;
        expected.apply(&update);
        assert_eq!(fx.cache.get_state(4).await.unwrap(), Some(expected));
    }

    #[tokio::test]
    async fn half_elapsed_timer_reports_half_remaining() {
        let fx = fixture().await;
        let mut state = GameState::new(7, Duration::from_secs(43_200), Duration::ZERO);
        state.last_click_at = Some(at(1_700_000_000 - 21_600));
        fx.cache.cache_state(&state).await;

        let status = fx
            .cache
            .calculate_timer_at(7, at(1_700_000_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.remaining, 21_600.0);
        assert!(!status.expired);
    }

    #[tokio::test]
    async fn store_only_timer_ignores_the_cache() {
        let fx = fixture().await;
        seed(&fx.store, 8, 100).await;
        fx.store
            .insert_click(ClickEvent {
                game_id: 8,
                user_id: 1,
                user_name: "Cy".into(),
                clicked_at: at(1_000),
                timer_value: 100.0,
            })
            .await
            .unwrap();
        let status = fx.cache.store_only_timer(8, at(1_100)).await.unwrap().unwrap();
        assert!(status.expired);
    }

    #[tokio::test]
    async fn invalidate_twice_is_a_no_op() {
        let fx = fixture().await;
        fx.cache.cache_state(&sample_state(1)).await;
        fx.cache.invalidate(1).await;
        fx.cache.invalidate(1).await;
        assert!(fx.backend.hash_get_all("button:game:1".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn warm_cache_skips_failing_entries() {
        let fx = fixture().await;
        seed(&fx.store, 1, 100).await;
        seed(&fx.store, 2, 100).await;
        fx.store.end_game(2).await.unwrap();
        seed(&fx.store, 3, 100).await;
        seed(&fx.store, 4, 100).await;
        fx.store.mark_corrupt(4);

        assert_eq!(fx.cache.warm_cache().await.unwrap(), 2);
        assert!(!fx.backend.hash_get_all("button:game:3".into()).await.unwrap().is_empty());
        assert!(fx.backend.hash_get_all("button:game:2".into()).await.unwrap().is_empty());
        assert!(fx.backend.hash_get_all("button:game:4".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn warm_cache_keeps_newer_cached_entries() {
        let fx = fixture().await;
        seed(&fx.store, 1, 100).await;
        let mut cached = fx.store.load_game_state(1).await.unwrap().unwrap();
        cached.total_clicks = 9;
        fx.cache.cache_state(&cached).await;

        assert_eq!(fx.cache.warm_cache().await.unwrap(), 1);
        assert_eq!(fx.cache.get_state(1).await.unwrap().unwrap().total_clicks, 9);
    }

    #[tokio::test]
    async fn warm_cache_counts_nothing_without_a_backend() {
        let fx = fixture().await;
        seed(&fx.store, 1, 100).await;
        fx.backend.set_available(false);
        assert_eq!(fx.cache.warm_cache().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn warm_cache_after_slow_cache_connect() {
        let store = MemoryGameStore::new();
        seed(&store, 1, 100).await;
        seed(&store, 2, 100).await;
        let backend = MemoryCacheBackend::new();
        let client = ResilientClient::new("test", &CircuitConfig::default());
        let connect = {
            let backend = backend.clone();
            move || {
                let backend = backend.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok::<Arc<dyn CacheBackend>, CacheError>(Arc::new(backend))
                }
            }
        };
        client.attach_supervisor(tokio::spawn(cache_supervisor::run(client.clone(), connect)));
        let cache = StateCache::new(client.clone(), Arc::new(store), &CacheConfig::default());

        assert_eq!(cache.warm_cache().await.unwrap(), 0);
        assert!(client.wait_until_ready(Duration::from_secs(10)).await);
        assert_eq!(cache.warm_cache().await.unwrap(), 2);
        assert!(!backend.hash_get_all("button:game:2".into()).await.unwrap().is_empty());
        client.close().await;
    }

    #[tokio::test]
    async fn load_state_reports_where_state_came_from() {
        let fx = fixture().await;
        seed(&fx.store, 1, 100).await;
        assert_eq!(fx.cache.load_state(1).await.unwrap().unwrap().1, StateSource::StoreOnMiss);
        assert_eq!(fx.cache.load_state(1).await.unwrap().unwrap().1, StateSource::Cache);
        fx.backend.set_available(false);
        assert_eq!(fx.cache.load_state(1).await.unwrap().unwrap().1, StateSource::StoreFallback);
    }

    #[tokio::test]
    async fn timer_is_computed_from_store_while_cache_is_down() {
        let fx = fixture().await;
        seed(&fx.store, 8, 100).await;
        fx.store
            .insert_click(ClickEvent {
                game_id: 8,
                user_id: 1,
                user_name: "Cy".into(),
                clicked_at: at(1_000),
                timer_value: 100.0,
            })
            .await
            .unwrap();
        fx.backend.set_available(false);

        let status = fx.cache.calculate_timer_at(8, at(1_040)).await.unwrap().unwrap();
        assert_eq!(status.remaining, 60.0);

        fx.store.set_offline(true);
        assert!(fx.cache.calculate_timer_at(8, at(1_040)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_window_expires() {
        let fx = fixture().await;
        fx.cache
            .remember_click(1, 2, at(5_000), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(fx.cache.recent_click(1, 2).await.unwrap(), Some(at(5_000)));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(fx.cache.recent_click(1, 2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn clickers_are_noted_once() {
        let fx = fixture().await;
        assert!(fx.cache.note_clicker(1, 2).await.unwrap());
        assert!(!fx.cache.note_clicker(1, 2).await.unwrap());
    }
}
