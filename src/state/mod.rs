/// Game records and their flat field encoding.
pub mod game;
/// Pure timer and color band arithmetic.
pub mod timer;

use std::sync::Arc;

use crate::{
    config::{AppConfig, GameDefaults},
    dao::game_store::GameStore,
    services::{
        click_service::ClickCoordinator,
        lock_service::DistributedLock,
        resilient_client::ResilientClient,
        state_cache::StateCache,
        sync_worker::SyncWorker,
        write_queue::WriteQueue,
    },
};

pub type SharedState = Arc<AppState>;

/// Long-lived services shared by every request handler.
///
/// The hot path and the sync worker each own a cache client and a store handle so draining the
/// queue never competes with interactive requests for connections.
pub struct AppState {
    cache_client: Arc<ResilientClient>,
    state_cache: Arc<StateCache>,
    clicks: ClickCoordinator,
    worker: SyncWorker,
    game_defaults: GameDefaults,
}

/// Connections the application state is assembled from.
pub struct Backends {
    /// Cache client used by request handlers.
    pub cache_client: Arc<ResilientClient>,
    /// Cache client dedicated to the sync worker.
    pub worker_client: Arc<ResilientClient>,
    /// Store handle used by request handlers.
    pub store: Arc<dyn GameStore>,
    /// Store handle dedicated to the sync worker.
    pub worker_store: Arc<dyn GameStore>,
}

impl AppState {
    /// Wire every service over `backends`.
    pub fn new(config: &AppConfig, backends: Backends) -> SharedState {
        let Backends {
            cache_client,
            worker_client,
            store,
            worker_store,
        } = backends;

        let state_cache = Arc::new(StateCache::new(cache_client.clone(), store, &config.cache));
        let locks = Arc::new(DistributedLock::new(
            cache_client.clone(),
            &config.cache.key_prefix,
            &config.lock,
        ));
        let queue = Arc::new(WriteQueue::new(cache_client.clone(), &config.queue));
        let clicks = ClickCoordinator::new(state_cache.clone(), locks, queue);
        let worker = SyncWorker::new(worker_client, worker_store, &config.queue);

        Arc::new(Self {
            cache_client,
            state_cache,
            clicks,
            worker,
            game_defaults: config.game.clone(),
        })
    }

    /// Cache client of the hot path.
    pub fn cache_client(&self) -> &Arc<ResilientClient> {
        &self.cache_client
    }

    /// Per-game state cache.
    pub fn state_cache(&self) -> &Arc<StateCache> {
        &self.state_cache
    }

    /// Store handle of the hot path.
    pub fn store(&self) -> &Arc<dyn GameStore> {
        self.state_cache.store()
    }

    /// Click write path.
    pub fn clicks(&self) -> &ClickCoordinator {
        &self.clicks
    }

    /// Background queue consumer.
    pub fn worker(&self) -> &SyncWorker {
        &self.worker
    }

    /// Defaults for games created without explicit settings.
    pub fn game_defaults(&self) -> &GameDefaults {
        &self.game_defaults
    }
}
