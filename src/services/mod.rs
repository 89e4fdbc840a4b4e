/// Supervisor connecting and health-checking the cache backend.
pub mod cache_supervisor;
/// Coordinated click write path.
pub mod click_service;
/// OpenAPI documentation generation.
pub mod documentation;
/// Game lifecycle operations used by the HTTP routes.
pub mod game_service;
/// Health check service.
pub mod health_service;
/// Per-game distributed lock.
pub mod lock_service;
/// Circuit-breaker guarded cache client.
pub mod resilient_client;
/// Cache-aside per-game state.
pub mod state_cache;
/// Background consumer of the write-behind queue.
pub mod sync_worker;
/// Producer side of the write-behind queue.
pub mod write_queue;
