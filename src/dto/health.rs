use serde::Serialize;
use utoipa::ToSchema;

use crate::services::resilient_client::CircuitState;

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Breaker position of the hot-path cache client.
    pub cache_circuit: CircuitState,
    /// Whether the persistent store answered its ping.
    pub store_reachable: bool,
    /// Whether the sync worker loop is running.
    pub sync_worker_running: bool,
}

impl HealthResponse {
    /// Build a response, deriving the status from the individual checks.
    pub fn new(
        cache_degraded: bool,
        cache_circuit: CircuitState,
        store_reachable: bool,
        sync_worker_running: bool,
    ) -> Self {
        let healthy = !cache_degraded && cache_circuit == CircuitState::Closed && store_reachable;
        Self {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            cache_circuit,
            store_reachable,
            sync_worker_running,
        }
    }
}
