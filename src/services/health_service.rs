use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Report cache, store and worker health while logging connectivity issues.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let store_reachable = match state.store().health_check().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "storage health check failed");
            false
        }
    };

    let client = state.cache_client();
    if client.is_degraded() {
        warn!("cache unavailable (degraded mode)");
    }

    HealthResponse::new(
        client.is_degraded(),
        client.circuit_state(),
        store_reachable,
        state.worker().is_running(),
    )
}
