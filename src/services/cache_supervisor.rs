use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    dao::cache::{CacheBackend, CacheError},
    services::resilient_client::ResilientClient,
};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_FAILED_PINGS: u32 = 3;

/// Connect the cache backend, keep it health-checked and flag the client degraded while it is
/// unreachable. After repeated failed pings the backend is dropped and reconnected from scratch.
pub async fn run<F, Fut>(client: Arc<ResilientClient>, mut connect: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<dyn CacheBackend>, CacheError>> + Send,
{
    let mut delay = INITIAL_DELAY;

    loop {
        match connect().await {
            Ok(backend) => {
                client.install(backend.clone()).await;
                info!(
                    client = client.label(),
                    backend = backend.name(),
                    "cache connection established; leaving degraded mode"
                );
                delay = INITIAL_DELAY;

                let mut failed_pings = 0;
                loop {
                    match backend.ping().await {
                        Ok(()) => {
                            if client.is_degraded() {
                                info!(client = client.label(), "cache healthy again; leaving degraded mode");
                                client.set_degraded(false);
                            }
                            failed_pings = 0;
                        }
                        Err(err) => {
                            failed_pings += 1;
                            if failed_pings == 1 {
                                warn!(
                                    client = client.label(),
                                    error = %err,
                                    "cache health check failed; entering degraded mode"
                                );
                                client.set_degraded(true);
                            } else {
                                warn!(client = client.label(), attempt = failed_pings, error = %err, "cache health check failed");
                            }
                            if failed_pings >= MAX_FAILED_PINGS {
                                warn!(client = client.label(), "cache unreachable; reconnecting");
                                client.clear().await;
                                break;
                            }
                        }
                    }
                    sleep(HEALTH_POLL_INTERVAL).await;
                }

                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(err) => {
                warn!(client = client.label(), error = %err, "cache connection attempt failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::CircuitConfig, dao::cache::MemoryCacheBackend};

    #[tokio::test(start_paused = true)]
    async fn installs_backend_and_tracks_degraded_mode() {
        let client = ResilientClient::new("test", &CircuitConfig::default());
        let backend = MemoryCacheBackend::new();
        let connect = {
            let backend = backend.clone();
            move || {
                let backend = backend.clone();
                async move { Ok::<Arc<dyn CacheBackend>, CacheError>(Arc::new(backend)) }
            }
        };
        let handle = tokio::spawn(run(client.clone(), connect));
        client.attach_supervisor(handle);

        tokio::task::yield_now().await;
        assert!(!client.is_degraded());
        assert!(client.get_client().await.is_some());

        backend.set_available(false);
        tokio::time::sleep(HEALTH_POLL_INTERVAL + Duration::from_millis(10)).await;
        assert!(client.is_degraded());

        backend.set_available(true);
        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        assert!(!client.is_degraded());

        client.close().await;
        assert!(client.get_client().await.is_none());
    }
}
