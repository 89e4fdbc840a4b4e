//! button-back binary entrypoint wiring the cache, the store, the sync worker and the REST layer.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use button_back::{
    config::{AppConfig, CacheBackendKind, StoreBackendKind},
    dao::{
        cache::{CacheBackend, CacheError, MemoryCacheBackend},
        game_store::{GameStore, MemoryGameStore},
    },
    routes,
    services::{cache_supervisor, resilient_client::ResilientClient},
    state::{AppState, Backends, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();

    let cache_client = ResilientClient::new("hot-path", &config.circuit);
    let worker_client = ResilientClient::new("sync-worker", &config.circuit);
    spawn_cache_supervisors(&config, &cache_client, &worker_client)?;

    let (store, worker_store) = connect_stores(&config).await?;

    let app_state = AppState::new(
        &config,
        Backends {
            cache_client: cache_client.clone(),
            worker_client: worker_client.clone(),
            store,
            worker_store,
        },
    );

    if cache_client.wait_until_ready(config.cache.warm_up_wait()).await {
        match app_state.state_cache().warm_cache().await {
            Ok(count) => info!(count, "warmed game state cache"),
            Err(err) => warn!(error = %err, "cache warm-up failed; games load on first read"),
        }
    } else {
        warn!(
            waited_ms = config.cache.warm_up_wait_ms,
            "cache not reachable yet; skipping warm-up, games load on first read"
        );
    }

    if config.queue.enabled {
        app_state.worker().start();
    } else {
        info!("sync worker not started in this process; queued clicks wait for a worker elsewhere");
    }

    let app = build_router(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    let served = axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum");

    app_state.worker().stop().await;
    cache_client.close().await;
    worker_client.close().await;
    info!("shutdown complete");

    served
}

/// Start one supervisor per cache client. Memory backends are shared so both pools see the same
/// keyspace.
fn spawn_cache_supervisors(
    config: &AppConfig,
    cache_client: &Arc<ResilientClient>,
    worker_client: &Arc<ResilientClient>,
) -> anyhow::Result<()> {
    match config.cache_backend {
        CacheBackendKind::Memory => {
            let shared: Arc<dyn CacheBackend> = Arc::new(MemoryCacheBackend::new());
            for client in [cache_client, worker_client] {
                let backend = shared.clone();
                let handle = tokio::spawn(cache_supervisor::run(client.clone(), move || {
                    let backend = backend.clone();
                    async move { Ok::<_, CacheError>(backend) }
                }));
                client.attach_supervisor(handle);
            }
            Ok(())
        }
        CacheBackendKind::Redis => spawn_redis_supervisors(config, cache_client, worker_client),
    }
}

#[cfg(feature = "redis-cache")]
fn spawn_redis_supervisors(
    config: &AppConfig,
    cache_client: &Arc<ResilientClient>,
    worker_client: &Arc<ResilientClient>,
) -> anyhow::Result<()> {
    use button_back::dao::cache::RedisCacheBackend;

    for client in [cache_client, worker_client] {
        let url = config.redis_url.clone();
        let handle = tokio::spawn(cache_supervisor::run(client.clone(), move || {
            let url = url.clone();
            async move {
                let backend = RedisCacheBackend::connect(&url).await?;
                Ok::<Arc<dyn CacheBackend>, CacheError>(Arc::new(backend))
            }
        }));
        client.attach_supervisor(handle);
    }
    Ok(())
}

#[cfg(not(feature = "redis-cache"))]
fn spawn_redis_supervisors(
    _config: &AppConfig,
    _cache_client: &Arc<ResilientClient>,
    _worker_client: &Arc<ResilientClient>,
) -> anyhow::Result<()> {
    anyhow::bail!("cache_backend is `redis` but the `redis-cache` feature is disabled")
}

/// Connect the hot path and sync worker store handles.
async fn connect_stores(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn GameStore>, Arc<dyn GameStore>)> {
    match config.store_backend {
        StoreBackendKind::Memory => {
            let store = MemoryGameStore::new();
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        StoreBackendKind::Mongo => connect_mongo_stores(config).await,
    }
}

/// Connect both MongoDB pools, retrying with exponential backoff until the deployment answers.
#[cfg(feature = "mongo-store")]
async fn connect_mongo_stores(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn GameStore>, Arc<dyn GameStore>)> {
    use std::time::Duration;

    use button_back::dao::game_store::mongodb::{MongoConfig, MongoGameStore};
    use tokio::time::sleep;
    use tracing::error;

    const MAX_DELAY: Duration = Duration::from_secs(10);

    let mongo = MongoConfig::from_uri(&config.mongo_uri, Some(&config.mongo_db))
        .await
        .context("parsing MongoDB URI")?;

    let mut delay = Duration::from_millis(1_000);
    loop {
        let hot = MongoGameStore::connect(mongo.with_app_name("button-back-hot")).await;
        let worker = MongoGameStore::connect(mongo.with_app_name("button-back-worker")).await;
        match (hot, worker) {
            (Ok(hot), Ok(worker)) => {
                info!("connected to MongoDB");
                return Ok((Arc::new(hot), Arc::new(worker)));
            }
            (Err(err), _) | (_, Err(err)) => {
                error!(error = %err, "MongoDB connection attempt failed; retrying");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

#[cfg(not(feature = "mongo-store"))]
async fn connect_mongo_stores(
    _config: &AppConfig,
) -> anyhow::Result<(Arc<dyn GameStore>, Arc<dyn GameStore>)> {
    anyhow::bail!("store_backend is `mongo` but the `mongo-store` feature is disabled")
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
