use std::sync::Arc;

use button_back::{
    config::{AppConfig, QueueConfig},
    dao::{
        cache::MemoryCacheBackend,
        game_store::{GameStore, MemoryGameStore},
    },
    dto::game::CreateGameRequest,
    services::{game_service, resilient_client::ResilientClient},
    state::{AppState, Backends, SharedState},
};

struct Harness {
    state: SharedState,
    store: MemoryGameStore,
}

async fn harness() -> Harness {
    let config = AppConfig {
        queue: QueueConfig {
            block_ms: 50,
            ..QueueConfig::default()
        },
        ..AppConfig::default()
    };
    let backend = Arc::new(MemoryCacheBackend::new());
    let store = MemoryGameStore::new();
    let cache_client = ResilientClient::with_backend("hot-path", &config.circuit, backend.clone()).await;
    let worker_client = ResilientClient::with_backend("sync-worker", &config.circuit, backend).await;

    let state = AppState::new(
        &config,
        Backends {
            cache_client,
            worker_client,
            store: Arc::new(store.clone()),
            worker_store: Arc::new(store.clone()),
        },
    );
    Harness { state, store }
}

async fn create_game(state: &SharedState, game_id: i64) {
    game_service::create_game(
        state,
        CreateGameRequest {
            game_id,
            duration_secs: Some(600),
            cooldown_secs: Some(30),
        },
    )
    .await
    .unwrap();
}

async fn drain(state: &SharedState) -> usize {
    let mut processed = 0;
    loop {
        let report = state.worker().process_batch().await.unwrap();
        if report.read == 0 {
            return processed;
        }
        processed += report.processed;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clicks_are_serialized_and_synced_once() {
    let Harness { state, store } = harness().await;
    create_game(&state, 1).await;

    let mut tasks = Vec::new();
    for user_id in 1..=8_i64 {
        let state = state.clone();
        tasks.push(tokio::spawn(async move {
            state
                .clicks()
                .click(1, user_id, &format!("player-{user_id}"))
                .await
        }));
    }

    let mut totals = Vec::new();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.queued);
        totals.push(outcome.total_clicks);
    }
    totals.sort_unstable();
    assert_eq!(totals, (1..=8).collect::<Vec<u64>>());

    let cached = state.state_cache().get_state(1).await.unwrap().unwrap();
    assert_eq!(cached.total_clicks, 8);
    assert_eq!(cached.unique_clickers, 8);

    assert_eq!(store.click_count(1), 0);
    assert_eq!(drain(&state).await, 8);
    assert_eq!(store.click_count(1), 8);

    let durable = store.load_game_state(1).await.unwrap().unwrap();
    assert_eq!(durable.total_clicks, 8);
    assert_eq!(durable.unique_clickers, 8);
    assert_eq!(durable.last_clicker_id, cached.last_clicker_id);
}

#[tokio::test]
async fn invalidated_state_reloads_from_the_store() {
    let Harness { state, store } = harness().await;
    create_game(&state, 2).await;

    state.clicks().click(2, 10, "alice").await.unwrap();
    state.clicks().click(2, 11, "bob").await.unwrap();
    drain(&state).await;

    state.state_cache().invalidate(2).await;
    let reloaded = state.state_cache().get_state(2).await.unwrap().unwrap();
    assert_eq!(reloaded.total_clicks, 2);
    assert_eq!(reloaded.last_clicker_name.as_deref(), Some("bob"));
    assert_eq!(store.click_count(2), 2);

    let timer = state.state_cache().calculate_timer(2).await.unwrap().unwrap();
    assert!(!timer.expired);
    assert!(timer.remaining <= 600.0);
}

#[tokio::test]
async fn ended_game_rejects_clicks_and_leaves_warm_up() {
    let Harness { state, .. } = harness().await;
    create_game(&state, 3).await;
    create_game(&state, 4).await;

    game_service::end_game(&state, 3).await.unwrap();
    assert!(state.clicks().click(3, 1, "carol").await.is_err());

    let warmed = game_service::warm_cache(&state).await.unwrap();
    assert_eq!(warmed.warmed, 1);
}
