use std::time::Duration;

use time::OffsetDateTime;
use tracing::info;

use crate::{
    dao::models::GameRecord,
    dto::game::{ClickRequest, ClickResponse, CreateGameRequest, GameSummary, TimerResponse, WarmResponse},
    error::ServiceError,
    state::{
        SharedState,
        game::{GameId, GameState},
    },
};

/// Persist a new active game and prime the cache with it.
pub async fn create_game(
    state: &SharedState,
    request: CreateGameRequest,
) -> Result<GameSummary, ServiceError> {
    let game_id = request.game_id;
    if state.store().load_game_state(game_id).await?.is_some() {
        return Err(ServiceError::InvalidState(format!(
            "game `{game_id}` already exists"
        )));
    }

    let defaults = state.game_defaults();
    let timer_duration = request
        .duration_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| defaults.duration());
    let cooldown = request
        .cooldown_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| defaults.cooldown());

    state
        .store()
        .save_game(GameRecord {
            game_id,
            timer_duration,
            cooldown,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        })
        .await?;

    let game = GameState::new(game_id, timer_duration, cooldown);
    state.state_cache().cache_state(&game).await;
    info!(game_id, duration_secs = timer_duration.as_secs(), "game created");
    Ok(game.into())
}

/// Current state of a game.
pub async fn get_game(state: &SharedState, game_id: GameId) -> Result<GameSummary, ServiceError> {
    let Some(game) = state.state_cache().get_state(game_id).await? else {
        return Err(ServiceError::NotFound(format!("game `{game_id}` not found")));
    };
    Ok(game.into())
}

/// Remaining time and band of a game's timer.
pub async fn timer(state: &SharedState, game_id: GameId) -> Result<TimerResponse, ServiceError> {
    let Some(status) = state.state_cache().calculate_timer(game_id).await? else {
        return Err(ServiceError::NotFound(format!("game `{game_id}` not found")));
    };
    Ok(TimerResponse::new(game_id, status))
}

/// Register a click through the coordinated write path.
pub async fn click(
    state: &SharedState,
    game_id: GameId,
    request: ClickRequest,
) -> Result<ClickResponse, ServiceError> {
    let outcome = state
        .clicks()
        .click(game_id, request.user_id, &request.user_name)
        .await?;
    Ok(outcome.into())
}

/// Mark a game as ended and drop its cache entry, holding the game's write lock.
pub async fn end_game(state: &SharedState, game_id: GameId) -> Result<(), ServiceError> {
    if !state.clicks().end_game(game_id).await? {
        return Err(ServiceError::NotFound(format!("game `{game_id}` not found")));
    }
    state.state_cache().invalidate(game_id).await;
    info!(game_id, "game ended");
    Ok(())
}

/// Reload every active game into the cache.
pub async fn warm_cache(state: &SharedState) -> Result<WarmResponse, ServiceError> {
    let warmed = state.state_cache().warm_cache().await?;
    Ok(WarmResponse { warmed })
}
