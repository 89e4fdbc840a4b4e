use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::game::{ClickRequest, ClickResponse, CreateGameRequest, GameSummary, TimerResponse},
    error::AppError,
    services::game_service,
    state::{SharedState, game::GameId},
};

/// Routes handling game lifecycle, timer reads and clicks.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/games", post(create_game))
        .route("/games/{id}", get(get_game).delete(end_game))
        .route("/games/{id}/timer", get(get_timer))
        .route("/games/{id}/clicks", post(click))
}

/// Create a game and prime its cache entry.
#[utoipa::path(
    post,
    path = "/games",
    tag = "game",
    request_body = CreateGameRequest,
    responses(
        (status = 201, description = "Game created", body = GameSummary),
        (status = 409, description = "A game with this identifier already exists")
    )
)]
pub async fn create_game(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<CreateGameRequest>>,
) -> Result<(StatusCode, Json<GameSummary>), AppError> {
    let summary = game_service::create_game(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// Current state of a game.
#[utoipa::path(
    get,
    path = "/games/{id}",
    tag = "game",
    params(("id" = i64, Path, description = "Game identifier")),
    responses(
        (status = 200, description = "Game found", body = GameSummary),
        (status = 404, description = "Unknown game")
    )
)]
pub async fn get_game(
    State(state): State<SharedState>,
    Path(id): Path<GameId>,
) -> Result<Json<GameSummary>, AppError> {
    let summary = game_service::get_game(&state, id).await?;
    Ok(Json(summary))
}

/// End a game. Its rows stay in the store.
#[utoipa::path(
    delete,
    path = "/games/{id}",
    tag = "game",
    params(("id" = i64, Path, description = "Game identifier")),
    responses(
        (status = 204, description = "Game ended"),
        (status = 404, description = "Unknown game"),
        (status = 423, description = "A click on this game is in progress")
    )
)]
pub async fn end_game(
    State(state): State<SharedState>,
    Path(id): Path<GameId>,
) -> Result<StatusCode, AppError> {
    game_service::end_game(&state, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Remaining time, band and time to the next band. Never takes the write lock.
#[utoipa::path(
    get,
    path = "/games/{id}/timer",
    tag = "game",
    params(("id" = i64, Path, description = "Game identifier")),
    responses(
        (status = 200, description = "Timer status", body = TimerResponse),
        (status = 404, description = "Unknown game"),
        (status = 503, description = "Neither the cache nor the store could answer")
    )
)]
pub async fn get_timer(
    State(state): State<SharedState>,
    Path(id): Path<GameId>,
) -> Result<Json<TimerResponse>, AppError> {
    let timer = game_service::timer(&state, id).await?;
    Ok(Json(timer))
}

/// Click the button: resets the timer for everyone.
#[utoipa::path(
    post,
    path = "/games/{id}/clicks",
    tag = "game",
    params(("id" = i64, Path, description = "Game identifier")),
    request_body = ClickRequest,
    responses(
        (status = 200, description = "Click accepted", body = ClickResponse),
        (status = 404, description = "Unknown game"),
        (status = 409, description = "Game ended or consecutive click"),
        (status = 423, description = "Another click holds the game lock"),
        (status = 429, description = "Player is on cooldown"),
        (status = 503, description = "Click could not be persisted or game expiry could not be confirmed")
    )
)]
pub async fn click(
    State(state): State<SharedState>,
    Path(id): Path<GameId>,
    Valid(Json(payload)): Valid<Json<ClickRequest>>,
) -> Result<Json<ClickResponse>, AppError> {
    let response = game_service::click(&state, id, payload).await?;
    Ok(Json(response))
}
