use axum::{Json, Router, extract::State, routing::post};

use crate::{dto::game::WarmResponse, error::AppError, services::game_service, state::SharedState};

/// Operational endpoints.
pub fn router() -> Router<SharedState> {
    Router::new().route("/admin/cache/warm", post(warm_cache))
}

/// Load every active game into the cache.
#[utoipa::path(
    post,
    path = "/admin/cache/warm",
    tag = "admin",
    responses(
        (status = 200, description = "Cache warmed", body = WarmResponse),
        (status = 503, description = "Store unavailable")
    )
)]
pub async fn warm_cache(State(state): State<SharedState>) -> Result<Json<WarmResponse>, AppError> {
    let response = game_service::warm_cache(&state).await?;
    Ok(Json(response))
}
