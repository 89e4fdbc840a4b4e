use axum::Router;

use crate::state::SharedState;

pub mod admin;
pub mod docs;
pub mod game;
pub mod health;

/// Compose the health, game, admin and documentation trees over the shared state.
pub fn router(state: SharedState) -> Router<()> {
    health::router()
        .merge(game::router())
        .merge(admin::router())
        .merge(docs::router())
        .with_state(state)
}
