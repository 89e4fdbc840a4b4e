use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    dto::validation::validate_display_name,
    services::click_service::ClickOutcome,
    state::{
        game::{GameId, GameState, UserId, format_timestamp},
        timer::{self, ColorBand, TimerStatus},
    },
};

/// Payload used to create a new game.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateGameRequest {
    /// Identifier chosen by the caller.
    #[validate(range(min = 1))]
    pub game_id: GameId,
    /// Timer length in seconds; the configured default when omitted.
    #[serde(default)]
    #[validate(range(min = 1, max = 31_536_000))]
    pub duration_secs: Option<u64>,
    /// Per-player cooldown in seconds; the configured default when omitted.
    #[serde(default)]
    #[validate(range(max = 86_400))]
    pub cooldown_secs: Option<u64>,
}

/// Public description of a game.
#[derive(Debug, Serialize, ToSchema)]
pub struct GameSummary {
    pub game_id: GameId,
    pub duration_secs: f64,
    pub cooldown_secs: f64,
    pub total_clicks: u64,
    pub unique_clickers: u64,
    pub last_clicker_name: Option<String>,
    /// RFC 3339 timestamp of the last click.
    pub last_click_at: Option<String>,
    pub is_active: bool,
}

impl From<GameState> for GameSummary {
    fn from(value: GameState) -> Self {
        Self {
            game_id: value.game_id,
            duration_secs: value.timer_duration.as_secs_f64(),
            cooldown_secs: value.cooldown.as_secs_f64(),
            total_clicks: value.total_clicks,
            unique_clickers: value.unique_clickers,
            last_clicker_name: value.last_clicker_name,
            last_click_at: value.last_click_at.map(format_timestamp),
            is_active: value.is_active,
        }
    }
}

/// Current timer of a game.
#[derive(Debug, Serialize, ToSchema)]
pub struct TimerResponse {
    pub game_id: GameId,
    pub expired: bool,
    pub remaining_secs: f64,
    /// Share of the duration left, in percent.
    pub percent_left: f64,
    #[schema(value_type = String)]
    pub band: ColorBand,
    pub emoji: String,
    pub label: String,
    /// Seconds until the next lower band; absent in the lowest band.
    pub next_band_in_secs: Option<f64>,
}

impl TimerResponse {
    /// Render `status` of game `game_id`.
    pub fn new(game_id: GameId, status: TimerStatus) -> Self {
        let band = status.band();
        Self {
            game_id,
            expired: status.expired,
            remaining_secs: status.remaining,
            percent_left: timer::percent_left(status.remaining, status.duration),
            band,
            emoji: band.emoji().to_owned(),
            label: band.label().to_owned(),
            next_band_in_secs: timer::time_to_next_band(status.remaining, status.duration),
        }
    }
}

/// Click submitted by a player.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct ClickRequest {
    pub user_id: UserId,
    #[validate(custom(function = "validate_display_name"))]
    pub user_name: String,
}

/// Accepted click.
#[derive(Debug, Serialize, ToSchema)]
pub struct ClickResponse {
    pub game_id: GameId,
    /// RFC 3339 timestamp of the click.
    pub clicked_at: String,
    /// Seconds that were left when the click reset the timer.
    pub timer_value: f64,
    #[schema(value_type = String)]
    pub band: ColorBand,
    pub emoji: String,
    pub total_clicks: u64,
    pub unique_clickers: u64,
    /// `false` when the click was written straight to the store.
    pub queued: bool,
}

impl From<ClickOutcome> for ClickResponse {
    fn from(value: ClickOutcome) -> Self {
        Self {
            game_id: value.game_id,
            clicked_at: format_timestamp(value.clicked_at),
            timer_value: value.timer_value,
            band: value.band,
            emoji: value.band.emoji().to_owned(),
            total_clicks: value.total_clicks,
            unique_clickers: value.unique_clickers,
            queued: value.queued,
        }
    }
}

/// Result of a cache warm-up.
#[derive(Debug, Serialize, ToSchema)]
pub struct WarmResponse {
    /// Number of games loaded into the cache.
    pub warmed: usize,
}
