use std::time::Duration;

use time::OffsetDateTime;

use crate::state::game::GameId;

/// Persistent row describing one game instance. Click aggregates live with the clicks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameRecord {
    /// Game identifier.
    pub game_id: GameId,
    /// Full length of the timer.
    pub timer_duration: Duration,
    /// Per-player delay between two clicks.
    pub cooldown: Duration,
    /// `false` once the game ended.
    pub is_active: bool,
    /// Creation timestamp, in UTC.
    pub created_at: OffsetDateTime,
}

/// Result of inserting a click row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted,
    /// A row with the same `(game_id, user_id, clicked_at)` key already existed.
    Duplicate,
}
