pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

pub use memory::MemoryGameStore;

use futures::future::BoxFuture;
use time::OffsetDateTime;

use crate::dao::models::{GameRecord, InsertOutcome};
use crate::dao::storage::StorageResult;
use crate::state::game::{ClickEvent, GameId, GameState, UserId};

/// Abstraction over the durable store: the source of truth for games and clicks.
///
/// `insert_click` must be safe to re-apply: the same event delivered twice reports
/// [`InsertOutcome::Duplicate`] instead of adding a second row.
pub trait GameStore: Send + Sync {
    /// Load a game and the aggregates derived from its clicks.
    fn load_game_state(&self, id: GameId) -> BoxFuture<'static, StorageResult<Option<GameState>>>;
    /// Insert a click row keyed by `(game_id, user_id, clicked_at)`.
    fn insert_click(&self, event: ClickEvent) -> BoxFuture<'static, StorageResult<InsertOutcome>>;
    /// Identifiers of every game still running.
    fn list_active_game_ids(&self) -> BoxFuture<'static, StorageResult<Vec<GameId>>>;
    /// Create or replace a game row.
    fn save_game(&self, game: GameRecord) -> BoxFuture<'static, StorageResult<()>>;
    /// Mark a game as ended. Returns `false` when the game does not exist.
    fn end_game(&self, id: GameId) -> BoxFuture<'static, StorageResult<bool>>;
    /// Timestamp of the most recent click by `user_id` in `game_id`.
    fn last_click_by(
        &self,
        game_id: GameId,
        user_id: UserId,
    ) -> BoxFuture<'static, StorageResult<Option<OffsetDateTime>>>;
    /// Cheap connectivity probe.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}
