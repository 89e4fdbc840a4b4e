use std::error::Error;
use thiserror::Error;

use crate::state::game::GameId;

type BoxedSource = Box<dyn Error + Send + Sync>;

/// Result alias for persistent store calls.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure of a [`GameStore`](crate::dao::game_store::GameStore) call, whatever the database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store could not be reached or refused the operation. Retrying later may succeed.
    #[error("{operation}: persistent store unavailable")]
    Unavailable {
        /// Operation that failed.
        operation: String,
        /// Driver error.
        #[source]
        source: BoxedSource,
    },
    /// A stored row cannot be turned back into a game. Retrying will not help.
    #[error("stored data of game {game_id} is corrupt: {reason}")]
    Corrupt {
        /// Game whose rows are unreadable.
        game_id: GameId,
        /// What was wrong with them.
        reason: String,
    },
}

impl StorageError {
    /// Wrap a driver failure of `operation`.
    pub fn unavailable(
        operation: impl Into<String>,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        StorageError::Unavailable {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Report unreadable rows of `game_id`.
    pub fn corrupt(game_id: GameId, reason: impl Into<String>) -> Self {
        StorageError::Corrupt {
            game_id,
            reason: reason.into(),
        }
    }

    /// Whether the same call may succeed once the store recovers.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }
}
