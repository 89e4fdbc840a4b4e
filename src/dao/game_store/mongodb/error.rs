use mongodb::error::Error as MongoError;
use thiserror::Error;

use crate::state::game::GameId;

pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

/// Failures of the MongoDB store, each tagged with the operation that failed.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    #[error("MongoDB did not answer the initial ping")]
    InitialPing {
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping health check failed")]
    HealthPing {
        #[source]
        source: MongoError,
    },
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        collection: &'static str,
        index: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("failed to save game `{id}`")]
    SaveGame {
        id: GameId,
        #[source]
        source: MongoError,
    },
    #[error("failed to load game `{id}`")]
    LoadGame {
        id: GameId,
        #[source]
        source: MongoError,
    },
    #[error("failed to end game `{id}`")]
    EndGame {
        id: GameId,
        #[source]
        source: MongoError,
    },
    #[error("failed to insert click for game `{id}`")]
    InsertClick {
        id: GameId,
        #[source]
        source: MongoError,
    },
    #[error("failed to read clicks of game `{id}`")]
    ReadClicks {
        id: GameId,
        #[source]
        source: MongoError,
    },
    #[error("failed to list active games")]
    ListGames {
        #[source]
        source: MongoError,
    },
    #[error("stored document for game `{id}` holds an out-of-range timestamp")]
    InvalidTimestamp { id: GameId },
}
