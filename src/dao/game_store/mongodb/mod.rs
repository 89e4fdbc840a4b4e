mod config;
mod error;
mod models;
pub mod store;

pub use config::MongoConfig;
pub use error::MongoDaoError;
pub use store::MongoGameStore;

use crate::dao::storage::StorageError;

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        match err {
            MongoDaoError::InvalidTimestamp { id } => {
                StorageError::corrupt(id, "click timestamp out of range")
            }
            other => StorageError::unavailable(other.to_string(), other),
        }
    }
}
