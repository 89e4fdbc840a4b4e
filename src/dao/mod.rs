/// Cache backend abstraction and implementations.
pub mod cache;
/// Persistent store for games and clicks.
pub mod game_store;
/// Database model definitions.
pub mod models;
/// Storage abstraction layer for database operations.
pub mod storage;
