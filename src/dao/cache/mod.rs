//! Remote cache backend seam: key/value hashes with per-key TTL, atomic set-if-absent and
//! compare-and-delete, small sets, and an append-only stream read through a consumer group.

pub mod memory;
#[cfg(feature = "redis-cache")]
pub mod redis_backend;

pub use memory::MemoryCacheBackend;
#[cfg(feature = "redis-cache")]
pub use redis_backend::RedisCacheBackend;

use std::{collections::HashMap, time::Duration};

use futures::future::BoxFuture;
use thiserror::Error;

/// Result alias for cache backend calls.
pub type CacheResult<T> = Result<T, CacheError>;

/// Error raised by a cache backend.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The backend could not be reached.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    /// The backend answered with an error.
    #[error("cache command `{command}` failed: {message}")]
    Command {
        /// Command that failed.
        command: &'static str,
        /// Backend message.
        message: String,
    },
    /// A stored value could not be decoded into its typed form.
    #[error("cached value at `{key}` is malformed: {reason}")]
    Decode {
        /// Offending key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl CacheError {
    pub(crate) fn command(command: &'static str, message: impl ToString) -> Self {
        CacheError::Command {
            command,
            message: message.to_string(),
        }
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Backend-assigned, ordered identifier.
    pub id: String,
    /// Flat field map carried by the entry.
    pub fields: HashMap<String, String>,
}

/// Where a consumer-group read starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStart {
    /// Entries already delivered to this consumer but never acknowledged, after the given id
    /// (`"0"` for the whole pending list). Never blocks.
    Pending(String),
    /// Entries never delivered to any consumer of the group.
    New,
}

/// Parameters of a consumer-group read.
#[derive(Debug, Clone)]
pub struct StreamRead {
    /// Stream key.
    pub key: String,
    /// Consumer group.
    pub group: String,
    /// Consumer name inside the group.
    pub consumer: String,
    /// Where to start.
    pub start: ReadStart,
    /// Maximum number of entries returned.
    pub count: usize,
    /// How long a [`ReadStart::New`] read waits when nothing is ready.
    pub block: Duration,
}

/// Operations the services need from the remote cache.
///
/// Every method returns an owned `'static` future so calls can be wrapped by the circuit breaker
/// without borrowing the backend.
pub trait CacheBackend: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;
    /// Connectivity probe.
    fn ping(&self) -> BoxFuture<'static, CacheResult<()>>;
    /// Every field of the hash at `key`; empty when the key does not exist.
    fn hash_get_all(&self, key: String) -> BoxFuture<'static, CacheResult<HashMap<String, String>>>;
    /// Merge `fields` into the hash at `key` and reset its TTL, atomically.
    fn hash_set(
        &self,
        key: String,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<()>>;
    /// Remove `key`. Returns whether something was removed.
    fn delete(&self, key: String) -> BoxFuture<'static, CacheResult<bool>>;
    /// Plain string value at `key`.
    fn get(&self, key: String) -> BoxFuture<'static, CacheResult<Option<String>>>;
    /// Store a plain string value with a TTL, replacing any previous value.
    fn set_with_ttl(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<()>>;
    /// Store `value` only when `key` is absent. Returns whether the value was stored.
    fn set_if_absent(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<bool>>;
    /// Remove `key` only if it still holds `expected`. Returns whether it was removed.
    fn compare_and_delete(
        &self,
        key: String,
        expected: String,
    ) -> BoxFuture<'static, CacheResult<bool>>;
    /// Add `member` to the set at `key` and reset its TTL. Returns whether it was new.
    fn add_member(
        &self,
        key: String,
        member: String,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<bool>>;
    /// Append an entry to the stream at `key` and return its identifier.
    fn stream_append(
        &self,
        key: String,
        fields: Vec<(String, String)>,
    ) -> BoxFuture<'static, CacheResult<String>>;
    /// Create a consumer group reading the stream from its start. Existing groups are kept.
    fn stream_create_group(&self, key: String, group: String)
    -> BoxFuture<'static, CacheResult<()>>;
    /// Read entries through a consumer group.
    fn stream_read_group(&self, read: StreamRead) -> BoxFuture<'static, CacheResult<Vec<StreamEntry>>>;
    /// Acknowledge and delete one entry.
    fn stream_remove(
        &self,
        key: String,
        group: String,
        id: String,
    ) -> BoxFuture<'static, CacheResult<()>>;
}
