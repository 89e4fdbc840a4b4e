//! In-process [`CacheBackend`] used by tests and by `CACHE_BACKEND=memory` runs.
//!
//! Expiry is measured on the tokio clock so paused-time tests can fast-forward TTLs.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{sync::Notify, time::Instant};

use super::{CacheBackend, CacheError, CacheResult, ReadStart, StreamEntry, StreamRead};

enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct ConsumerGroup {
    last_delivered: u64,
    pending: HashMap<String, BTreeSet<u64>>,
}

#[derive(Default)]
struct Stream {
    next_id: u64,
    entries: BTreeMap<u64, HashMap<String, String>>,
    groups: HashMap<String, ConsumerGroup>,
}

#[derive(Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
    streams: HashMap<String, Stream>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let expired = self
            .slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|deadline| deadline <= Instant::now());
        if expired {
            self.slots.remove(key);
            return None;
        }
        self.slots.get_mut(key)
    }

    fn wrong_type(command: &'static str, key: &str) -> CacheError {
        CacheError::command(command, format!("key `{key}` holds a different type"))
    }
}

struct MemoryInner {
    keyspace: Mutex<Keyspace>,
    appended: Notify,
    available: AtomicBool,
    calls: AtomicU64,
}

impl Default for MemoryInner {
    fn default() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }
}

impl MemoryInner {
    fn enter(&self) -> CacheResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("memory backend switched off".into()))
        }
    }

    fn with_keyspace<T>(&self, f: impl FnOnce(&mut Keyspace) -> T) -> CacheResult<T> {
        self.enter()?;
        let mut guard = self
            .keyspace
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut guard))
    }

    fn read_group(&self, read: &StreamRead) -> CacheResult<Vec<StreamEntry>> {
        self.with_keyspace(|keyspace| {
            let Some(stream) = keyspace.streams.get_mut(&read.key) else {
                return Err(CacheError::command(
                    "XREADGROUP",
                    format!("no such stream `{}`", read.key),
                ));
            };
            let Stream {
                entries, groups, ..
            } = stream;
            let Some(group) = groups.get_mut(&read.group) else {
                return Err(CacheError::command(
                    "XREADGROUP",
                    format!("no such group `{}`", read.group),
                ));
            };

            let ids: Vec<u64> = match &read.start {
                ReadStart::Pending(after) => {
                    let after = parse_id(after)?;
                    group
                        .pending
                        .get(&read.consumer)
                        .map(|pending| {
                            pending
                                .range(after.saturating_add(1)..)
                                .take(read.count)
                                .copied()
                                .collect()
                        })
                        .unwrap_or_default()
                }
                ReadStart::New => {
                    let ids: Vec<u64> = entries
                        .range(group.last_delivered.saturating_add(1)..)
                        .take(read.count)
                        .map(|(id, _)| *id)
                        .collect();
                    if let Some(last) = ids.last() {
                        group.last_delivered = *last;
                    }
                    group
                        .pending
                        .entry(read.consumer.clone())
                        .or_default()
                        .extend(ids.iter().copied());
                    ids
                }
            };

            // Deleted entries stay pending but carry no payload, like Redis.
            Ok(ids
                .into_iter()
                .map(|id| StreamEntry {
                    id: format_id(id),
                    fields: entries.get(&id).cloned().unwrap_or_default(),
                })
                .collect())
        })?
    }
}

fn format_id(id: u64) -> String {
    format!("{id}-0")
}

fn parse_id(raw: &str) -> CacheResult<u64> {
    let millis = raw.split_once('-').map_or(raw, |(millis, _)| millis);
    millis
        .parse()
        .map_err(|_| CacheError::command("XREADGROUP", format!("invalid stream id `{raw}`")))
}

/// Cache backend keeping everything in process memory. Clones share the same data.
///
/// Besides the backend operations it offers a fault switch and a call counter so tests can
/// observe how the circuit breaker shields the backend.
#[derive(Clone, Default)]
pub struct MemoryCacheBackend {
    inner: Arc<MemoryInner>,
}

impl MemoryCacheBackend {
    /// Empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the backend on or off. While off every call fails with
    /// [`CacheError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of calls that reached the backend, successful or not.
    pub fn calls(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Number of entries currently held by the stream at `key`.
    pub fn stream_len(&self, key: &str) -> usize {
        let guard = self
            .inner
            .keyspace
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .streams
            .get(key)
            .map_or(0, |stream| stream.entries.len())
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn ping(&self) -> BoxFuture<'static, CacheResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.enter() })
    }

    fn hash_get_all(&self, key: String) -> BoxFuture<'static, CacheResult<HashMap<String, String>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.with_keyspace(|keyspace| match keyspace.live(&key) {
                None => Ok(HashMap::new()),
                Some(Slot {
                    value: Value::Hash(fields),
                    ..
                }) => Ok(fields.clone()),
                Some(_) => Err(Keyspace::wrong_type("HGETALL", &key)),
            })?
        })
    }

    fn hash_set(
        &self,
        key: String,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.with_keyspace(|keyspace| {
                let expires_at = Some(Instant::now() + ttl);
                match keyspace.live(&key) {
                    Some(Slot {
                        value: Value::Hash(existing),
                        expires_at: deadline,
                    }) => {
                        existing.extend(fields);
                        *deadline = expires_at;
                        Ok(())
                    }
                    Some(_) => Err(Keyspace::wrong_type("HSET", &key)),
                    None => {
                        if !fields.is_empty() {
                            keyspace.slots.insert(
                                key,
                                Slot {
                                    value: Value::Hash(fields.into_iter().collect()),
                                    expires_at,
                                },
                            );
                        }
                        Ok(())
                    }
                }
            })?
        })
    }

    fn delete(&self, key: String) -> BoxFuture<'static, CacheResult<bool>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.with_keyspace(|keyspace| {
                let live = keyspace.live(&key).is_some();
                keyspace.slots.remove(&key);
                live || keyspace.streams.remove(&key).is_some()
            })
        })
    }

    fn get(&self, key: String) -> BoxFuture<'static, CacheResult<Option<String>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.with_keyspace(|keyspace| match keyspace.live(&key) {
                None => Ok(None),
                Some(Slot {
                    value: Value::Text(value),
                    ..
                }) => Ok(Some(value.clone())),
                Some(_) => Err(Keyspace::wrong_type("GET", &key)),
            })?
        })
    }

    fn set_with_ttl(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.with_keyspace(|keyspace| {
                keyspace.slots.insert(
                    key,
                    Slot {
                        value: Value::Text(value),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
            })
        })
    }

    fn set_if_absent(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<bool>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.with_keyspace(|keyspace| {
                if keyspace.live(&key).is_some() {
                    return false;
                }
                keyspace.slots.insert(
                    key,
                    Slot {
                        value: Value::Text(value),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                true
            })
        })
    }

    fn compare_and_delete(
        &self,
        key: String,
        expected: String,
    ) -> BoxFuture<'static, CacheResult<bool>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.with_keyspace(|keyspace| {
                let matches = matches!(
                    keyspace.live(&key),
                    Some(Slot { value: Value::Text(current), .. }) if *current == expected
                );
                if matches {
                    keyspace.slots.remove(&key);
                }
                matches
            })
        })
    }

    fn add_member(
        &self,
        key: String,
        member: String,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<bool>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.with_keyspace(|keyspace| {
                let expires_at = Some(Instant::now() + ttl);
                match keyspace.live(&key) {
                    Some(Slot {
                        value: Value::Set(members),
                        expires_at: deadline,
                    }) => {
                        *deadline = expires_at;
                        Ok(members.insert(member))
                    }
                    Some(_) => Err(Keyspace::wrong_type("SADD", &key)),
                    None => {
                        keyspace.slots.insert(
                            key,
                            Slot {
                                value: Value::Set(HashSet::from([member])),
                                expires_at,
                            },
                        );
                        Ok(true)
                    }
                }
            })?
        })
    }

    fn stream_append(
        &self,
        key: String,
        fields: Vec<(String, String)>,
    ) -> BoxFuture<'static, CacheResult<String>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let id = inner.with_keyspace(|keyspace| {
                let stream = keyspace.streams.entry(key).or_default();
                stream.next_id += 1;
                let id = stream.next_id;
                stream.entries.insert(id, fields.into_iter().collect());
                id
            })?;
            inner.appended.notify_waiters();
            Ok(format_id(id))
        })
    }

    fn stream_create_group(
        &self,
        key: String,
        group: String,
    ) -> BoxFuture<'static, CacheResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.with_keyspace(|keyspace| {
                keyspace
                    .streams
                    .entry(key)
                    .or_default()
                    .groups
                    .entry(group)
                    .or_default();
            })
        })
    }

    fn stream_read_group(
        &self,
        read: StreamRead,
    ) -> BoxFuture<'static, CacheResult<Vec<StreamEntry>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            if matches!(read.start, ReadStart::Pending(_)) {
                return inner.read_group(&read);
            }

            let deadline = Instant::now() + read.block;
            loop {
                let appended = inner.appended.notified();
                tokio::pin!(appended);
                appended.as_mut().enable();

                let entries = inner.read_group(&read)?;
                if !entries.is_empty() || Instant::now() >= deadline {
                    return Ok(entries);
                }
                if tokio::time::timeout_at(deadline, appended).await.is_err() {
                    return inner.read_group(&read);
                }
            }
        })
    }

    fn stream_remove(
        &self,
        key: String,
        group: String,
        id: String,
    ) -> BoxFuture<'static, CacheResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let id = parse_id(&id)?;
            inner.with_keyspace(|keyspace| {
                if let Some(stream) = keyspace.streams.get_mut(&key) {
                    if let Some(group) = stream.groups.get_mut(&group) {
                        for pending in group.pending.values_mut() {
                            pending.remove(&id);
                        }
                    }
                    stream.entries.remove(&id);
                }
            })
        })
    }
}
