//! In-process [`GameStore`] used by tests and by `STORE_BACKEND=memory` runs.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    dao::{
        game_store::GameStore,
        models::{GameRecord, InsertOutcome},
        storage::{StorageError, StorageResult},
    },
    state::game::{ClickEvent, GameId, GameState, UserId, from_unix_millis},
};

#[derive(Debug, Error)]
#[error("memory store is offline")]
struct Offline;

type ClickKey = (GameId, UserId, i64);

#[derive(Default)]
struct ClickLog {
    rows: Vec<ClickEvent>,
    keys: HashSet<ClickKey>,
}

#[derive(Default)]
struct MemoryInner {
    games: DashMap<GameId, GameRecord>,
    clicks: Mutex<ClickLog>,
    offline: AtomicBool,
    corrupt: DashSet<GameId>,
}

/// Store keeping games and clicks in process memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryGameStore {
    inner: Arc<MemoryInner>,
}

impl MemoryGameStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails while `offline` is `true`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Make loads of `game_id` fail as if its row could not be decoded.
    pub fn mark_corrupt(&self, game_id: GameId) {
        self.inner.corrupt.insert(game_id);
    }

    /// Number of click rows stored for `game_id`.
    pub fn click_count(&self, game_id: GameId) -> usize {
        self.inner
            .with_clicks(|log| log.rows.iter().filter(|row| row.game_id == game_id).count())
    }

    /// Copy of every stored click row, in insertion order.
    pub fn clicks(&self) -> Vec<ClickEvent> {
        self.inner.with_clicks(|log| log.rows.clone())
    }
}

impl MemoryInner {
    fn ensure_online(&self, operation: &str) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(operation, Offline));
        }
        Ok(())
    }

    fn with_clicks<T>(&self, f: impl FnOnce(&mut ClickLog) -> T) -> T {
        let mut guard = self.clicks.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn load_game_state(&self, id: GameId) -> StorageResult<Option<GameState>> {
        self.ensure_online("load game state")?;
        if self.corrupt.contains(&id) {
            return Err(StorageError::corrupt(id, "marked corrupt"));
        }
        let Some(record) = self.games.get(&id).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };

        let mut state = GameState::new(id, record.timer_duration, record.cooldown);
        state.is_active = record.is_active;
        self.with_clicks(|log| {
            let mut clickers = HashSet::new();
            let mut latest: Option<&ClickEvent> = None;
            for row in log.rows.iter().filter(|row| row.game_id == id) {
                state.total_clicks += 1;
                clickers.insert(row.user_id);
                if latest.is_none_or(|current| row.clicked_at >= current.clicked_at) {
                    latest = Some(row);
                }
            }
            state.unique_clickers = clickers.len() as u64;
            if let Some(row) = latest {
                state.last_click_at = from_unix_millis(row.clicked_at_millis());
                state.last_clicker_id = Some(row.user_id);
                state.last_clicker_name = Some(row.user_name.clone());
            }
        });
        Ok(Some(state))
    }

    fn insert_click(&self, event: ClickEvent) -> StorageResult<InsertOutcome> {
        self.ensure_online("insert click")?;
        let key = (event.game_id, event.user_id, event.clicked_at_millis());
        Ok(self.with_clicks(|log| {
            if !log.keys.insert(key) {
                return InsertOutcome::Duplicate;
            }
            log.rows.push(event);
            InsertOutcome::Inserted
        }))
    }

    fn last_click_by(
        &self,
        game_id: GameId,
        user_id: UserId,
    ) -> StorageResult<Option<OffsetDateTime>> {
        self.ensure_online("look up last click")?;
        Ok(self.with_clicks(|log| {
            log.rows
                .iter()
                .filter(|row| row.game_id == game_id && row.user_id == user_id)
                .map(|row| row.clicked_at_millis())
                .max()
                .and_then(from_unix_millis)
        }))
    }
}

impl GameStore for MemoryGameStore {
    fn load_game_state(&self, id: GameId) -> BoxFuture<'static, StorageResult<Option<GameState>>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.load_game_state(id) })
    }

    fn insert_click(&self, event: ClickEvent) -> BoxFuture<'static, StorageResult<InsertOutcome>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.insert_click(event) })
    }

    fn list_active_game_ids(&self) -> BoxFuture<'static, StorageResult<Vec<GameId>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.ensure_online("list active games")?;
            let mut ids: Vec<GameId> = inner
                .games
                .iter()
                .filter(|entry| entry.is_active)
                .map(|entry| *entry.key())
                .collect();
            ids.sort_unstable();
            Ok(ids)
        })
    }

    fn save_game(&self, game: GameRecord) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.ensure_online("save game")?;
            inner.games.insert(game.game_id, game);
            Ok(())
        })
    }

    fn end_game(&self, id: GameId) -> BoxFuture<'static, StorageResult<bool>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.ensure_online("end game")?;
            Ok(match inner.games.get_mut(&id) {
                Some(mut game) => {
                    game.is_active = false;
                    true
                }
                None => false,
            })
        })
    }

    fn last_click_by(
        &self,
        game_id: GameId,
        user_id: UserId,
    ) -> BoxFuture<'static, StorageResult<Option<OffsetDateTime>>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.last_click_by(game_id, user_id) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.ensure_online("ping") })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn record(game_id: GameId) -> GameRecord {
        GameRecord {
            game_id,
            timer_duration: Duration::from_secs(600),
            cooldown: Duration::from_secs(10),
            is_active: true,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn click(game_id: GameId, user_id: UserId, unix: i64) -> ClickEvent {
        ClickEvent {
            game_id,
            user_id,
            user_name: format!("player-{user_id}"),
            clicked_at: OffsetDateTime::from_unix_timestamp(unix).unwrap(),
            timer_value: 100.0,
        }
    }

    #[tokio::test]
    async fn aggregates_are_derived_from_clicks() {
        let store = MemoryGameStore::new();
        store.save_game(record(1)).await.unwrap();
        store.insert_click(click(1, 10, 100)).await.unwrap();
        store.insert_click(click(1, 11, 200)).await.unwrap();
        store.insert_click(click(1, 10, 300)).await.unwrap();
        store.insert_click(click(2, 12, 400)).await.unwrap();

        let state = store.load_game_state(1).await.unwrap().unwrap();
        assert_eq!(state.total_clicks, 3);
        assert_eq!(state.unique_clickers, 2);
        assert_eq!(state.last_clicker_id, Some(10));
        assert_eq!(state.last_clicker_name.as_deref(), Some("player-10"));
        assert_eq!(
            state.last_click_at,
            Some(OffsetDateTime::from_unix_timestamp(300).unwrap())
        );
        assert!(store.load_game_state(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn redelivered_click_is_a_duplicate() {
        let store = MemoryGameStore::new();
        let event = click(1, 10, 100);
        assert_eq!(
            store.insert_click(event.clone()).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_click(event).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.click_count(1), 1);
    }

    #[tokio::test]
    async fn ended_games_are_not_listed() {
        let store = MemoryGameStore::new();
        store.save_game(record(3)).await.unwrap();
        store.save_game(record(1)).await.unwrap();
        store.save_game(record(2)).await.unwrap();
        assert!(store.end_game(2).await.unwrap());
        assert!(!store.end_game(9).await.unwrap());
        assert_eq!(store.list_active_game_ids().await.unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = MemoryGameStore::new();
        store.set_offline(true);
        assert!(store.health_check().await.is_err());
        assert!(store.load_game_state(1).await.is_err());
        store.set_offline(false);
        assert!(store.health_check().await.is_ok());
    }
}
