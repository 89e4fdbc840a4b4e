use std::sync::Arc;

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::doc,
    error::{ErrorKind, WriteFailure},
    options::IndexOptions,
};
use time::OffsetDateTime;

use super::{
    config::MongoConfig,
    error::{MongoDaoError, MongoResult},
    models::{MongoClickDocument, MongoGameDocument, doc_id, from_bson, game_filter},
};
use crate::{
    dao::{
        game_store::GameStore,
        models::{GameRecord, InsertOutcome},
        storage::StorageResult,
    },
    state::game::{ClickEvent, GameId, GameState, UserId},
};

const GAME_COLLECTION_NAME: &str = "games";
const CLICK_COLLECTION_NAME: &str = "clicks";
const DUPLICATE_KEY_CODE: i32 = 11000;

/// MongoDB-backed [`GameStore`]. Every instance owns a separate driver pool.
#[derive(Clone)]
pub struct MongoGameStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    // Keeps the pool alive alongside the collection handles.
    _client: Client,
    database: Database,
    games: Collection<MongoGameDocument>,
    clicks: Collection<MongoClickDocument>,
}

impl MongoGameStore {
    /// Open a pool, check that the deployment answers and ensure indexes are present.
    ///
    /// A single attempt: callers decide whether and how to retry.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let client = Client::with_options(config.options)
            .map_err(|source| MongoDaoError::ClientConstruction { source })?;
        let database = client.database(&config.database_name);
        ping(&database)
            .await
            .map_err(|source| MongoDaoError::InitialPing { source })?;

        let store = Self {
            inner: Arc::new(MongoInner {
                games: database.collection(GAME_COLLECTION_NAME),
                clicks: database.collection(CLICK_COLLECTION_NAME),
                _client: client,
                database,
            }),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let games = self.games();
        let active_index = IndexModel::builder()
            .keys(doc! {"is_active": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("game_active_idx".to_owned()))
                    .build(),
            )
            .build();
        games
            .create_index(active_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: GAME_COLLECTION_NAME,
                index: "is_active",
                source,
            })?;

        // The idempotency key: a redelivered click collides here instead of adding a row.
        let clicks = self.clicks();
        let click_index = IndexModel::builder()
            .keys(doc! {"game_id": 1, "user_id": 1, "clicked_at": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("click_idempotency_idx".to_owned()))
                    .unique(Some(true))
                    .build(),
            )
            .build();
        clicks
            .create_index(click_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: CLICK_COLLECTION_NAME,
                index: "game_id,user_id,clicked_at",
                source,
            })?;

        Ok(())
    }

    fn games(&self) -> &Collection<MongoGameDocument> {
        &self.inner.games
    }

    fn clicks(&self) -> &Collection<MongoClickDocument> {
        &self.inner.clicks
    }

    async fn load_game_state(&self, id: GameId) -> MongoResult<Option<GameState>> {
        let Some(game) = self
            .games()
            .find_one(doc_id(id))
            .await
            .map_err(|source| MongoDaoError::LoadGame { id, source })?
        else {
            return Ok(None);
        };

        let clicks = self.clicks();
        let total_clicks = clicks
            .count_documents(game_filter(id))
            .await
            .map_err(|source| MongoDaoError::ReadClicks { id, source })?;
        let unique_clickers = clicks
            .distinct("user_id", game_filter(id))
            .await
            .map_err(|source| MongoDaoError::ReadClicks { id, source })?
            .len() as u64;
        let latest = clicks
            .find_one(game_filter(id))
            .sort(doc! {"clicked_at": -1})
            .await
            .map_err(|source| MongoDaoError::ReadClicks { id, source })?;

        let mut state = GameState::new(id, game.timer_duration(), game.cooldown());
        state.is_active = game.is_active;
        state.total_clicks = total_clicks;
        state.unique_clickers = unique_clickers;
        if let Some(latest) = latest {
            state.last_click_at =
                Some(from_bson(latest.clicked_at).ok_or(MongoDaoError::InvalidTimestamp { id })?);
            state.last_clicker_id = Some(latest.user_id);
            state.last_clicker_name = Some(latest.user_name);
        }
        Ok(Some(state))
    }

    async fn insert_click(&self, event: ClickEvent) -> MongoResult<InsertOutcome> {
        let id = event.game_id;
        let document: MongoClickDocument = event.into();
        match self.clicks().insert_one(&document).await {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_duplicate_key(&err) => Ok(InsertOutcome::Duplicate),
            Err(source) => Err(MongoDaoError::InsertClick { id, source }),
        }
    }

    async fn list_active_game_ids(&self) -> MongoResult<Vec<GameId>> {
        let documents: Vec<MongoGameDocument> = self
            .games()
            .find(doc! {"is_active": true})
            .sort(doc! {"_id": 1})
            .await
            .map_err(|source| MongoDaoError::ListGames { source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::ListGames { source })?;

        Ok(documents.into_iter().map(|document| document.id).collect())
    }

    async fn save_game(&self, game: GameRecord) -> MongoResult<()> {
        let id = game.game_id;
        let document: MongoGameDocument = game.into();
        self.games()
            .replace_one(doc_id(id), &document)
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::SaveGame { id, source })?;
        Ok(())
    }

    async fn end_game(&self, id: GameId) -> MongoResult<bool> {
        let result = self
            .games()
            .update_one(doc_id(id), doc! {"$set": {"is_active": false}})
            .await
            .map_err(|source| MongoDaoError::EndGame { id, source })?;
        Ok(result.matched_count > 0)
    }

    async fn last_click_by(
        &self,
        game_id: GameId,
        user_id: UserId,
    ) -> MongoResult<Option<OffsetDateTime>> {
        let latest = self
            .clicks()
            .find_one(doc! {"game_id": game_id, "user_id": user_id})
            .sort(doc! {"clicked_at": -1})
            .await
            .map_err(|source| MongoDaoError::ReadClicks { id: game_id, source })?;
        match latest {
            Some(click) => from_bson(click.clicked_at)
                .map(Some)
                .ok_or(MongoDaoError::InvalidTimestamp { id: game_id }),
            None => Ok(None),
        }
    }
}

async fn ping(database: &Database) -> Result<(), mongodb::error::Error> {
    database.run_command(doc! { "ping": 1 }).await.map(|_| ())
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error))
            if write_error.code == DUPLICATE_KEY_CODE
    )
}

impl GameStore for MongoGameStore {
    fn load_game_state(&self, id: GameId) -> BoxFuture<'static, StorageResult<Option<GameState>>> {
        let store = self.clone();
        Box::pin(async move { store.load_game_state(id).await.map_err(Into::into) })
    }

    fn insert_click(&self, event: ClickEvent) -> BoxFuture<'static, StorageResult<InsertOutcome>> {
        let store = self.clone();
        Box::pin(async move { store.insert_click(event).await.map_err(Into::into) })
    }

    fn list_active_game_ids(&self) -> BoxFuture<'static, StorageResult<Vec<GameId>>> {
        let store = self.clone();
        Box::pin(async move { store.list_active_game_ids().await.map_err(Into::into) })
    }

    fn save_game(&self, game: GameRecord) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.save_game(game).await.map_err(Into::into) })
    }

    fn end_game(&self, id: GameId) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.end_game(id).await.map_err(Into::into) })
    }

    fn last_click_by(
        &self,
        game_id: GameId,
        user_id: UserId,
    ) -> BoxFuture<'static, StorageResult<Option<OffsetDateTime>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .last_click_by(game_id, user_id)
                .await
                .map_err(Into::into)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            ping(&store.inner.database)
                .await
                .map_err(|source| MongoDaoError::HealthPing { source }.into())
        })
    }
}
