use std::time::Duration;

use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    dao::models::GameRecord,
    state::game::{ClickEvent, GameId, UserId, from_unix_millis, unix_millis},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoGameDocument {
    #[serde(rename = "_id")]
    pub id: GameId,
    pub timer_duration_ms: i64,
    pub cooldown_ms: i64,
    pub is_active: bool,
    pub created_at: DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoClickDocument {
    pub game_id: GameId,
    pub user_id: UserId,
    pub user_name: String,
    pub clicked_at: DateTime,
    pub timer_value: f64,
}

impl From<GameRecord> for MongoGameDocument {
    fn from(value: GameRecord) -> Self {
        Self {
            id: value.game_id,
            timer_duration_ms: millis_i64(value.timer_duration),
            cooldown_ms: millis_i64(value.cooldown),
            is_active: value.is_active,
            created_at: to_bson(value.created_at),
        }
    }
}

impl MongoGameDocument {
    pub fn timer_duration(&self) -> Duration {
        Duration::from_millis(self.timer_duration_ms.max(0) as u64)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms.max(0) as u64)
    }
}

impl From<ClickEvent> for MongoClickDocument {
    fn from(value: ClickEvent) -> Self {
        Self {
            game_id: value.game_id,
            user_id: value.user_id,
            user_name: value.user_name,
            clicked_at: to_bson(value.clicked_at),
            timer_value: value.timer_value,
        }
    }
}

fn millis_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub fn to_bson(at: OffsetDateTime) -> DateTime {
    DateTime::from_millis(unix_millis(at))
}

pub fn from_bson(at: DateTime) -> Option<OffsetDateTime> {
    from_unix_millis(at.timestamp_millis())
}

pub fn game_filter(game_id: GameId) -> Document {
    doc! { "game_id": game_id }
}

pub fn doc_id(id: GameId) -> Document {
    doc! { "_id": id }
}
