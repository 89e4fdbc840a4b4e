//! Fixed-shape game records and their flat string-field encoding, shared by the cache hash and
//! the write-behind log.

use std::{collections::HashMap, time::Duration};

use thiserror::Error;
use time::{OffsetDateTime, UtcOffset, format_description::well_known::Rfc3339};

use crate::state::timer::{self, TimerStatus};

/// Identifier of a game instance.
pub type GameId = i64;
/// Identifier of a player.
pub type UserId = i64;

const GAME_ID: &str = "game_id";
const LAST_CLICK_AT: &str = "last_click_at";
const TIMER_DURATION_MS: &str = "timer_duration_ms";
const COOLDOWN_MS: &str = "cooldown_ms";
const TOTAL_CLICKS: &str = "total_clicks";
const UNIQUE_CLICKERS: &str = "unique_clickers";
const LAST_CLICKER_ID: &str = "last_clicker_id";
const LAST_CLICKER_NAME: &str = "last_clicker_name";
const IS_ACTIVE: &str = "is_active";

const GAME_STATE_FIELDS: [&str; 9] = [
    GAME_ID,
    LAST_CLICK_AT,
    TIMER_DURATION_MS,
    COOLDOWN_MS,
    TOTAL_CLICKS,
    UNIQUE_CLICKERS,
    LAST_CLICKER_ID,
    LAST_CLICKER_NAME,
    IS_ACTIVE,
];

const USER_ID: &str = "user_id";
const USER_NAME: &str = "user_name";
const CLICKED_AT: &str = "clicked_at";
const TIMER_VALUE: &str = "timer_value";

const CLICK_EVENT_FIELDS: [&str; 5] = [GAME_ID, USER_ID, USER_NAME, CLICKED_AT, TIMER_VALUE];

/// Error raised when a flat field map cannot be turned back into a typed record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    /// The map carries a field the record does not know.
    #[error("unknown field `{0}`")]
    Unknown(String),
    /// A required field is absent.
    #[error("missing field `{0}`")]
    Missing(&'static str),
    /// A field could not be parsed into its type.
    #[error("malformed value `{value}` for field `{field}`")]
    Malformed {
        /// Field name.
        field: &'static str,
        /// Raw value found.
        value: String,
    },
    /// The stored identifier disagrees with the key it was read from.
    #[error("record belongs to game {found}, expected {expected}")]
    IdMismatch {
        /// Identifier requested.
        expected: GameId,
        /// Identifier stored in the record.
        found: GameId,
    },
}

/// Cached view of one game instance.
///
/// Only the last click timestamp and the duration are authoritative; the remaining time is
/// always derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameState {
    /// Game identifier.
    pub game_id: GameId,
    /// When the timer was last reset, in UTC. `None` until the first click.
    pub last_click_at: Option<OffsetDateTime>,
    /// Full length of the timer.
    pub timer_duration: Duration,
    /// Per-player delay between two clicks.
    pub cooldown: Duration,
    /// Number of accepted clicks.
    pub total_clicks: u64,
    /// Number of distinct players who clicked.
    pub unique_clickers: u64,
    /// Player behind the most recent click.
    pub last_clicker_id: Option<UserId>,
    /// Display name of the most recent clicker.
    ///
    /// An empty name encodes the same as `None` and decodes as `None`. Click requests reject blank
    /// names, so only that one value collapses.
    pub last_clicker_name: Option<String>,
    /// `false` once the game reached its terminal state.
    pub is_active: bool,
}

/// Subset of [`GameState`] fields merged into the cache on the hot path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameStateUpdate {
    /// New last click timestamp.
    pub last_click_at: Option<OffsetDateTime>,
    /// New click total.
    pub total_clicks: Option<u64>,
    /// New distinct clicker total.
    pub unique_clickers: Option<u64>,
    /// New last clicker identifier.
    pub last_clicker_id: Option<UserId>,
    /// New last clicker display name.
    pub last_clicker_name: Option<String>,
    /// New active flag.
    pub is_active: Option<bool>,
}

/// Durable record of an accepted click, travelling through the write-behind log.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickEvent {
    /// Game that was clicked.
    pub game_id: GameId,
    /// Player who clicked.
    pub user_id: UserId,
    /// Player display name at click time.
    pub user_name: String,
    /// Click timestamp, in UTC.
    pub clicked_at: OffsetDateTime,
    /// Seconds that were left on the timer when the click landed.
    pub timer_value: f64,
}

impl GameState {
    /// Fresh, never-clicked state for a newly created game.
    pub fn new(game_id: GameId, timer_duration: Duration, cooldown: Duration) -> Self {
        Self {
            game_id,
            last_click_at: None,
            timer_duration,
            cooldown,
            total_clicks: 0,
            unique_clickers: 0,
            last_clicker_id: None,
            last_clicker_name: None,
            is_active: true,
        }
    }

    /// Timer status at `now`.
    pub fn timer_at(&self, now: OffsetDateTime) -> TimerStatus {
        timer::status(self.last_click_at, self.timer_duration, now)
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &GameStateUpdate) {
        if let Some(at) = update.last_click_at {
            self.last_click_at = Some(to_utc(at));
        }
        if let Some(total) = update.total_clicks {
            self.total_clicks = total;
        }
        if let Some(unique) = update.unique_clickers {
            self.unique_clickers = unique;
        }
        if let Some(id) = update.last_clicker_id {
            self.last_clicker_id = Some(id);
        }
        if let Some(name) = &update.last_clicker_name {
            self.last_clicker_name = Some(name.clone());
        }
        if let Some(active) = update.is_active {
            self.is_active = active;
        }
    }

    /// Encode every field as a string pair; absent optionals become empty strings.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field(GAME_ID, self.game_id.to_string()),
            field(
                LAST_CLICK_AT,
                self.last_click_at.map(format_timestamp).unwrap_or_default(),
            ),
            field(TIMER_DURATION_MS, duration_ms(self.timer_duration)),
            field(COOLDOWN_MS, duration_ms(self.cooldown)),
            field(TOTAL_CLICKS, self.total_clicks.to_string()),
            field(UNIQUE_CLICKERS, self.unique_clickers.to_string()),
            field(
                LAST_CLICKER_ID,
                self.last_clicker_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
            ),
            field(
                LAST_CLICKER_NAME,
                self.last_clicker_name.clone().unwrap_or_default(),
            ),
            field(IS_ACTIVE, encode_bool(self.is_active)),
        ]
    }

    /// Decode a field map produced by [`GameState::to_fields`], possibly merged with updates.
    pub fn from_fields(
        expected: GameId,
        fields: &HashMap<String, String>,
    ) -> Result<Self, FieldError> {
        reject_unknown(fields, &GAME_STATE_FIELDS)?;

        let game_id = parse_required(fields, GAME_ID)?;
        if game_id != expected {
            return Err(FieldError::IdMismatch {
                expected,
                found: game_id,
            });
        }

        Ok(Self {
            game_id,
            last_click_at: optional(fields, LAST_CLICK_AT)
                .map(|raw| parse_timestamp(LAST_CLICK_AT, raw))
                .transpose()?,
            timer_duration: Duration::from_millis(parse_required(fields, TIMER_DURATION_MS)?),
            cooldown: Duration::from_millis(parse_required(fields, COOLDOWN_MS)?),
            total_clicks: parse_required(fields, TOTAL_CLICKS)?,
            unique_clickers: parse_required(fields, UNIQUE_CLICKERS)?,
            last_clicker_id: optional(fields, LAST_CLICKER_ID)
                .map(|raw| parse_value(LAST_CLICKER_ID, raw))
                .transpose()?,
            last_clicker_name: optional(fields, LAST_CLICKER_NAME).map(str::to_owned),
            is_active: parse_bool(IS_ACTIVE, required(fields, IS_ACTIVE)?)?,
        })
    }
}

impl GameStateUpdate {
    /// Encode only the fields that are set.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        if let Some(at) = self.last_click_at {
            fields.push(field(LAST_CLICK_AT, format_timestamp(at)));
        }
        if let Some(total) = self.total_clicks {
            fields.push(field(TOTAL_CLICKS, total.to_string()));
        }
        if let Some(unique) = self.unique_clickers {
            fields.push(field(UNIQUE_CLICKERS, unique.to_string()));
        }
        if let Some(id) = self.last_clicker_id {
            fields.push(field(LAST_CLICKER_ID, id.to_string()));
        }
        if let Some(name) = &self.last_clicker_name {
            fields.push(field(LAST_CLICKER_NAME, name.clone()));
        }
        if let Some(active) = self.is_active {
            fields.push(field(IS_ACTIVE, encode_bool(active)));
        }
        fields
    }
}

impl ClickEvent {
    /// Encode the event for the write-behind log.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field(GAME_ID, self.game_id.to_string()),
            field(USER_ID, self.user_id.to_string()),
            field(USER_NAME, self.user_name.clone()),
            field(CLICKED_AT, format_timestamp(self.clicked_at)),
            field(TIMER_VALUE, self.timer_value.to_string()),
        ]
    }

    /// Decode an event read back from the write-behind log.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, FieldError> {
        reject_unknown(fields, &CLICK_EVENT_FIELDS)?;
        Ok(Self {
            game_id: parse_required(fields, GAME_ID)?,
            user_id: parse_required(fields, USER_ID)?,
            user_name: required(fields, USER_NAME)?.to_owned(),
            clicked_at: parse_timestamp(CLICKED_AT, required(fields, CLICKED_AT)?)?,
            timer_value: parse_required(fields, TIMER_VALUE)?,
        })
    }

    /// Milliseconds since the Unix epoch, the precision at which stores compare click times.
    pub fn clicked_at_millis(&self) -> i64 {
        unix_millis(self.clicked_at)
    }
}

/// Normalise a timestamp to UTC.
pub fn to_utc(at: OffsetDateTime) -> OffsetDateTime {
    at.to_offset(UtcOffset::UTC)
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Inverse of [`unix_millis`].
pub fn from_unix_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

/// RFC 3339 rendering in UTC, keeping sub-second precision.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    to_utc(at)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "invalid-timestamp".into())
}

fn parse_timestamp(name: &'static str, raw: &str) -> Result<OffsetDateTime, FieldError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map(to_utc)
        .map_err(|_| malformed(name, raw))
}

fn field(name: &str, value: String) -> (String, String) {
    (name.to_owned(), value)
}

fn duration_ms(duration: Duration) -> String {
    duration.as_millis().to_string()
}

fn encode_bool(value: bool) -> String {
    let encoded = if value { "1" } else { "0" };
    encoded.to_owned()
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, FieldError> {
    match raw {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(malformed(name, other)),
    }
}

fn reject_unknown(fields: &HashMap<String, String>, known: &[&str]) -> Result<(), FieldError> {
    match fields.keys().find(|key| !known.contains(&key.as_str())) {
        Some(key) => Err(FieldError::Unknown(key.clone())),
        None => Ok(()),
    }
}

fn required<'a>(
    fields: &'a HashMap<String, String>,
    name: &'static str,
) -> Result<&'a str, FieldError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or(FieldError::Missing(name))
}

fn optional<'a>(fields: &'a HashMap<String, String>, name: &'static str) -> Option<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn parse_required<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    name: &'static str,
) -> Result<T, FieldError> {
    parse_value(name, required(fields, name)?)
}

fn parse_value<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, FieldError> {
    raw.parse().map_err(|_| malformed(name, raw))
}

fn malformed(field: &'static str, value: &str) -> FieldError {
    FieldError::Malformed {
        field,
        value: value.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> GameState {
        GameState {
            game_id: 42,
            last_click_at: Some(
                OffsetDateTime::from_unix_timestamp_nanos(1_700_000_000_123_456_789).unwrap(),
            ),
            timer_duration: Duration::from_secs(43_200),
            cooldown: Duration::from_secs(60),
            total_clicks: 17,
            unique_clickers: 9,
            last_clicker_id: Some(1_234_567_890_123),
            last_clicker_name: Some("Ferris".into()),
            is_active: true,
        }
    }

    fn as_map(fields: Vec<(String, String)>) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn state_survives_field_encoding() {
        let state = sample_state();
        let decoded = GameState::from_fields(42, &as_map(state.to_fields())).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn empty_clicker_name_decodes_as_absent() {
        let mut state = sample_state();
        state.last_clicker_name = Some(String::new());
        let decoded = GameState::from_fields(42, &as_map(state.to_fields())).unwrap();
        assert_eq!(decoded.last_clicker_name, None);
        assert!(crate::dto::validation::validate_display_name("").is_err());
    }

    #[test]
    fn never_clicked_state_survives_field_encoding() {
        let state = GameState::new(7, Duration::from_secs(600), Duration::from_secs(5));
        let decoded = GameState::from_fields(7, &as_map(state.to_fields())).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn timestamps_are_normalised_to_utc() {
        let mut state = sample_state();
        let offset = UtcOffset::from_hms(5, 30, 0).unwrap();
        let local = state.last_click_at.unwrap().to_offset(offset);
        state.last_click_at = Some(local);
        let decoded = GameState::from_fields(42, &as_map(state.to_fields())).unwrap();
        assert_eq!(decoded.last_click_at.unwrap().offset(), UtcOffset::UTC);
        assert_eq!(decoded.last_click_at, Some(local));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut fields = as_map(sample_state().to_fields());
        fields.insert("color".into(), "green".into());
        assert_eq!(
            GameState::from_fields(42, &fields),
            Err(FieldError::Unknown("color".into()))
        );
    }

    #[test]
    fn partial_hash_is_reported_missing() {
        let update = GameStateUpdate {
            total_clicks: Some(3),
            ..Default::default()
        };
        let fields = as_map(update.to_fields());
        assert_eq!(
            GameState::from_fields(1, &fields),
            Err(FieldError::Missing(GAME_ID))
        );
    }

    #[test]
    fn mismatched_id_is_rejected() {
        let fields = as_map(sample_state().to_fields());
        assert!(matches!(
            GameState::from_fields(43, &fields),
            Err(FieldError::IdMismatch {
                expected: 43,
                found: 42
            })
        ));
    }

    #[test]
    fn update_merges_over_full_state() {
        let state = sample_state();
        let update = GameStateUpdate {
            total_clicks: Some(18),
            last_clicker_id: Some(5),
            last_clicker_name: Some("Crab".into()),
            ..Default::default()
        };
        let mut merged = as_map(state.to_fields());
        merged.extend(update.to_fields());

        let mut expected = state.clone();
        expected.apply(&update);
        assert_eq!(GameState::from_fields(42, &merged).unwrap(), expected);
        assert_eq!(expected.total_clicks, 18);
        assert_eq!(expected.last_clicker_name.as_deref(), Some("Crab"));
    }

    #[test]
    fn click_event_survives_field_encoding() {
        let event = ClickEvent {
            game_id: 3,
            user_id: 99,
            user_name: "Ferris the Crab".into(),
            clicked_at: OffsetDateTime::from_unix_timestamp_nanos(1_700_000_123_000_000_001)
                .unwrap(),
            timer_value: 1_234.567_891,
        };
        let decoded = ClickEvent::from_fields(&as_map(event.to_fields())).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.clicked_at_millis(), 1_700_000_123_000);
    }

    #[test]
    fn malformed_click_event_is_rejected() {
        let mut fields = as_map(
            ClickEvent {
                game_id: 3,
                user_id: 99,
                user_name: "x".into(),
                clicked_at: OffsetDateTime::UNIX_EPOCH,
                timer_value: 1.0,
            }
            .to_fields(),
        );
        fields.insert(TIMER_VALUE.into(), "soon".into());
        assert!(matches!(
            ClickEvent::from_fields(&fields),
            Err(FieldError::Malformed {
                field: TIMER_VALUE,
                ..
            })
        ));
    }
}
