use mongodb::options::ClientOptions;

use super::error::{MongoDaoError, MongoResult};

/// Parsed connection settings. Each [`super::MongoGameStore`] built from it owns its own pool.
#[derive(Clone)]
pub struct MongoConfig {
    /// Driver options parsed from the connection URI.
    pub options: ClientOptions,
    /// Database holding the `games` and `clicks` collections.
    pub database_name: String,
}

impl MongoConfig {
    /// Parse `uri`, defaulting the database name to `button`.
    pub async fn from_uri(uri: &str, db_name: Option<&str>) -> MongoResult<Self> {
        let database_name = db_name.unwrap_or("button").to_owned();
        let options =
            ClientOptions::parse(uri)
                .await
                .map_err(|source| MongoDaoError::InvalidUri {
                    uri: uri.to_owned(),
                    source,
                })?;

        Ok(Self {
            options,
            database_name,
        })
    }

    /// Copy of this configuration tagged with an application name, so separate pools are
    /// distinguishable server side.
    pub fn with_app_name(&self, app_name: &str) -> Self {
        let mut config = self.clone();
        config.options.app_name = Some(app_name.to_owned());
        config
    }
}
