use std::sync::Arc;

use tracing::debug;

use crate::{
    config::QueueConfig,
    services::resilient_client::{BackendError, ResilientClient},
    state::game::ClickEvent,
};

/// Producer side of the write-behind log.
pub struct WriteQueue {
    client: Arc<ResilientClient>,
    stream_key: String,
}

impl WriteQueue {
    /// Queue appending to `config.stream_key` through `client`.
    pub fn new(client: Arc<ResilientClient>, config: &QueueConfig) -> Self {
        Self {
            client,
            stream_key: config.stream_key.clone(),
        }
    }

    /// Key of the underlying log.
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Append `event` and return its entry id.
    ///
    /// An error means the event was not accepted; the caller must persist it another way.
    pub async fn enqueue(&self, event: &ClickEvent) -> Result<String, BackendError> {
        let key = self.stream_key.clone();
        let fields = event.to_fields();
        let id = self
            .client
            .call(move |backend| backend.stream_append(key, fields))
            .await?;
        debug!(
            game_id = event.game_id,
            user_id = event.user_id,
            entry_id = %id,
            "click queued"
        );
        Ok(id)
    }
}
