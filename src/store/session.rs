use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Storage, StoreError};
use crate::net::protocol::BotId;

const SESSION_KEY: &str = "session";

/// Last joined world/bot, restored on startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub world_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<BotId>,
}

impl Session {
    pub fn new(world_id: impl Into<String>, bot_id: Option<BotId>) -> Self {
        Self {
            world_id: world_id.into(),
            bot_id,
        }
    }
}

/// Read the stored session; a corrupt record counts as no session
pub fn load_session(storage: &dyn Storage) -> Result<Option<Session>, StoreError> {
    let Some(raw) = storage.get(SESSION_KEY)? else {
        return Ok(None);
    };

    match serde_json::from_str(&raw) {
        Ok(session) => Ok(Some(session)),
        Err(e) => {
            warn!("Ignoring corrupt session record: {}", e);
            Ok(None)
        }
    }
}

/// Overwrite the stored session
pub fn store_session(storage: &dyn Storage, session: &Session) -> Result<(), StoreError> {
    storage.set(SESSION_KEY, &serde_json::to_string(session)?)
}
