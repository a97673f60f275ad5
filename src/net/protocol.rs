use std::fmt;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::{Deserialize, Deserializer, Serialize};

/// Control packet tag announcing a viewport resize
pub const CONTROL_RESIZE: u8 = 0x04;

/// Bot identifier as assigned by the world (e.g. `1f2e-3d4c-5b6a-7980`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotId(String);

impl BotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BotId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for BotId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame on a freshly opened stream, makes the stream visible to the server
    Hello { version: String },
}

impl ClientMessage {
    pub fn hello() -> Self {
        Self::Hello {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Partial world update streamed by both backends.
///
/// Every key is independently optional: an absent key means "no change in this
/// message", never "cleared".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<MapUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ModeUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bots: Option<BotsUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<TrackedBotUpdate>,
}

impl UpdateMessage {
    pub fn is_empty(&self) -> bool {
        self.map.is_none() && self.mode.is_none() && self.bots.is_none() && self.bot.is_none()
    }
}

/// Whole map, sent once per join and whenever the map changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapUpdate {
    /// Width and height in tiles
    pub size: (u32, u32),
    /// Row-major tiles, `size.0 * size.1` entries
    pub tiles: Vec<u32>,
}

/// Mode-specific payload.
///
/// Only `scores` is interpreted here; everything else is kept as-is for the
/// renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeUpdate {
    #[serde(default)]
    pub scores: HashMap<BotId, u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Full set of live bots, keyed by id
pub type BotsUpdate = HashMap<BotId, BotUpdate>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotUpdate {
    pub pos: (i32, i32),
    pub dir: Dir,
    #[serde(deserialize_with = "deserialize_age")]
    pub age: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dir {
    #[serde(rename = "^")]
    Up,
    #[serde(rename = ">")]
    Right,
    #[serde(rename = "v")]
    Down,
    #[serde(rename = "<")]
    Left,
}

/// Detailed status of the bot the session joined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TrackedBotUpdate {
    Queued {
        place: u32,
        requeued: bool,
        #[serde(default)]
        events: Vec<BotEvent>,
    },
    Alive {
        #[serde(deserialize_with = "deserialize_age")]
        age: u64,
        #[serde(default)]
        serial: Vec<u32>,
        #[serde(default)]
        events: Vec<BotEvent>,
    },
    Dead {
        #[serde(default)]
        events: Vec<BotEvent>,
    },
    /// The requested bot does not exist in this world
    Unknown,
}

impl TrackedBotUpdate {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotEvent {
    pub at: DateTime<Utc>,
    pub msg: String,
}

/// Out-of-band packets sent from client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacket {
    /// Terminal/viewport resize
    Resize { cols: u8, rows: u8 },
}

impl ControlPacket {
    /// Build a resize packet, clamping both dimensions into `[0, 255]`
    pub fn resize(cols: i64, rows: i64) -> Self {
        Self::Resize {
            cols: cols.clamp(0, 255) as u8,
            rows: rows.clamp(0, 255) as u8,
        }
    }

    pub fn encode(&self) -> [u8; 3] {
        match *self {
            Self::Resize { cols, rows } => [CONTROL_RESIZE, cols, rows],
        }
    }
}

// Worlds report ages as fractional seconds; only the integer part is kept
fn deserialize_age<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let age = f64::deserialize(deserializer)?;

    if age.is_finite() && age > 0.0 {
        Ok(age as u64)
    } else {
        Ok(0)
    }
}

/// Encode a message as JSON
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(message).map_err(|e| EncodeError(e.to_string()))
}

/// Decode a JSON message
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(data).map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);
