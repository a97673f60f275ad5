//! The in-process simulation, seen from the client.
//!
//! The engine itself lives elsewhere; the client only needs to join it, feed it
//! bots and poke at a few knobs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::net::protocol::{BotId, UpdateMessage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SandboxError(pub String);

impl From<&str> for SandboxError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

/// World configuration handed to a freshly created sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub name: String,
    /// Game mode, e.g. `{ "type": "deathmatch" }`
    pub mode: serde_json::Value,
    /// Map generator, e.g. `{ "type": "arena", "radius": 20 }`
    pub theme: serde_json::Value,
    pub policy: SandboxPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub max_alive_bots: u32,
    pub max_queued_bots: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            name: "sandbox".to_string(),
            mode: serde_json::json!({ "type": "deathmatch" }),
            theme: serde_json::json!({ "type": "arena", "radius": 20 }),
            policy: SandboxPolicy {
                max_alive_bots: 64,
                max_queued_bots: 128,
            },
        }
    }
}

/// Something that happened inside the simulation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ty", rename_all = "kebab-case")]
pub enum SandboxEvent {
    BotSpawned { id: BotId },
    BotKilled { id: BotId },
}

/// Local simulation engine.
///
/// Calls are synchronous; streaming happens through the channel returned by
/// [`Sandbox::join`], which ends when the sandbox stops producing updates.
pub trait Sandbox: Send + 'static {
    fn join(&mut self, bot: Option<&BotId>) -> Result<mpsc::UnboundedReceiver<UpdateMessage>, SandboxError>;

    /// Subscribe to simulation events; independent of any join
    fn listen(&mut self) -> Result<mpsc::UnboundedReceiver<SandboxEvent>, SandboxError>;

    fn pause(&mut self, paused: bool) -> Result<(), SandboxError>;

    fn upload_bot(&mut self, src: &[u8]) -> Result<BotId, SandboxError>;

    fn spawn_prefab_bot(&mut self, kind: &str) -> Result<BotId, SandboxError>;

    fn destroy_bot(&mut self, id: &BotId) -> Result<(), SandboxError>;

    fn restart_bot(&mut self, id: &BotId) -> Result<(), SandboxError>;

    fn set_spawn_point(&mut self, at: Option<(u32, u32)>) -> Result<(), SandboxError>;
}

/// Builds a sandbox for the worker once its config arrives
pub type SandboxFactory =
    Arc<dyn Fn(&SandboxConfig) -> Result<Box<dyn Sandbox>, SandboxError> + Send + Sync>;
