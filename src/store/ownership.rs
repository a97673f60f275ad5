use std::sync::Arc;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use tracing::{debug, warn};

use super::{Storage, StoreError};
use crate::net::protocol::BotId;

/// Maximum number of remembered bots per world
pub const CAPACITY: usize = 4096;

/// Worlds that only live in this process; their ownership is never persisted
pub const EPHEMERAL_WORLDS: [&str; 2] = ["sandbox", "tutorial"];

#[derive(Debug, Clone, Copy)]
struct Entry {
    created_at: DateTime<Utc>,
    seq: u64,
}

/// Bots uploaded by this player in one world, so they can be highlighted.
///
/// Bounded to [`CAPACITY`] entries; when exceeded the entry with the oldest
/// creation time is evicted (insertion order breaks ties).
pub struct OwnedBots {
    world_id: String,
    storage: Option<Arc<dyn Storage>>,
    bots: HashMap<BotId, Entry>,
    next_seq: u64,
}

impl OwnedBots {
    /// In-memory set, never persisted
    pub fn new(world_id: impl Into<String>) -> Self {
        Self {
            world_id: world_id.into(),
            storage: None,
            bots: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Load the set of `world_id` from storage (nothing for ephemeral worlds)
    pub fn load(world_id: impl Into<String>, storage: Arc<dyn Storage>) -> Result<Self, StoreError> {
        let world_id = world_id.into();

        if is_ephemeral(&world_id) {
            return Ok(Self::new(world_id));
        }

        let mut this = Self {
            storage: Some(storage.clone()),
            ..Self::new(world_id)
        };

        if let Some(raw) = storage.get(&this.key())? {
            match serde_json::from_str::<Vec<(BotId, DateTime<Utc>)>>(&raw) {
                Ok(entries) => {
                    for (id, created_at) in entries {
                        this.insert(id, created_at);
                    }
                    this.gc();
                }
                Err(e) => {
                    warn!("Ignoring corrupt ownership record for {}: {}", this.world_id, e);
                }
            }
        }

        debug!("Loaded {} owned bots for {}", this.bots.len(), this.world_id);
        Ok(this)
    }

    pub fn world_id(&self) -> &str {
        &self.world_id
    }

    pub fn has(&self, id: &BotId) -> bool {
        self.bots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }

    /// Remember a freshly uploaded bot
    pub fn add(&mut self, id: BotId) -> Result<(), StoreError> {
        self.add_at(id, Utc::now())
    }

    pub fn add_at(&mut self, id: BotId, created_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.insert(id, created_at);
        self.gc();
        self.save()
    }

    fn insert(&mut self, id: BotId, created_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.bots.insert(id, Entry { created_at, seq });
    }

    fn gc(&mut self) {
        while self.bots.len() > CAPACITY {
            let oldest = self
                .bots
                .iter()
                .min_by_key(|(_, entry)| (entry.created_at, entry.seq))
                .map(|(id, _)| id.clone());

            match oldest {
                Some(id) => {
                    self.bots.remove(&id);
                }
                None => break,
            }
        }
    }

    fn save(&self) -> Result<(), StoreError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        let mut entries: Vec<_> = self.bots.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);

        let entries: Vec<(&BotId, DateTime<Utc>)> = entries
            .into_iter()
            .map(|(id, entry)| (id, entry.created_at))
            .collect();

        storage.set(&self.key(), &serde_json::to_string(&entries)?)
    }

    fn key(&self) -> String {
        format!("{}.bots", self.world_id)
    }
}

pub fn is_ephemeral(world_id: &str) -> bool {
    EPHEMERAL_WORLDS.contains(&world_id)
}
