//! Client-side view of one world.
//!
//! [`WorldSnapshot`] is the plain reducer state; [`World`] wraps it for sharing
//! between the controller (single writer) and any number of readers.

pub mod leaderboard;
pub mod snapshot;

use parking_lot::{RwLock, RwLockReadGuard};
use tokio::sync::watch;
use tracing::debug;

use crate::controller::ConnectionStatus;
use crate::net::protocol::{BotId, UpdateMessage};
use crate::store::{OwnedBots, StoreError};

pub use leaderboard::{leaderboard, LeaderboardRow};
pub use snapshot::{MapBot, MapView, TrackedBot, TrackedStatus, WorldSnapshot, MAX_EVENTS};

/// Shared world state plus a version counter bumped on every change
pub struct World {
    id: String,
    snapshot: RwLock<WorldSnapshot>,
    owned: RwLock<OwnedBots>,
    version: watch::Sender<u64>,
}

impl World {
    pub fn new(owned: OwnedBots) -> Self {
        let (version, _) = watch::channel(0);

        Self {
            id: owned.world_id().to_string(),
            snapshot: RwLock::new(WorldSnapshot::new()),
            owned: RwLock::new(owned),
            version,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read access to the current snapshot; keep the guard short-lived
    pub fn snapshot(&self) -> RwLockReadGuard<'_, WorldSnapshot> {
        self.snapshot.read()
    }

    /// Notified after every change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Start over for a new join, tracking `bot_id` (following) if given
    pub fn reset_for_join(&self, bot_id: Option<&BotId>) {
        {
            let mut snapshot = self.snapshot.write();
            let status = snapshot.status;

            *snapshot = WorldSnapshot {
                tracked: bot_id.cloned().map(TrackedBot::new),
                status,
                ..WorldSnapshot::new()
            };
        }

        debug!("World {} reset (tracking {:?})", self.id, bot_id.map(BotId::as_str));
        self.bump();
    }

    pub fn apply(&self, msg: UpdateMessage) {
        {
            let owned = self.owned.read();
            self.snapshot.write().apply(msg, &owned);
        }

        self.bump();
    }

    pub fn tracked_id(&self) -> Option<BotId> {
        self.snapshot.read().tracked.as_ref().map(|t| t.id.clone())
    }

    pub fn clear_tracked(&self) {
        self.snapshot.write().tracked = None;
        self.bump();
    }

    pub fn set_following(&self, following: bool) {
        if let Some(tracked) = &mut self.snapshot.write().tracked {
            tracked.following = following;
        }

        self.bump();
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.snapshot.write().status = status;
        self.bump();
    }

    pub fn leaderboard(&self) -> Vec<LeaderboardRow> {
        let owned = self.owned.read();
        leaderboard(&self.snapshot.read(), &owned)
    }

    pub fn is_owned(&self, id: &BotId) -> bool {
        self.owned.read().has(id)
    }

    /// Remember a bot uploaded by this player
    pub fn add_owned(&self, id: BotId) -> Result<(), StoreError> {
        self.owned.write().add(id)?;
        self.bump();
        Ok(())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{BotUpdate, Dir, MapUpdate, TrackedBotUpdate};

    fn world() -> World {
        World::new(OwnedBots::new("w1"))
    }

    #[test]
    fn test_reset_seeds_tracking() {
        let world = world();
        world.reset_for_join(Some(&BotId::from("a")));

        let snapshot = world.snapshot();
        let tracked = snapshot.tracked.as_ref().unwrap();
        assert_eq!(tracked.id, BotId::from("a"));
        assert!(tracked.following);
        assert_eq!(tracked.status, TrackedStatus::Unknown);
    }

    #[test]
    fn test_reset_clears_world_keeps_status() {
        let world = world();
        world.set_status(ConnectionStatus::Connected);
        world.apply(UpdateMessage {
            map: Some(MapUpdate {
                size: (1, 1),
                tiles: vec![0],
            }),
            ..Default::default()
        });

        world.reset_for_join(None);

        let snapshot = world.snapshot();
        assert!(snapshot.map.is_none());
        assert!(snapshot.tracked.is_none());
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
    }

    #[test]
    fn test_version_bumps() {
        let world = world();
        let rx = world.subscribe();
        let before = *rx.borrow();

        world.apply(UpdateMessage::default());
        world.set_following(false);

        assert_eq!(*rx.borrow(), before + 2);
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_ownership_shows_in_leaderboard() {
        let world = world();
        world.apply(UpdateMessage {
            bots: Some(
                [(
                    BotId::from("a"),
                    BotUpdate {
                        pos: (0, 0),
                        dir: Dir::Down,
                        age: 3,
                    },
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        });

        assert!(!world.leaderboard()[0].known);
        world.add_owned(BotId::from("a")).unwrap();
        assert!(world.leaderboard()[0].known);
        assert!(world.is_owned(&BotId::from("a")));
    }

    #[test]
    fn test_unknown_then_tracked_id_cleared() {
        let world = world();
        world.reset_for_join(Some(&BotId::from("ghost")));
        assert_eq!(world.tracked_id(), Some(BotId::from("ghost")));

        world.apply(UpdateMessage {
            bot: Some(TrackedBotUpdate::Unknown),
            ..Default::default()
        });
        assert_eq!(world.tracked_id(), None);
    }
}
