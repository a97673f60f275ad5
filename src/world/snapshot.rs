use std::time::Instant;

use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::controller::ConnectionStatus;
use crate::net::protocol::{
    BotEvent, BotId, BotUpdate, BotsUpdate, MapUpdate, ModeUpdate, TrackedBotUpdate,
    UpdateMessage,
};
use crate::store::OwnedBots;

/// Maximum number of events kept for the tracked bot
pub const MAX_EVENTS: usize = 64;

/// Live bot as rendered on the map
pub type BotSummary = BotUpdate;

/// Mode payload; `scores` is typed, the rest is opaque
pub type ModeInfo = ModeUpdate;

#[derive(Debug, Clone, PartialEq)]
pub struct MapView {
    pub size: (u32, u32),
    pub tiles: Vec<u32>,
    /// Tile -> bot index, `size.0 * size.1` entries
    pub bots: Vec<Option<MapBot>>,
}

impl MapView {
    /// Builds the view, or `None` when `size` does not describe `tiles`
    fn new(map: MapUpdate) -> Option<Self> {
        let (w, h) = map.size;
        let len = (w as usize).checked_mul(h as usize)?;

        if len != map.tiles.len() {
            return None;
        }

        Some(Self {
            size: map.size,
            tiles: map.tiles,
            bots: vec![None; len],
        })
    }

    fn index(&self, (x, y): (i32, i32)) -> Option<usize> {
        let (w, h) = self.size;

        if x < 0 || y < 0 || x as u32 >= w || y as u32 >= h {
            return None;
        }

        Some(y as usize * w as usize + x as usize)
    }

    /// Bot standing on the given tile, if any
    pub fn bot_at(&self, pos: (i32, i32)) -> Option<&MapBot> {
        self.index(pos).and_then(|idx| self.bots[idx].as_ref())
    }

    /// Centre of the map, halves rounded up
    pub fn center(&self) -> (i32, i32) {
        (self.size.0.div_ceil(2) as i32, self.size.1.div_ceil(2) as i32)
    }

    fn reindex(&mut self, bots: &BotsUpdate, owned: &OwnedBots) {
        self.bots.iter_mut().for_each(|slot| *slot = None);

        for (id, bot) in bots {
            match self.index(bot.pos) {
                Some(idx) => {
                    self.bots[idx] = Some(MapBot {
                        id: id.clone(),
                        known: owned.has(id),
                    });
                }
                None => {
                    trace!("Bot {} at {:?} is outside the map", id, bot.pos);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapBot {
    pub id: BotId,
    /// Uploaded by this player
    pub known: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedStatus {
    Unknown,
    Queued { place: u32, requeued: bool },
    Alive { age: u64, serial: Vec<u32> },
    Dead,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedBot {
    pub id: BotId,
    /// Camera follows the bot while it is alive
    pub following: bool,
    pub status: TrackedStatus,
    /// Newest first
    pub events: Vec<BotEvent>,
}

impl TrackedBot {
    pub fn new(id: BotId) -> Self {
        Self {
            id,
            following: true,
            status: TrackedStatus::Unknown,
            events: Vec::new(),
        }
    }
}

/// Render-ready view of one world
#[derive(Debug, Clone, Default)]
pub struct WorldSnapshot {
    pub map: Option<MapView>,
    pub mode: Option<ModeInfo>,
    pub bots: HashMap<BotId, BotSummary>,
    pub tracked: Option<TrackedBot>,
    pub camera: Option<(i32, i32)>,
    pub status: ConnectionStatus,
    pub last_update: Option<Instant>,
}

impl WorldSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one update message into the snapshot.
    ///
    /// Keys are applied in the order map, mode, bots, bot; absent keys leave
    /// the corresponding state untouched.
    pub fn apply(&mut self, msg: UpdateMessage, owned: &OwnedBots) {
        self.last_update = Some(Instant::now());

        if let Some(map) = msg.map {
            self.apply_map(map, owned);
        }

        if let Some(mode) = msg.mode {
            self.mode = Some(mode);
        }

        if let Some(bots) = msg.bots {
            self.apply_bots(bots, owned);
        }

        if let Some(bot) = msg.bot {
            self.apply_tracked(bot);
        }
    }

    fn apply_map(&mut self, map: MapUpdate, owned: &OwnedBots) {
        let (size, tiles) = (map.size, map.tiles.len());
        let Some(mut view) = MapView::new(map) else {
            warn!(
                "Rejected map of {}x{} with {} tiles, keeping the previous one",
                size.0, size.1, tiles
            );
            return;
        };

        debug!("Map replaced ({}x{})", size.0, size.1);
        view.reindex(&self.bots, owned);

        self.camera = Some(view.center());
        self.map = Some(view);
    }

    fn apply_bots(&mut self, bots: BotsUpdate, owned: &OwnedBots) {
        if let Some(map) = &mut self.map {
            map.reindex(&bots, owned);
        }

        if let Some(tracked) = &self.tracked {
            if tracked.following {
                if let Some(bot) = bots.get(&tracked.id) {
                    self.camera = Some(bot.pos);
                }
            }
        }

        self.bots = bots;
    }

    fn apply_tracked(&mut self, update: TrackedBotUpdate) {
        let Some(tracked) = &mut self.tracked else {
            return;
        };

        let (status, events) = match update {
            TrackedBotUpdate::Unknown => {
                debug!("Tracked bot {} is unknown", tracked.id);
                self.tracked = None;
                return;
            }
            TrackedBotUpdate::Queued {
                place,
                requeued,
                events,
            } => (TrackedStatus::Queued { place, requeued }, events),
            TrackedBotUpdate::Alive { age, serial, events } => {
                (TrackedStatus::Alive { age, serial }, events)
            }
            TrackedBotUpdate::Dead { events } => (TrackedStatus::Dead, events),
        };

        tracked.status = status;
        merge_events(&mut tracked.events, events);
    }
}

/// Append `incoming`, order newest first (stable for equal timestamps) and
/// keep at most [`MAX_EVENTS`]
pub fn merge_events(events: &mut Vec<BotEvent>, incoming: Vec<BotEvent>) {
    if incoming.is_empty() {
        return;
    }

    events.extend(incoming);
    events.sort_by(|a, b| b.at.cmp(&a.at));
    events.truncate(MAX_EVENTS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::Dir;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn event(secs: i64, msg: &str) -> BotEvent {
        BotEvent {
            at: t(secs),
            msg: msg.to_string(),
        }
    }

    fn map(w: u32, h: u32, tile: u32) -> MapUpdate {
        MapUpdate {
            size: (w, h),
            tiles: vec![tile; (w * h) as usize],
        }
    }

    fn bot(x: i32, y: i32, age: u64) -> BotUpdate {
        BotUpdate {
            pos: (x, y),
            dir: Dir::Up,
            age,
        }
    }

    fn bots(entries: &[(&str, BotUpdate)]) -> BotsUpdate {
        entries
            .iter()
            .map(|(id, bot)| (BotId::from(*id), bot.clone()))
            .collect()
    }

    fn tracking(id: &str) -> WorldSnapshot {
        WorldSnapshot {
            tracked: Some(TrackedBot::new(BotId::from(id))),
            ..WorldSnapshot::new()
        }
    }

    #[test]
    fn test_map_replaced_wholesale() {
        let owned = OwnedBots::new("w1");
        let mut snapshot = WorldSnapshot::new();

        snapshot.apply(UpdateMessage { map: Some(map(4, 4, 1)), ..Default::default() }, &owned);
        snapshot.apply(UpdateMessage { map: Some(map(2, 6, 7)), ..Default::default() }, &owned);

        let view = snapshot.map.as_ref().unwrap();
        assert_eq!(view.size, (2, 6));
        assert_eq!(view.tiles, vec![7; 12]);
        assert_eq!(view.bots.len(), 12);
        assert_eq!(snapshot.camera, Some((1, 3)));
    }

    #[test]
    fn test_malformed_map_keeps_previous() {
        let owned = OwnedBots::new("w1");
        let mut snapshot = WorldSnapshot::new();
        snapshot.apply(UpdateMessage { map: Some(map(3, 3, 2)), ..Default::default() }, &owned);

        let huge = MapUpdate {
            size: (u32::MAX, u32::MAX),
            tiles: vec![],
        };
        snapshot.apply(UpdateMessage { map: Some(huge), ..Default::default() }, &owned);

        let short = MapUpdate {
            size: (4, 4),
            tiles: vec![0; 15],
        };
        snapshot.apply(UpdateMessage { map: Some(short), ..Default::default() }, &owned);

        let view = snapshot.map.as_ref().unwrap();
        assert_eq!(view.size, (3, 3));
        assert_eq!(view.tiles, vec![2; 9]);
        assert_eq!(snapshot.camera, Some((2, 2)));
    }

    #[test]
    fn test_map_centre_rounds_up() {
        let owned = OwnedBots::new("w1");
        let mut snapshot = WorldSnapshot::new();

        snapshot.apply(UpdateMessage { map: Some(map(5, 3, 0)), ..Default::default() }, &owned);
        assert_eq!(snapshot.camera, Some((3, 2)));
    }

    #[test]
    fn test_bots_before_map_build_no_index() {
        let owned = OwnedBots::new("w1");
        let mut snapshot = WorldSnapshot::new();

        snapshot.apply(
            UpdateMessage {
                bots: Some(bots(&[("a", bot(1, 1, 5))])),
                ..Default::default()
            },
            &owned,
        );

        assert!(snapshot.map.is_none());
        assert_eq!(snapshot.bots.len(), 1);

        // The map arriving later indexes the bots already known
        snapshot.apply(UpdateMessage { map: Some(map(3, 3, 0)), ..Default::default() }, &owned);
        assert_eq!(
            snapshot.map.as_ref().unwrap().bot_at((1, 1)).map(|b| b.id.clone()),
            Some(BotId::from("a"))
        );
    }

    #[test]
    fn test_bots_reindexed_with_ownership() {
        let mut owned = OwnedBots::new("w1");
        owned.add(BotId::from("mine")).unwrap();

        let mut snapshot = WorldSnapshot::new();
        snapshot.apply(UpdateMessage { map: Some(map(4, 3, 0)), ..Default::default() }, &owned);
        snapshot.apply(
            UpdateMessage {
                bots: Some(bots(&[("mine", bot(3, 2, 1)), ("theirs", bot(0, 0, 1))])),
                ..Default::default()
            },
            &owned,
        );

        let view = snapshot.map.as_ref().unwrap();
        assert_eq!(view.bots[2 * 4 + 3], Some(MapBot { id: BotId::from("mine"), known: true }));
        assert_eq!(view.bots[0], Some(MapBot { id: BotId::from("theirs"), known: false }));

        // Bots that moved away leave no trace in the index
        snapshot.apply(
            UpdateMessage {
                bots: Some(bots(&[("mine", bot(1, 1, 2))])),
                ..Default::default()
            },
            &owned,
        );

        let view = snapshot.map.as_ref().unwrap();
        assert_eq!(view.bots.iter().flatten().count(), 1);
        assert!(view.bot_at((1, 1)).unwrap().known);
        assert!(view.bot_at((0, 0)).is_none());
    }

    #[test]
    fn test_out_of_bounds_bot_ignored_in_index() {
        let owned = OwnedBots::new("w1");
        let mut snapshot = WorldSnapshot::new();

        snapshot.apply(UpdateMessage { map: Some(map(2, 2, 0)), ..Default::default() }, &owned);
        snapshot.apply(
            UpdateMessage {
                bots: Some(bots(&[("a", bot(5, 0, 1)), ("b", bot(-1, 0, 1))])),
                ..Default::default()
            },
            &owned,
        );

        assert_eq!(snapshot.bots.len(), 2);
        assert_eq!(snapshot.map.unwrap().bots.iter().flatten().count(), 0);
    }

    #[test]
    fn test_camera_follows_tracked_bot() {
        let owned = OwnedBots::new("w1");
        let mut snapshot = tracking("a");

        snapshot.apply(UpdateMessage { map: Some(map(10, 10, 0)), ..Default::default() }, &owned);
        snapshot.apply(
            UpdateMessage {
                bots: Some(bots(&[("a", bot(7, 2, 1)), ("b", bot(1, 1, 1))])),
                ..Default::default()
            },
            &owned,
        );
        assert_eq!(snapshot.camera, Some((7, 2)));

        // Not following: camera stays
        snapshot.tracked.as_mut().unwrap().following = false;
        snapshot.apply(
            UpdateMessage {
                bots: Some(bots(&[("a", bot(8, 2, 2))])),
                ..Default::default()
            },
            &owned,
        );
        assert_eq!(snapshot.camera, Some((7, 2)));
    }

    #[test]
    fn test_tracked_update_ignored_without_tracking() {
        let owned = OwnedBots::new("w1");
        let mut snapshot = WorldSnapshot::new();

        snapshot.apply(
            UpdateMessage {
                bot: Some(TrackedBotUpdate::Dead { events: vec![] }),
                ..Default::default()
            },
            &owned,
        );

        assert!(snapshot.tracked.is_none());
    }

    #[test]
    fn test_unknown_clears_tracking() {
        let owned = OwnedBots::new("w1");
        let mut snapshot = tracking("a");

        snapshot.apply(
            UpdateMessage {
                bot: Some(TrackedBotUpdate::Unknown),
                ..Default::default()
            },
            &owned,
        );

        assert!(snapshot.tracked.is_none());
    }

    #[test]
    fn test_status_replaced_identity_kept() {
        let owned = OwnedBots::new("w1");
        let mut snapshot = tracking("a");
        snapshot.tracked.as_mut().unwrap().following = false;

        snapshot.apply(
            UpdateMessage {
                bot: Some(TrackedBotUpdate::Queued {
                    place: 3,
                    requeued: false,
                    events: vec![event(0, "queued")],
                }),
                ..Default::default()
            },
            &owned,
        );
        snapshot.apply(
            UpdateMessage {
                bot: Some(TrackedBotUpdate::Alive {
                    age: 4,
                    serial: vec![1, 2],
                    events: vec![event(5, "spawned")],
                }),
                ..Default::default()
            },
            &owned,
        );

        let tracked = snapshot.tracked.unwrap();
        assert_eq!(tracked.id, BotId::from("a"));
        assert!(!tracked.following);
        assert_eq!(tracked.status, TrackedStatus::Alive { age: 4, serial: vec![1, 2] });
        assert_eq!(
            tracked.events.iter().map(|e| e.msg.as_str()).collect::<Vec<_>>(),
            vec!["spawned", "queued"]
        );
    }

    #[test]
    fn test_event_log_bounded_and_sorted() {
        let owned = OwnedBots::new("w1");
        let mut snapshot = tracking("a");

        for batch in 0..5 {
            let events = (0..30).map(|i| event(batch * 30 + i, "tick")).collect();
            snapshot.apply(
                UpdateMessage {
                    bot: Some(TrackedBotUpdate::Dead { events }),
                    ..Default::default()
                },
                &owned,
            );
        }

        let events = &snapshot.tracked.unwrap().events;
        assert_eq!(events.len(), MAX_EVENTS);
        assert_eq!(events[0].at, t(149));
        assert!(events.windows(2).all(|w| w[0].at >= w[1].at));
    }

    #[test]
    fn test_event_ties_keep_arrival_order() {
        let mut events = vec![event(1, "first")];
        merge_events(&mut events, vec![event(1, "second"), event(2, "later")]);

        assert_eq!(
            events.iter().map(|e| e.msg.as_str()).collect::<Vec<_>>(),
            vec!["later", "first", "second"]
        );
    }
}
