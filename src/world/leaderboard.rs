use super::snapshot::WorldSnapshot;
use crate::net::protocol::BotId;
use crate::store::OwnedBots;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardRow {
    /// 1-based rank
    pub nth: usize,
    pub id: BotId,
    pub age: u64,
    pub score: u64,
    pub known: bool,
}

/// Rank all live bots: score desc, then age desc, then id desc.
///
/// Bots without a score entry count as 0. The order is total, so the result is
/// identical for identical input regardless of map iteration order.
pub fn leaderboard(snapshot: &WorldSnapshot, owned: &OwnedBots) -> Vec<LeaderboardRow> {
    let scores = snapshot.mode.as_ref().map(|mode| &mode.scores);

    let mut rows: Vec<LeaderboardRow> = snapshot
        .bots
        .iter()
        .map(|(id, bot)| LeaderboardRow {
            nth: 0,
            id: id.clone(),
            age: bot.age,
            score: scores.and_then(|s| s.get(id)).copied().unwrap_or(0),
            known: owned.has(id),
        })
        .collect();

    rows.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.age.cmp(&a.age))
            .then_with(|| b.id.cmp(&a.id))
    });

    for (idx, row) in rows.iter_mut().enumerate() {
        row.nth = idx + 1;
    }

    rows
}
