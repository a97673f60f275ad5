//! World reducer benchmarks
//!
//! Measures how long one update message takes to fold into the world state as
//! the number of live bots grows, and how long ranking them takes.
//!
//! Run with: cargo bench --bench reducer

use botworld_client::net::protocol::{
    BotId, BotUpdate, BotsUpdate, Dir, MapUpdate, ModeUpdate, UpdateMessage,
};
use botworld_client::store::OwnedBots;
use botworld_client::world::snapshot::WorldSnapshot;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const MAP_SIZE: u32 = 256;

fn bots(count: usize, tick: u64) -> BotsUpdate {
    (0..count)
        .map(|i| {
            let pos = (
                ((i * 7 + tick as usize) % MAP_SIZE as usize) as i32,
                ((i * 13) % MAP_SIZE as usize) as i32,
            );
            let bot = BotUpdate {
                pos,
                dir: Dir::Right,
                age: tick + i as u64,
            };
            (BotId::new(format!("bot-{}", i)), bot)
        })
        .collect()
}

fn scores(count: usize) -> ModeUpdate {
    ModeUpdate {
        scores: (0..count)
            .map(|i| (BotId::new(format!("bot-{}", i)), (i % 17) as u64))
            .collect(),
        ..Default::default()
    }
}

fn snapshot_with_map(owned: &OwnedBots) -> WorldSnapshot {
    let mut snapshot = WorldSnapshot::new();
    snapshot.apply(
        UpdateMessage {
            map: Some(MapUpdate {
                size: (MAP_SIZE, MAP_SIZE),
                tiles: vec![0; (MAP_SIZE * MAP_SIZE) as usize],
            }),
            ..Default::default()
        },
        owned,
    );
    snapshot
}

/// Benchmark applying a full bots update at various bot counts
fn bench_apply_bots(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_bots");
    group.sample_size(50);

    let owned = OwnedBots::new("bench");

    for count in [100, 500, 1000, 5000] {
        let mut snapshot = snapshot_with_map(&owned);
        let update = bots(count, 1);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("reindex", count), &count, |b, _| {
            b.iter(|| {
                snapshot.apply(
                    UpdateMessage {
                        bots: Some(black_box(update.clone())),
                        ..Default::default()
                    },
                    &owned,
                );
            })
        });
    }
    group.finish();
}

/// Benchmark ranking all live bots
fn bench_leaderboard(c: &mut Criterion) {
    let mut group = c.benchmark_group("leaderboard");
    group.sample_size(50);

    let owned = OwnedBots::new("bench");

    for count in [100, 500, 1000, 5000] {
        let mut snapshot = snapshot_with_map(&owned);
        snapshot.apply(
            UpdateMessage {
                mode: Some(scores(count)),
                bots: Some(bots(count, 1)),
                ..Default::default()
            },
            &owned,
        );

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("rank", count), &count, |b, _| {
            b.iter(|| black_box(botworld_client::world::leaderboard::leaderboard(&snapshot, &owned)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_apply_bots, bench_leaderboard);
criterion_main!(benches);
