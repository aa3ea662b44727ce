use std::sync::Arc;

use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};
use rusqlite::{Connection, params};
use unread_core::config::StoreConfig;
use unread_core::db::open_in_memory;
use unread_core::{ItemSource, ManualClock, ReadState, ReadableItem, Reader, ReaderTable};

const POST: &str = "Post";

struct Tier {
    name: &'static str,
    readers: i64,
    posts: i64,
}

const TIERS: [Tier; 3] = [
    Tier {
        name: "small",
        readers: 10,
        posts: 200,
    },
    Tier {
        name: "medium",
        readers: 50,
        posts: 1_000,
    },
    Tier {
        name: "large",
        readers: 200,
        posts: 2_000,
    },
];

fn seeded(tier: &Tier) -> (Connection, ReadState) {
    let conn = open_in_memory(&StoreConfig::default()).expect("open store");
    conn.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY);
         CREATE TABLE posts (id INTEGER PRIMARY KEY, updated_at_us INTEGER NOT NULL);",
    )
    .expect("host schema");
    for id in 1..=tier.readers {
        conn.execute("INSERT INTO users (id) VALUES (?1)", params![id])
            .expect("user");
    }
    for id in 1..=tier.posts {
        conn.execute(
            "INSERT INTO posts (id, updated_at_us) VALUES (?1, ?2)",
            params![id, id * 1_000],
        )
        .expect("post");
    }

    let state = ReadState::builder()
        .collection(ItemSource::new(POST, "posts", "id", "updated_at_us").expect("source"))
        .expect("register")
        .readers(ReaderTable::new("users", "id").expect("readers"))
        .clock(Arc::new(ManualClock::new(tier.posts * 1_000 + 1)))
        .build()
        .expect("build");

    // Each reader has read a prefix of the posts plus every third post after it.
    for reader in 1..=tier.readers {
        let prefix = tier.posts * reader / (tier.readers + 1);
        let items: Vec<_> = (1..=tier.posts)
            .filter(|id| *id <= prefix || id % 3 == 0)
            .map(|id| ReadableItem::new(POST, id.to_string(), id * 1_000))
            .collect();
        state
            .mark_read(&conn, &Reader::new(reader), &items, POST)
            .expect("mark");
    }
    (conn, state)
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction.compact_all");
    group.sample_size(10);

    for tier in &TIERS {
        group.throughput(Throughput::Elements(u64::try_from(tier.readers).unwrap_or_default()));
        group.bench_with_input(BenchmarkId::new("cold", tier.name), tier, |b, tier| {
            b.iter_batched(
                || seeded(tier),
                |(conn, state)| black_box(state.compact_all(&conn, POST).expect("compact")),
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_unread_listing(c: &mut Criterion) {
    let mut group = c.benchmark_group("query.list_unread");

    for tier in &TIERS {
        let (conn, state) = seeded(tier);
        let reader = Reader::new(tier.readers / 2);
        group.bench_function(BenchmarkId::new("uncompacted", tier.name), |b| {
            b.iter(|| {
                let query = state.list_unread(&conn, &reader, POST).expect("query");
                black_box(query.count(&conn).expect("count"))
            });
        });

        state.compact_all(&conn, POST).expect("compact");
        group.bench_function(BenchmarkId::new("compacted", tier.name), |b| {
            b.iter(|| {
                let query = state.list_unread(&conn, &reader, POST).expect("query");
                black_box(query.count(&conn).expect("count"))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compaction, bench_unread_listing);
criterion_main!(benches);
