use std::time::Duration;

use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tempfile::tempdir;

use logd_dlog::{Dlog, EntryBody, FileId, LogEntry};
use logd_value::Node;

fn patch_entry(commit: u64, field_count: usize) -> LogEntry {
    LogEntry {
        commit,
        tx_seq: commit,
        last_commit: commit.saturating_sub(1),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 17, 0, 0, 0).unwrap(),
        scope: None,
        schema: None,
        body: EntryBody::Patch(Node::object(
            (0..field_count).map(|i| (format!("field{i}"), Node::int(i as i64))),
        )),
    }
}

fn append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    for field_count in [1usize, 16, 256] {
        let bytes = {
            let mut buf = Vec::new();
            patch_entry(1, field_count).write_to(&mut buf).unwrap();
            buf.len() as u64
        };
        group.throughput(Throughput::Bytes(bytes));
        group.bench_function(format!("fields/{field_count}"), |b| {
            let dir = tempdir().unwrap();
            let dlog = Dlog::open(dir.path(), FileId::A).unwrap();
            let mut commit = 0u64;
            b.iter_batched(
                || {
                    commit += 1;
                    patch_entry(commit, field_count)
                },
                |entry| dlog.append(&entry).unwrap(),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn read_positional(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let dlog = Dlog::open(dir.path(), FileId::A).unwrap();
    let positions: Vec<(FileId, u64)> = (1..=512)
        .map(|commit| dlog.append(&patch_entry(commit, 16)).unwrap())
        .collect();

    let mut at = 0usize;
    c.bench_function("read_entry_at", |b| {
        b.iter(|| {
            let (file, pos) = positions[at % positions.len()];
            at += 1;
            dlog.read_entry_at(file, pos, 0).unwrap()
        })
    });
}

fn config() -> Criterion {
    Criterion::default().measurement_time(Duration::from_secs(5))
}

criterion_group! {
    name = benches;
    config = config();
    targets = append, read_positional
}
criterion_main!(benches);
