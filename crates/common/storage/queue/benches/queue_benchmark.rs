// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Benchmarks for the persistent queue.
//!
//! Measures:
//! - Single entry append latency per flush mode
//! - Batch append performance
//! - Sequential (tailer) read throughput
//! - Random access through `move_to_index`

use std::{hint::black_box, sync::Arc, time::Duration};

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rollq_queue::{
    Address, Appender, FlushMode, ManualTimeSource, Queue, QueueBuilder, QueueError, RollCycle,
};
use tempfile::TempDir;

/// Entry sizes to benchmark (bytes)
const ENTRY_SIZES: &[usize] = &[64, 256, 1024, 4096];

/// Number of entries for batch/read tests
const BATCH_SIZE: usize = 10_000;

const SEGMENT_SIZE: u64 = 256 * 1024 * 1024;

const NOON: i64 = 1_768_392_000_000;

/// Queue on a manual clock so full segments can be rolled explicitly.
fn create_queue(temp_dir: &TempDir, flush_mode: FlushMode) -> (Queue, Arc<ManualTimeSource>) {
    let clock = Arc::new(ManualTimeSource::new(NOON));
    let queue = QueueBuilder::new(temp_dir.path())
        .roll_cycle(RollCycle::TestSecondly)
        .segment_size(SEGMENT_SIZE)
        .flush_mode(flush_mode)
        .time_source(clock.clone())
        .build()
        .unwrap();
    (queue, clock)
}

/// Write one entry, moving to the next cycle when the segment is full.
fn write_rolling(appender: &Appender, clock: &ManualTimeSource, entry: &[u8]) -> Address {
    match appender.write(entry) {
        Err(QueueError::CapacityExceeded { .. }) => {
            clock.advance(Duration::from_secs(1));
            appender.write(entry).unwrap()
        }
        result => result.unwrap(),
    }
}

fn bench_append_latency(c: &mut Criterion, name: &str, flush_mode: &FlushMode, sizes: &[usize]) {
    let mut group = c.benchmark_group(name);

    for &size in sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let (queue, clock) = create_queue(&temp_dir, flush_mode.clone());
            let appender = queue.acquire_appender().unwrap();
            let entry = vec![0xABu8; size];

            b.iter(|| write_rolling(&appender, &clock, black_box(&entry)));

            queue.close().unwrap();
        });
    }

    group.finish();
}

fn bench_append_latency_async(c: &mut Criterion) {
    bench_append_latency(c, "append_latency_async", &FlushMode::Async, ENTRY_SIZES);
}

fn bench_append_latency_sync(c: &mut Criterion) {
    bench_append_latency(c, "append_latency_sync", &FlushMode::Sync, &[64, 256, 1024]);
}

fn bench_append_latency_batch(c: &mut Criterion) {
    let mode = FlushMode::Batch {
        bytes:    64 * 1024,
        interval: Duration::from_millis(10),
    };
    bench_append_latency(c, "append_latency_batch", &mode, ENTRY_SIZES);
}

/// Benchmark `write_batch` against individual writes
fn bench_write_batch_api(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_batch_api");
    group.sample_size(20);

    let entry_size = 256;
    for &count in &[100, 1000, 5000] {
        group.throughput(Throughput::Bytes((entry_size * count) as u64));

        group.bench_with_input(BenchmarkId::new("individual", count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let temp_dir = TempDir::new().unwrap();
                    let (queue, _) = create_queue(&temp_dir, FlushMode::Async);
                    (temp_dir, queue, vec![0xABu8; entry_size])
                },
                |(temp_dir, queue, entry)| {
                    let appender = queue.acquire_appender().unwrap();
                    for _ in 0..count {
                        appender.write(black_box(&entry)).unwrap();
                    }
                    queue.close().unwrap();
                    drop(temp_dir);
                },
                BatchSize::PerIteration,
            );
        });

        group.bench_with_input(BenchmarkId::new("batch_api", count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let temp_dir = TempDir::new().unwrap();
                    let (queue, _) = create_queue(&temp_dir, FlushMode::Async);
                    let entries = vec![vec![0xABu8; entry_size]; count];
                    (temp_dir, queue, entries)
                },
                |(temp_dir, queue, entries)| {
                    let appender = queue.acquire_appender().unwrap();
                    appender.write_batch(black_box(entries)).unwrap();
                    queue.close().unwrap();
                    drop(temp_dir);
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

/// Fill a fresh queue with `BATCH_SIZE` entries of `size` bytes.
fn filled_queue(size: usize) -> (TempDir, Queue, Vec<Address>) {
    let temp_dir = TempDir::new().unwrap();
    let (queue, clock) = create_queue(&temp_dir, FlushMode::Async);
    let appender = queue.acquire_appender().unwrap();
    let entry = vec![0xABu8; size];
    let addresses = (0..BATCH_SIZE)
        .map(|_| write_rolling(&appender, &clock, &entry))
        .collect();
    (temp_dir, queue, addresses)
}

/// Benchmark sequential tailer read throughput
fn bench_tailer_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("tailer_read");
    group.sample_size(20);

    for &size in &[256, 1024, 4096] {
        group.throughput(Throughput::Bytes((size * BATCH_SIZE) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (_temp_dir, queue, _) = filled_queue(size);

            b.iter(|| {
                let mut tailer = queue.create_tailer().unwrap();
                let mut count = 0;
                while let Some(entry) = tailer.read_next().unwrap() {
                    black_box(entry);
                    count += 1;
                }
                assert_eq!(count, BATCH_SIZE);
            });

            queue.close().unwrap();
        });
    }

    group.finish();
}

/// Benchmark `move_to_index` followed by a read at scattered addresses
fn bench_random_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_access");

    let (_temp_dir, queue, addresses) = filled_queue(256);
    // Fixed stride through the address list instead of an RNG.
    let picks: Vec<Address> = (0..1000)
        .map(|i| addresses[(i * 7919) % addresses.len()])
        .collect();

    group.throughput(Throughput::Elements(picks.len() as u64));
    group.bench_function("move_to_index_and_read", |b| {
        let mut tailer = queue.create_tailer().unwrap();
        b.iter(|| {
            for address in &picks {
                assert!(tailer.move_to_index(*address).unwrap());
                black_box(tailer.read_next().unwrap());
            }
        });
    });

    group.finish();
    queue.close().unwrap();
}

criterion_group!(
    benches,
    bench_append_latency_async,
    bench_append_latency_sync,
    bench_append_latency_batch,
    bench_write_batch_api,
    bench_tailer_read,
    bench_random_access,
);

criterion_main!(benches);
