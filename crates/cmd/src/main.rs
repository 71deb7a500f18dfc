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

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use crossbeam::channel::{bounded, unbounded};
use rollq_common_telemetry::{logging::init_tracing_subscriber, panic_hook::set_panic_hook};
use rollq_queue::{
    Address, ManualTimeSource, Queue, QueueBuilder, QueueError, ReferenceCountingListener,
    RollCycle, StoreFileListener, TailerDirection, WireType,
};
use snafu::{ResultExt, Whatever, ensure_whatever, whatever};
use tempfile::TempDir;
use tracing::{debug, info};

mod leak_audit;

#[derive(Debug, Parser)]
#[clap(
name = "rollq",
about= "Drive the rollq persistent queue",
author = env!("CARGO_PKG_AUTHORS"),
version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    MultipleReaders(MultipleReadersArgs),
    ResourceLeak(ResourceLeakArgs),
    StoreRelease(StoreReleaseArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RollCycleArg {
    Secondly,
    Minutely,
    Hourly,
    Daily,
}

impl From<RollCycleArg> for RollCycle {
    fn from(arg: RollCycleArg) -> Self {
        match arg {
            RollCycleArg::Secondly => Self::TestSecondly,
            RollCycleArg::Minutely => Self::Minutely,
            RollCycleArg::Hourly => Self::Hourly,
            RollCycleArg::Daily => Self::Daily,
        }
    }
}

/// Queue directory: the one given, or a temporary one removed on exit.
struct QueueDir {
    path:  PathBuf,
    _temp: Option<TempDir>,
}

impl QueueDir {
    fn new(dir: Option<PathBuf>) -> Result<Self, Whatever> {
        match dir {
            Some(path) => Ok(Self { path, _temp: None }),
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("rollq-")
                    .tempdir()
                    .whatever_context("failed to create a temporary queue directory")?;
                Ok(Self {
                    path:  temp.path().to_path_buf(),
                    _temp: Some(temp),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

One writer publishes the address of every entry on a channel; several
readers, each with its own queue on the same directory, take addresses off
the channel, seek to them and read the entry.
Every counter value must be read exactly once.
Examples:

rollq multiple-readers --entries 1000 --readers 5

")]
struct MultipleReadersArgs {
    /// Queue directory; a temporary one is used when omitted.
    #[arg(long)]
    dir:        Option<PathBuf>,
    #[arg(long, default_value_t = 1000)]
    entries:    u64,
    #[arg(long, default_value_t = 5)]
    readers:    usize,
    #[arg(long, value_enum, default_value_t = RollCycleArg::Hourly)]
    roll_cycle: RollCycleArg,
}

impl MultipleReadersArgs {
    fn open(&self, dir: &Path) -> Result<Queue, QueueError> {
        QueueBuilder::new(dir)
            .roll_cycle(self.roll_cycle.into())
            .build()
    }

    fn run(&self) -> Result<(), Whatever> {
        let dir = QueueDir::new(self.dir.clone())?;
        let queue = self
            .open(&dir.path)
            .whatever_context("failed to open queue")?;

        let (address_tx, address_rx) = bounded::<Address>(64);
        let (value_tx, value_rx) = unbounded::<u64>();

        let mut readers = Vec::with_capacity(self.readers);
        for id in 0..self.readers {
            let args = self.clone();
            let path = dir.path.clone();
            let address_rx = address_rx.clone();
            let value_tx = value_tx.clone();
            readers.push(thread::spawn(move || -> Result<usize, QueueError> {
                let queue = args.open(&path)?;
                let mut tailer = queue.create_tailer()?;
                let mut missed = 0;
                for address in address_rx {
                    let entry = if tailer.move_to_index(address)? {
                        tailer.read_next()?
                    } else {
                        None
                    };
                    match entry {
                        Some(entry) => {
                            let value = entry
                                .payload
                                .as_ref()
                                .try_into()
                                .map_or(0, u64::from_le_bytes);
                            // The receiver outlives every reader.
                            let _ = value_tx.send(value);
                        }
                        None => {
                            tracing::warn!(reader = id, %address, "bad index");
                            missed += 1;
                        }
                    }
                }
                tailer.close()?;
                queue.close()?;
                Ok(missed)
            }));
        }
        drop(value_tx);
        drop(address_rx);

        let appender = queue
            .acquire_appender()
            .whatever_context("failed to acquire appender")?;
        for value in 1..=self.entries {
            let address = appender
                .write(value.to_le_bytes())
                .whatever_context("write failed")?;
            if address_tx.send(address).is_err() {
                whatever!("every reader stopped before {value} was published");
            }
        }
        drop(address_tx);

        let mut missed = 0;
        for reader in readers {
            match reader.join() {
                Ok(result) => missed += result.whatever_context("reader failed")?,
                Err(_) => whatever!("reader thread panicked"),
            }
        }

        let mut seen: HashMap<u64, usize> = HashMap::new();
        for value in value_rx {
            *seen.entry(value).or_default() += 1;
        }
        let duplicated = seen.values().filter(|&&n| n > 1).count();
        info!(
            entries = self.entries,
            distinct = seen.len(),
            duplicated,
            missed,
            "multiple readers finished"
        );
        ensure_whatever!(
            missed == 0 && duplicated == 0 && seen.len() as u64 == self.entries,
            "expected each of {} values once, got {} distinct, {duplicated} duplicated, {missed} \
             missed",
            self.entries,
            seen.len()
        );

        close_and_audit(&queue)
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Writes a handful of (index, nanos) events to a secondly queue with minimal
framing, reads them back in order, closes the queue and checks that no
segment stays mapped.
Examples:

rollq resource-leak --events 10

")]
struct ResourceLeakArgs {
    /// Queue directory; a temporary one is used when omitted.
    #[arg(long)]
    dir:    Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    events: i32,
}

impl ResourceLeakArgs {
    fn run(&self) -> Result<(), Whatever> {
        let dir = QueueDir::new(self.dir.clone())?;
        let queue = QueueBuilder::new(&dir.path)
            .roll_cycle(RollCycle::TestSecondly)
            .wire_type(WireType::Minimal)
            .build()
            .whatever_context("failed to open queue")?;

        let appender = queue
            .acquire_appender()
            .whatever_context("failed to acquire appender")?;
        for index in 0..self.events {
            appender
                .write(encode_event(index))
                .whatever_context("write failed")?;
        }
        info!(events = self.events, "events written");

        let mut tailer = queue
            .create_tailer()
            .whatever_context("failed to create tailer")?;
        let mut expected = 0;
        while let Some(entry) = tailer.read_next().whatever_context("read failed")? {
            let Some((index, nanos)) = decode_event(&entry.payload) else {
                whatever!("malformed event at {}", entry.address);
            };
            ensure_whatever!(index == expected, "expected event {expected}, read {index}");
            debug!(index, nanos = format_args!("{nanos:08x}"), address = %entry.address, "event");
            expected += 1;
        }
        ensure_whatever!(
            expected == self.events,
            "read {expected} events out of {}",
            self.events
        );
        info!(events = expected, "events read");
        tailer.close().whatever_context("failed to close tailer")?;

        close_and_audit(&queue)
    }
}

/// `index` followed by the wall clock in nanoseconds.
fn encode_event(index: i32) -> [u8; 12] {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut payload = [0u8; 12];
    payload[..4].copy_from_slice(&index.to_le_bytes());
    payload[4..].copy_from_slice(&nanos.to_le_bytes());
    payload
}

fn decode_event(payload: &[u8]) -> Option<(i32, i64)> {
    let index = i32::from_le_bytes(payload.get(..4)?.try_into().ok()?);
    let nanos = i64::from_le_bytes(payload.get(4..12)?.try_into().ok()?);
    Some((index, nanos))
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Writes (index, nanos) events to a secondly queue with minimal framing,
moving the clock on by a second after every --per-cycle events, then reads
them backward from the end with a listener counting segment acquisitions
and releases. The count must return to zero once the queue is closed.
Examples:

rollq store-release --events 1000 --per-cycle 100

")]
struct StoreReleaseArgs {
    /// Queue directory; a temporary one is used when omitted.
    #[arg(long)]
    dir:       Option<PathBuf>,
    #[arg(long, default_value_t = 1000)]
    events:    i32,
    #[arg(long, default_value_t = 100)]
    per_cycle: i32,
}

/// Logs every segment mapping change.
#[derive(Debug)]
struct LoggingListener;

impl StoreFileListener for LoggingListener {
    fn on_acquired(&self, cycle: u32, path: &Path) {
        info!(cycle, path = %path.display(), "segment acquired");
    }

    fn on_released(&self, cycle: u32, path: &Path) {
        info!(cycle, path = %path.display(), "segment released");
    }
}

impl StoreReleaseArgs {
    fn run(&self) -> Result<(), Whatever> {
        let dir = QueueDir::new(self.dir.clone())?;
        let clock = Arc::new(ManualTimeSource::new(chrono::Utc::now().timestamp_millis()));
        let counter = Arc::new(ReferenceCountingListener::new());
        let queue = QueueBuilder::new(&dir.path)
            .roll_cycle(RollCycle::TestSecondly)
            .wire_type(WireType::Minimal)
            .time_source(clock.clone())
            .store_file_listener(counter.clone())
            .store_file_listener(Arc::new(LoggingListener))
            .build()
            .whatever_context("failed to open queue")?;

        ensure_whatever!(self.per_cycle > 0, "--per-cycle must be positive");
        let appender = queue
            .acquire_appender()
            .whatever_context("failed to acquire appender")?;
        for index in 0..self.events {
            appender
                .write(encode_event(index))
                .whatever_context("write failed")?;
            if (index + 1) % self.per_cycle == 0 {
                clock.advance(Duration::from_secs(1));
            }
        }
        info!(events = self.events, "events written");
        appender
            .close()
            .whatever_context("failed to close appender")?;

        let mut tailer = queue
            .create_tailer()
            .whatever_context("failed to create tailer")?;
        tailer.set_direction(TailerDirection::Backward);
        tailer.to_end().whatever_context("failed to seek to end")?;

        let mut next = self.events;
        while let Some(entry) = tailer.read_next().whatever_context("read failed")? {
            let index = decode_event(&entry.payload).map(|(index, _)| index);
            ensure_whatever!(
                next > 0 && index == Some(next - 1),
                "expected event {} reading backward, got {index:?}",
                next - 1
            );
            next -= 1;
        }
        ensure_whatever!(next == 0, "backward read stopped {next} events early");
        info!(
            events = self.events,
            acquired = counter.acquired(),
            released = counter.released(),
            "backward read finished"
        );
        tailer.close().whatever_context("failed to close tailer")?;

        close_and_audit(&queue)?;
        ensure_whatever!(
            counter.balance() == 0,
            "{} segment mappings left open",
            counter.balance()
        );
        Ok(())
    }
}

/// Close the queue, then compare the store's count with the OS view.
fn close_and_audit(queue: &Queue) -> Result<(), Whatever> {
    let residual = queue.close().whatever_context("failed to close queue")?;
    ensure_whatever!(residual == 0, "{residual} segment references still held");

    let dir = queue.store().dir();
    match leak_audit::mapped_segments(dir) {
        Some(mapped) if mapped.is_empty() => info!(dir = %dir.display(), "no segment mapped"),
        Some(mapped) => whatever!("segments still mapped: {mapped:?}"),
        None => info!("process mappings unavailable, skipped OS leak audit"),
    }
    Ok(())
}

fn main() -> Result<(), Whatever> {
    let _guards = init_tracing_subscriber("rollq");
    set_panic_hook();

    let cli = Cli::parse();
    match cli.commands {
        Commands::MultipleReaders(args) => args.run(),
        Commands::ResourceLeak(args) => args.run(),
        Commands::StoreRelease(args) => args.run(),
    }
}
