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

//! Entry writer for the queue.
//!
//! The [`Appender`] is the queue's single writer role. It:
//! - Picks the cycle from the time source and rolls to a new segment when
//!   the cycle changes
//! - Frames and commits each entry into the active segment
//! - Flushes according to the configured [`FlushMode`]
//! - Returns the [`Address`] of every entry it writes
//!
//! ## Concurrency
//!
//! The appender may be shared between threads. Writes serialize through an
//! internal mutex with a bounded wait; writers in other processes serialize
//! on the segment file lock.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use snafu::{OptionExt, ensure};
use tracing::{debug, info};

use crate::{
    FlushMode, Result,
    clock::TimeSource,
    error::{ClosedSnafu, LockTimeoutSnafu, NoEntryAppendedSnafu},
    index::{Address, IndexCodec},
    segment::Appended,
    store::{SegmentHandle, SegmentStore},
};

/// Bytes written since the last flush.
#[derive(Debug)]
struct PendingFlush {
    from:       Option<u64>,
    bytes:      u64,
    last_flush: Instant,
}

impl PendingFlush {
    fn new() -> Self {
        Self {
            from:       None,
            bytes:      0,
            last_flush: Instant::now(),
        }
    }
}

#[derive(Debug)]
struct AppenderState {
    segment:    Option<SegmentHandle>,
    last_index: Option<Address>,
    pending:    PendingFlush,
    closed:     bool,
}

/// Writes entries to the queue.
#[derive(Debug)]
pub struct Appender {
    store:        Arc<SegmentStore>,
    clock:        Arc<dyn TimeSource>,
    codec:        IndexCodec,
    flush_mode:   FlushMode,
    lock_timeout: Duration,
    state:        Mutex<AppenderState>,
}

impl Appender {
    pub(crate) fn new(
        store: Arc<SegmentStore>,
        clock: Arc<dyn TimeSource>,
        flush_mode: FlushMode,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            codec: store.roll_cycle().codec(),
            store,
            clock,
            flush_mode,
            lock_timeout,
            state: Mutex::new(AppenderState {
                segment:    None,
                last_index: None,
                pending:    PendingFlush::new(),
                closed:     false,
            }),
        }
    }

    /// Append one entry and return its address.
    ///
    /// The entry is visible to tailers as soon as this returns.
    ///
    /// # Errors
    ///
    /// - `LockTimeout` if another writer holds the appender or the segment
    ///   file lock for longer than the configured timeout
    /// - `CapacityExceeded` if the active segment has no room left
    /// - `Closed` after [`close`](Self::close)
    pub fn write(&self, payload: impl AsRef<[u8]>) -> Result<Address> {
        let mut guard = self.lock_state()?;
        self.write_locked(&mut guard, payload.as_ref())
    }

    /// Append several entries without letting other writers interleave.
    ///
    /// Stops at the first failure; entries written before it stay committed.
    pub fn write_batch<I>(&self, payloads: I) -> Result<Vec<Address>>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let mut guard = self.lock_state()?;
        payloads
            .into_iter()
            .map(|payload| self.write_locked(&mut guard, payload.as_ref()))
            .collect()
    }

    /// Address returned by the most recent successful write.
    ///
    /// # Errors
    ///
    /// `NoEntryAppended` if nothing has been written through this appender.
    pub fn last_index_appended(&self) -> Result<Address> {
        self.state.lock().last_index.context(NoEntryAppendedSnafu)
    }

    /// Cycle of the segment currently being written, if any.
    pub fn cycle(&self) -> Option<u32> {
        self.state.lock().segment.as_ref().map(|segment| segment.cycle())
    }

    /// Flush and release the active segment. Later writes fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        if let Some(segment) = state.segment.take() {
            segment.flush()?;
            info!(cycle = segment.cycle(), "Appender closed");
            segment.release()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool { self.state.lock().closed }

    fn lock_state(&self) -> Result<parking_lot::MutexGuard<'_, AppenderState>> {
        self.state
            .try_lock_for(self.lock_timeout)
            .with_context(|| LockTimeoutSnafu {
                what:   "appender".to_string(),
                waited: self.lock_timeout,
            })
    }

    fn write_locked(&self, state: &mut AppenderState, payload: &[u8]) -> Result<Address> {
        ensure!(!state.closed, ClosedSnafu);

        let now_cycle = self.store.current_cycle(self.clock.as_ref());
        // A clock that steps backwards keeps writing to the newer cycle.
        let handle = match state.segment.take() {
            Some(handle) if handle.cycle() >= now_cycle => handle,
            previous => self.roll(previous, now_cycle, &mut state.pending)?,
        };
        let segment = state.segment.insert(handle);

        let appended = segment.append(payload, self.codec.max_sequence(), self.lock_timeout)?;
        let address = self.codec.encode(segment.cycle(), appended.sequence)?;
        self.flush_after_write(segment, &mut state.pending, appended)?;
        state.last_index = Some(address);

        debug!(
            %address,
            cycle = segment.cycle(),
            sequence = appended.sequence,
            size = appended.size,
            "Appended entry"
        );
        Ok(address)
    }

    /// Move to the segment for `now_cycle`, retiring `previous`.
    ///
    /// On first use the target is never older than the newest cycle already
    /// on disk, so addresses keep increasing across restarts.
    fn roll(
        &self,
        previous: Option<SegmentHandle>,
        now_cycle: u32,
        pending: &mut PendingFlush,
    ) -> Result<SegmentHandle> {
        let target = match &previous {
            Some(_) => now_cycle,
            None => self.store.last_cycle()?.map_or(now_cycle, |last| last.max(now_cycle)),
        };
        let next = self.store.acquire(target)?;

        if let Some(previous) = previous {
            info!(from = previous.cycle(), to = target, "Rolling to new cycle");
            previous.flush()?;
            previous.release()?;
        } else {
            debug!(cycle = target, "Appender attached to cycle");
        }
        *pending = PendingFlush::new();
        Ok(next)
    }

    fn flush_after_write(
        &self,
        segment: &SegmentHandle,
        pending: &mut PendingFlush,
        appended: Appended,
    ) -> Result<()> {
        match self.flush_mode {
            FlushMode::Async => Ok(()),
            FlushMode::Sync => segment.flush_range(appended.offset, appended.size),
            FlushMode::Batch { bytes, interval } => {
                let from = *pending.from.get_or_insert(appended.offset);
                pending.bytes += appended.size;
                if pending.bytes >= bytes as u64 || pending.last_flush.elapsed() >= interval {
                    let end = appended.offset + appended.size;
                    segment.flush_range(from, end - from)?;
                    *pending = PendingFlush::new();
                }
                Ok(())
            }
        }
    }
}
