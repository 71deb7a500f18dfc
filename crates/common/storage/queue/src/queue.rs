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

//! Main queue struct and lifecycle management.
//!
//! The [`Queue`] is the entry point of the library. It binds a directory to a
//! roll cycle and wire format, and:
//! - Shares one [`SegmentStore`] with every other queue on that directory
//! - Hands out the queue's [`Appender`] and any number of [`Tailer`]s
//! - Reports segment references still held when it closes
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueBuilder::new("/path/to/queue")
//!     .roll_cycle(RollCycle::Hourly)
//!     .build()?;
//!
//! let address = queue.acquire_appender()?.write(b"hello")?;
//!
//! let mut tailer = queue.create_tailer()?;
//! if tailer.move_to_index(address)? {
//!     let entry = tailer.read_next()?;
//! }
//!
//! queue.close()?;
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use snafu::ensure;
use tracing::{error, info, warn};

use crate::{
    QueueConfig, Result,
    appender::Appender,
    clock::TimeSource,
    error::ClosedSnafu,
    index::{Address, IndexCodec},
    listener::StoreFileListener,
    store::SegmentStore,
    tailer::Tailer,
};

/// A persistent append-only queue.
///
/// Creating appenders and tailers is thread-safe. The appender is shared:
/// every call to [`acquire_appender`](Self::acquire_appender) returns the
/// same writer until the queue closes.
pub struct Queue {
    config:    QueueConfig,
    store:     Arc<SegmentStore>,
    clock:     Arc<dyn TimeSource>,
    codec:     IndexCodec,
    appender:  Mutex<Option<Arc<Appender>>>,
    /// Listeners registered through the builder, detached on close.
    listeners: Vec<Arc<dyn StoreFileListener>>,
    closed:    AtomicBool,
}

impl Queue {
    pub(crate) fn new(
        config: QueueConfig,
        clock: Arc<dyn TimeSource>,
        listeners: Vec<Arc<dyn StoreFileListener>>,
    ) -> Result<Self> {
        let store = SegmentStore::open(&config)?;
        for listener in &listeners {
            store.add_listener(Arc::clone(listener));
        }

        let cycles = store.cycles()?;
        info!(
            path = ?store.dir(),
            roll_cycle = ?config.roll_cycle,
            segments = cycles.len(),
            first_cycle = ?cycles.first(),
            last_cycle = ?cycles.last(),
            "Queue opened"
        );

        Ok(Self {
            codec: config.roll_cycle.codec(),
            config,
            store,
            clock,
            appender: Mutex::new(None),
            listeners,
            closed: AtomicBool::new(false),
        })
    }

    /// The queue's writer.
    ///
    /// # Errors
    ///
    /// `Closed` once the queue has been closed.
    pub fn acquire_appender(&self) -> Result<Arc<Appender>> {
        ensure!(!self.is_closed(), ClosedSnafu);

        let mut slot = self.appender.lock();
        if let Some(appender) = slot.as_ref()
            && !appender.is_closed()
        {
            return Ok(Arc::clone(appender));
        }

        let appender = Arc::new(Appender::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config.flush_mode.clone(),
            self.config.lock_timeout,
        ));
        *slot = Some(Arc::clone(&appender));
        Ok(appender)
    }

    /// A new, unpositioned reader.
    ///
    /// # Errors
    ///
    /// `Closed` once the queue has been closed.
    pub fn create_tailer(&self) -> Result<Tailer> {
        ensure!(!self.is_closed(), ClosedSnafu);
        Ok(Tailer::new(Arc::clone(&self.store)))
    }

    /// Address of the oldest entry still on disk.
    pub fn first_index(&self) -> Result<Option<Address>> {
        for cycle in self.store.cycles()? {
            if let Some(segment) = self.store.acquire_existing(cycle)?
                && segment.refresh()? > 0
            {
                return self.codec.encode(cycle, 0).map(Some);
            }
        }
        Ok(None)
    }

    /// Address of the newest committed entry.
    pub fn last_index(&self) -> Result<Option<Address>> {
        for cycle in self.store.cycles()?.into_iter().rev() {
            if let Some(segment) = self.store.acquire_existing(cycle)? {
                let count = segment.refresh()?;
                if count > 0 {
                    return self.codec.encode(cycle, count - 1).map(Some);
                }
            }
        }
        Ok(None)
    }

    /// Cycle the queue's time source currently falls in.
    pub fn current_cycle(&self) -> u32 { self.store.current_cycle(self.clock.as_ref()) }

    pub fn first_cycle(&self) -> Result<Option<u32>> { self.store.first_cycle() }

    pub fn last_cycle(&self) -> Result<Option<u32>> { self.store.last_cycle() }

    /// Delete the segment files of every cycle before `cycle`.
    ///
    /// Returns the cycles whose files were removed.
    ///
    /// # Errors
    ///
    /// `SegmentInUse` for the first older cycle still referenced; cycles
    /// before it have already been removed.
    pub fn purge_cycles_before(&self, cycle: u32) -> Result<Vec<u32>> {
        let mut purged = Vec::new();
        for old in self.store.cycles()?.into_iter().filter(|c| *c < cycle) {
            if self.store.delete(old)? {
                purged.push(old);
            }
        }
        if !purged.is_empty() {
            info!(before = cycle, count = purged.len(), "Purged old cycles");
        }
        Ok(purged)
    }

    pub fn store(&self) -> &Arc<SegmentStore> { &self.store }

    pub fn config(&self) -> &QueueConfig { &self.config }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Close the appender, detach this queue's listeners and unmap idle
    /// segments.
    ///
    /// Returns the number of segment references still outstanding in the
    /// store. Anything other than zero means a tailer or appender on this
    /// directory is still holding a segment.
    ///
    /// # Errors
    ///
    /// Whatever closing the appender failed with. The listeners are
    /// detached regardless.
    pub fn close(&self) -> Result<usize> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(self.store.outstanding_references());
        }

        let appender = self.appender.lock().take();
        let closed = appender.map_or(Ok(()), |appender| appender.close());
        for listener in &self.listeners {
            self.store.remove_listener(listener);
        }
        closed?;
        self.store.evict_idle();

        let refs = self.store.outstanding_references();
        if refs > 0 {
            warn!(
                path = ?self.store.dir(),
                refs,
                live = ?self.store.live_segments(),
                "Queue closed with outstanding segment references"
            );
        } else {
            info!(path = ?self.store.dir(), "Queue closed");
        }
        Ok(refs)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if !self.is_closed()
            && let Err(e) = self.close()
        {
            error!(error = ?e, "Failed to close queue");
        }
    }
}
