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

//! Entry reader (tailer) for consuming from the queue.
//!
//! A [`Tailer`] is an independent cursor. It:
//! - Reads forward or backward, crossing cycle boundaries on its own
//! - Jumps to any [`Address`] with [`move_to_index`](Tailer::move_to_index)
//! - Holds at most one segment reference, released whenever it moves to
//!   another cycle, closes, or is dropped
//!
//! ## Cursor
//!
//! The cursor is a `(cycle, sequence)` pair. Reading forward returns the
//! entry at the cursor and moves to the next one; reading backward returns
//! the entry at the cursor (or the last entry of the cycle if the cursor is
//! past it) and moves to the previous one.
//!
//! ```text
//!  cycle 7          cycle 9
//!  [0][1][2]        [0][1]  ^
//!            forward ──►    │ to_end()
//!            ◄── backward   │
//! ```
//!
//! Missing addresses and the end of the log are not errors:
//! `move_to_index` returns `Ok(false)` and `read_next` returns `Ok(None)`.

use std::sync::Arc;

use bytes::Bytes;
use snafu::ensure;
use tracing::debug;

use crate::{
    Result,
    entry::Entry,
    error::ClosedSnafu,
    index::{Address, IndexCodec},
    store::{SegmentHandle, SegmentStore},
};

/// Direction of [`Tailer::read_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TailerDirection {
    #[default]
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TailerState {
    /// No position yet, or the last positioning attempt failed.
    Unpositioned,
    Positioned,
    /// Nothing further in the current direction.
    AtEnd,
}

/// An independent read cursor over the queue.
#[derive(Debug)]
pub struct Tailer {
    store:        Arc<SegmentStore>,
    codec:        IndexCodec,
    direction:    TailerDirection,
    state:        TailerState,
    segment:      Option<SegmentHandle>,
    cycle:        u32,
    sequence:     u64,
    /// The cursor sits before the first entry of `cycle`.
    before_start: bool,
    last_read:    Option<Address>,
    closed:       bool,
}

impl Tailer {
    pub(crate) fn new(store: Arc<SegmentStore>) -> Self {
        Self {
            codec: store.roll_cycle().codec(),
            store,
            direction: TailerDirection::Forward,
            state: TailerState::Unpositioned,
            segment: None,
            cycle: 0,
            sequence: 0,
            before_start: false,
            last_read: None,
            closed: false,
        }
    }

    pub fn direction(&self) -> TailerDirection { self.direction }

    /// Set the direction of later reads. Does not move the cursor.
    pub fn set_direction(&mut self, direction: TailerDirection) -> &mut Self {
        self.direction = direction;
        self
    }

    pub fn state(&self) -> TailerState { self.state }

    /// Address of the most recently returned entry.
    pub fn last_read_index(&self) -> Option<Address> { self.last_read }

    /// Address the cursor points at, if positioned.
    pub fn index(&self) -> Option<Address> {
        if self.segment.is_none() {
            return None;
        }
        let sequence = if self.before_start { 0 } else { self.sequence };
        self.codec.encode(self.cycle, sequence).ok()
    }

    /// Cycle of the segment currently held.
    pub fn current_cycle(&self) -> Option<u32> {
        self.segment.as_ref().map(|segment| segment.cycle())
    }

    /// Position the cursor on `address`.
    ///
    /// Returns `Ok(false)` if the address does not name an entry that exists
    /// or could be written next: its cycle has no segment file (never
    /// written, or deleted) or its sequence lies beyond the end of the
    /// cycle. The tailer is then unpositioned and holds no segment.
    pub fn move_to_index(&mut self, address: Address) -> Result<bool> {
        ensure!(!self.closed, ClosedSnafu);

        let Ok((cycle, sequence)) = self.codec.decode(address) else {
            self.unposition()?;
            return Ok(false);
        };

        if self.current_cycle() != Some(cycle) {
            self.unposition()?;
            match self.store.acquire_existing(cycle)? {
                Some(handle) => self.segment = Some(handle),
                None => {
                    debug!(%address, cycle, "No segment for address");
                    return Ok(false);
                }
            }
        }

        let count = match &self.segment {
            Some(segment) => segment.refresh()?,
            None => return Ok(false),
        };
        if sequence > count {
            debug!(%address, cycle, sequence, count, "Address beyond end of cycle");
            self.unposition()?;
            return Ok(false);
        }

        self.place(cycle, sequence, TailerState::Positioned);
        Ok(true)
    }

    /// Position the cursor on the first entry of the lowest cycle.
    ///
    /// Returns `Ok(false)` if the queue has no segments yet.
    pub fn to_start(&mut self) -> Result<bool> {
        ensure!(!self.closed, ClosedSnafu);
        match self.store.first_cycle()? {
            Some(cycle) if self.attach(cycle)? => {
                self.place(cycle, 0, TailerState::Positioned);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Position the cursor just past the last committed entry of the highest
    /// cycle, without reading.
    ///
    /// Returns `Ok(false)` if the queue has no segments yet.
    pub fn to_end(&mut self) -> Result<bool> {
        ensure!(!self.closed, ClosedSnafu);
        let Some(cycle) = self.store.last_cycle()? else {
            return Ok(false);
        };
        if !self.attach(cycle)? {
            return Ok(false);
        }
        let count = match &self.segment {
            Some(segment) => segment.refresh()?,
            None => return Ok(false),
        };
        self.place(cycle, count, TailerState::AtEnd);
        Ok(true)
    }

    /// Read the next entry in the current direction.
    ///
    /// An unpositioned tailer starts from [`to_start`](Self::to_start) when
    /// reading forward and from [`to_end`](Self::to_end) when reading
    /// backward. Returns `Ok(None)` when there is nothing further, including
    /// when the next entry is still being written.
    pub fn read_next(&mut self) -> Result<Option<Entry>> {
        ensure!(!self.closed, ClosedSnafu);

        if self.segment.is_none() {
            let positioned = match self.direction {
                TailerDirection::Forward => self.to_start()?,
                TailerDirection::Backward => self.to_end()?,
            };
            if !positioned {
                return Ok(None);
            }
        }

        match self.direction {
            TailerDirection::Forward => self.read_forward(),
            TailerDirection::Backward => self.read_backward(),
        }
    }

    /// Release the held segment. Later reads fail with `Closed`.
    pub fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.unposition()
    }

    fn read_forward(&mut self) -> Result<Option<Entry>> {
        if self.before_start {
            self.before_start = false;
            self.sequence = 0;
        }

        loop {
            let Some(segment) = self.segment.as_ref() else {
                return Ok(None);
            };

            if self.sequence < segment.refresh()? {
                let Some(payload) = segment.read(self.sequence)? else {
                    return Ok(None);
                };
                let address = self.codec.encode(self.cycle, self.sequence)?;
                self.sequence += 1;
                return Ok(Some(self.returned(address, payload)));
            }

            let Some(next) = self.store.next_cycle(self.cycle, TailerDirection::Forward)? else {
                self.state = TailerState::AtEnd;
                return Ok(None);
            };
            // An entry may have landed in this cycle before the roll.
            if segment.refresh()? > self.sequence {
                continue;
            }

            if !self.attach(next)? {
                self.state = TailerState::AtEnd;
                return Ok(None);
            }
            debug!(from = self.cycle, to = next, "Tailer rolled forward");
            self.place(next, 0, TailerState::Positioned);
        }
    }

    fn read_backward(&mut self) -> Result<Option<Entry>> {
        loop {
            let Some(segment) = self.segment.as_ref() else {
                return Ok(None);
            };

            let count = segment.refresh()?;
            if !self.before_start && count > 0 {
                let sequence = self.sequence.min(count - 1);
                let Some(payload) = segment.read(sequence)? else {
                    return Ok(None);
                };
                let address = self.codec.encode(self.cycle, sequence)?;
                if sequence == 0 {
                    self.before_start = true;
                    self.sequence = 0;
                } else {
                    self.sequence = sequence - 1;
                }
                return Ok(Some(self.returned(address, payload)));
            }

            let Some(previous) = self.store.next_cycle(self.cycle, TailerDirection::Backward)?
            else {
                self.before_start = true;
                self.state = TailerState::AtEnd;
                return Ok(None);
            };
            if !self.attach(previous)? {
                self.state = TailerState::AtEnd;
                return Ok(None);
            }
            debug!(from = self.cycle, to = previous, "Tailer rolled backward");
            // Past the end; clamped to the last entry on the next pass.
            self.place(previous, u64::MAX, TailerState::Positioned);
        }
    }

    fn returned(&mut self, address: Address, payload: Bytes) -> Entry {
        self.last_read = Some(address);
        self.state = TailerState::Positioned;
        Entry { address, payload }
    }

    /// Hold the segment for `cycle`, releasing any other one first.
    ///
    /// Returns `Ok(false)` if the cycle has no segment file.
    fn attach(&mut self, cycle: u32) -> Result<bool> {
        if self.current_cycle() == Some(cycle) {
            return Ok(true);
        }
        self.unposition()?;
        match self.store.acquire_existing(cycle)? {
            Some(handle) => {
                self.segment = Some(handle);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn place(&mut self, cycle: u32, sequence: u64, state: TailerState) {
        self.cycle = cycle;
        self.sequence = sequence;
        self.before_start = false;
        self.state = state;
    }

    fn unposition(&mut self) -> Result<()> {
        self.state = TailerState::Unpositioned;
        self.before_start = false;
        match self.segment.take() {
            Some(handle) => handle.release(),
            None => Ok(()),
        }
    }
}

impl Iterator for Tailer {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        self.read_next().transpose()
    }
}
