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

//! Segment lifecycle notifications.

use std::{
    path::Path,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

use tracing::{debug, error};

/// Observer of segment mappings.
///
/// `on_acquired` fires once when a segment is mapped; `on_released` fires once
/// when the last handle on that mapping is released. Callbacks run on the
/// thread that triggered them, outside the store's internal locks.
pub trait StoreFileListener: Send + Sync {
    fn on_acquired(&self, cycle: u32, path: &Path);

    fn on_released(&self, cycle: u32, path: &Path);
}

/// Counts acquisitions and releases with atomics.
///
/// The balance is the number of mappings currently open. It should return to
/// zero once every appender and tailer has let go of its segments.
#[derive(Debug, Default)]
pub struct ReferenceCountingListener {
    acquired: AtomicU64,
    released: AtomicU64,
    balance:  AtomicI64,
}

impl ReferenceCountingListener {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            balance:  AtomicI64::new(0),
        }
    }

    pub fn acquired(&self) -> u64 { self.acquired.load(Ordering::Acquire) }

    pub fn released(&self) -> u64 { self.released.load(Ordering::Acquire) }

    /// Mappings acquired but not yet released.
    pub fn balance(&self) -> i64 { self.balance.load(Ordering::Acquire) }
}

impl StoreFileListener for ReferenceCountingListener {
    fn on_acquired(&self, cycle: u32, path: &Path) {
        self.acquired.fetch_add(1, Ordering::AcqRel);
        let balance = self.balance.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(cycle, ?path, balance, "Segment acquired");
    }

    fn on_released(&self, cycle: u32, path: &Path) {
        self.released.fetch_add(1, Ordering::AcqRel);
        let balance = self.balance.fetch_sub(1, Ordering::AcqRel) - 1;
        if balance < 0 {
            error!(cycle, ?path, balance, "Segment released more often than acquired");
        } else {
            debug!(cycle, ?path, balance, "Segment released");
        }
    }
}
