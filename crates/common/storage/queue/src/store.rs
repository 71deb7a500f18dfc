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

//! Cycle to segment mapping with reference counting.
//!
//! ## Lifecycle
//!
//! ```text
//!   acquire(c) ──► mapping created ──► on_acquired(c)        refs = 1
//!   acquire(c) ──► existing mapping reused                   refs = 2
//!   release    ──►                                           refs = 1
//!   release    ──► mapping parked idle ──► on_released(c)    refs = 0
//!   acquire(c) ──► idle mapping revived ──► on_acquired(c)   refs = 1
//! ```
//!
//! There is at most one mapped [`Segment`] per cycle in a process: queues
//! opened on the same directory share one store through a process-wide
//! registry.
//!
//! Opening a segment file (create, lock, map, scan) happens outside the
//! store's table lock. The cycle is marked as opening meanwhile, so other
//! threads asking for it wait on that cycle alone while every other cycle
//! stays available.
//!
//! Released mappings are kept in a small idle cache so that a reader
//! bouncing across a roll, or `first_index`/`last_index` walking the
//! cycles, does not remap and rescan the file every time. The oldest idle mapping
//! is flushed and unmapped once more than [`IDLE_SEGMENTS`] are parked.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    ops::Deref,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, RwLock};
use snafu::{ResultExt, ensure};
use tracing::{debug, error, info};

use crate::{
    QueueConfig, Result, RollCycle, TailerDirection, WireType,
    clock::TimeSource,
    error::{
        IncompatibleStoreSnafu, InvalidSegmentSnafu, IoSnafu, LockTimeoutSnafu,
        ReferenceUnderflowSnafu, SegmentInUseSnafu,
    },
    file::SegmentFile,
    listener::StoreFileListener,
    path::{scan_cycles, segment_file_path},
    segment::Segment,
};

/// Unreferenced mappings kept per store before the oldest is unmapped.
pub const IDLE_SEGMENTS: usize = 4;

/// Stores shared by every queue of this process, keyed by canonical directory.
static STORES: Lazy<Mutex<HashMap<PathBuf, Weak<SegmentStore>>>> = Lazy::new(Default::default);

/// Released once the thread opening a cycle has published or abandoned it.
#[derive(Default)]
struct OpenGate {
    done: Mutex<bool>,
    cond: Condvar,
}

impl OpenGate {
    fn wait(&self, cycle: u32, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let mut done = self.done.lock();
        while !*done {
            let left = timeout.saturating_sub(started.elapsed());
            if self.cond.wait_for(&mut done, left).timed_out() && !*done {
                return LockTimeoutSnafu {
                    what:   format!("segment {cycle} being opened by another thread"),
                    waited: started.elapsed(),
                }
                .fail();
            }
        }
        Ok(())
    }

    fn finish(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

enum Slot {
    /// Mapped; idle when its reference count is zero.
    Mapped(Arc<Segment>),
    Opening(Arc<OpenGate>),
}

/// Outcome of looking a cycle up in the table.
enum Claim {
    /// Already mapped; one reference taken.
    Ready(Arc<Segment>),
    /// Another thread is opening it.
    Wait(Arc<OpenGate>),
    /// This thread must open it, reviving the idle mapping if there is one.
    Open(Arc<OpenGate>, Option<Arc<Segment>>),
}

#[derive(Default)]
struct Slots {
    map:  HashMap<u32, Slot>,
    /// Idle cycles, least recently released first.
    idle: VecDeque<u32>,
}

impl Slots {
    fn claim(&mut self, cycle: u32) -> Claim {
        match self.map.get(&cycle) {
            Some(Slot::Opening(gate)) => return Claim::Wait(Arc::clone(gate)),
            Some(Slot::Mapped(segment)) if segment.ref_count() > 0 => {
                segment.retain();
                return Claim::Ready(Arc::clone(segment));
            }
            _ => {}
        }

        let gate = Arc::new(OpenGate::default());
        let idle = match self.map.insert(cycle, Slot::Opening(Arc::clone(&gate))) {
            Some(Slot::Mapped(segment)) => {
                self.idle.retain(|c| *c != cycle);
                Some(segment)
            }
            _ => None,
        };
        Claim::Open(gate, idle)
    }

    fn mapped(&self) -> impl Iterator<Item = &Arc<Segment>> {
        self.map.values().filter_map(|slot| match slot {
            Slot::Mapped(segment) => Some(segment),
            Slot::Opening(_) => None,
        })
    }

    /// References held on `cycle`, or `None` if nothing holds it.
    fn busy(&self, cycle: u32) -> Option<usize> {
        match self.map.get(&cycle)? {
            Slot::Mapped(segment) => Some(segment.ref_count()).filter(|refs| *refs > 0),
            Slot::Opening(_) => Some(0),
        }
    }

    fn take_idle(&mut self, cycle: u32) -> Option<Arc<Segment>> {
        if self.busy(cycle).is_some() {
            return None;
        }
        self.idle.retain(|c| *c != cycle);
        match self.map.remove(&cycle)? {
            Slot::Mapped(segment) => Some(segment),
            Slot::Opening(_) => None,
        }
    }

    /// Unlink idle mappings beyond the `keep` most recent.
    fn shrink_idle(&mut self, keep: usize) -> Vec<Arc<Segment>> {
        let mut evicted = Vec::new();
        while self.idle.len() > keep {
            let Some(cycle) = self.idle.pop_front() else {
                break;
            };
            if let Some(Slot::Mapped(segment)) = self.map.remove(&cycle) {
                evicted.push(segment);
            }
        }
        evicted
    }
}

/// Owns the mapped segments of one queue directory.
pub struct SegmentStore {
    dir:          PathBuf,
    roll_cycle:   RollCycle,
    wire_type:    WireType,
    segment_size: u64,
    lock_timeout: Duration,
    slots:        Mutex<Slots>,
    listeners:    RwLock<Vec<Arc<dyn StoreFileListener>>>,
}

impl SegmentStore {
    /// Return this process's store for `config.base_path`, creating the
    /// directory and the store if needed.
    ///
    /// The first queue to open a directory fixes its `lock_timeout`; later
    /// queues sharing the store inherit it.
    ///
    /// # Errors
    ///
    /// `IncompatibleStore` if a live store for the same directory uses a
    /// different roll cycle, wire type or segment size.
    pub fn open(config: &QueueConfig) -> Result<Arc<Self>> {
        let base = &config.base_path;
        std::fs::create_dir_all(base).context(IoSnafu { path: base })?;
        let dir = base.canonicalize().context(IoSnafu { path: base })?;

        let mut stores = STORES.lock();
        stores.retain(|_, store| store.strong_count() > 0);

        if let Some(store) = stores.get(&dir).and_then(Weak::upgrade) {
            ensure!(
                store.roll_cycle == config.roll_cycle,
                IncompatibleStoreSnafu {
                    path:   &dir,
                    reason: format!(
                        "opened with {:?}, already in use with {:?}",
                        config.roll_cycle, store.roll_cycle
                    ),
                }
            );
            ensure!(
                store.wire_type == config.wire_type,
                IncompatibleStoreSnafu {
                    path:   &dir,
                    reason: format!(
                        "opened with {:?} framing, already in use with {:?}",
                        config.wire_type, store.wire_type
                    ),
                }
            );
            ensure!(
                store.segment_size == config.segment_size,
                IncompatibleStoreSnafu {
                    path:   &dir,
                    reason: format!(
                        "opened with {} byte segments, already in use with {}",
                        config.segment_size, store.segment_size
                    ),
                }
            );
            if store.lock_timeout != config.lock_timeout {
                debug!(
                    path = ?dir,
                    requested = ?config.lock_timeout,
                    inherited = ?store.lock_timeout,
                    "Shared store keeps its original lock timeout"
                );
            }
            debug!(path = ?dir, "Sharing existing segment store");
            return Ok(store);
        }

        let store = Arc::new(Self {
            dir:          dir.clone(),
            roll_cycle:   config.roll_cycle,
            wire_type:    config.wire_type,
            segment_size: config.segment_size,
            lock_timeout: config.lock_timeout,
            slots:        Mutex::new(Slots::default()),
            listeners:    RwLock::new(Vec::new()),
        });
        stores.insert(dir, Arc::downgrade(&store));

        info!(
            path = ?store.dir,
            roll_cycle = ?store.roll_cycle,
            wire_type = ?store.wire_type,
            segment_size = store.segment_size,
            "Segment store opened"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn roll_cycle(&self) -> RollCycle { self.roll_cycle }

    pub fn wire_type(&self) -> WireType { self.wire_type }

    pub fn segment_size(&self) -> u64 { self.segment_size }

    pub fn lock_timeout(&self) -> Duration { self.lock_timeout }

    /// Cycle the given clock currently falls in.
    pub fn current_cycle(&self, clock: &dyn TimeSource) -> u32 {
        self.roll_cycle.cycle_at(clock.now_millis())
    }

    /// Acquire the segment for `cycle`, creating its file if it does not
    /// exist.
    pub fn acquire(self: &Arc<Self>, cycle: u32) -> Result<SegmentHandle> {
        match self.checkout(cycle, true)? {
            Some(handle) => Ok(handle),
            None => InvalidSegmentSnafu {
                path:   segment_file_path(&self.dir, self.roll_cycle, cycle),
                reason: "segment file missing after creation",
            }
            .fail(),
        }
    }

    /// Acquire the segment for `cycle` only if its file exists.
    pub fn acquire_existing(self: &Arc<Self>, cycle: u32) -> Result<Option<SegmentHandle>> {
        self.checkout(cycle, false)
    }

    /// Release a handle explicitly, surfacing reference count errors.
    pub fn release(&self, handle: SegmentHandle) -> Result<()> { handle.release() }

    fn checkout(self: &Arc<Self>, cycle: u32, create: bool) -> Result<Option<SegmentHandle>> {
        loop {
            let claim = self.slots.lock().claim(cycle);
            match claim {
                Claim::Ready(segment) => return Ok(Some(self.handle(segment))),
                Claim::Wait(gate) => gate.wait(cycle, self.lock_timeout)?,
                Claim::Open(gate, idle) => {
                    let opened = self.open_segment(cycle, create, idle);
                    return self.publish(cycle, &gate, opened);
                }
            }
        }
    }

    /// Map `cycle` without holding the table lock.
    fn open_segment(
        &self,
        cycle: u32,
        create: bool,
        idle: Option<Arc<Segment>>,
    ) -> Result<Option<Arc<Segment>>> {
        let path = segment_file_path(&self.dir, self.roll_cycle, cycle);
        if let Some(segment) = idle {
            if path.exists() {
                debug!(cycle, ?path, "Reviving idle segment");
                return Ok(Some(segment));
            }
            debug!(cycle, ?path, "Dropping idle mapping of a removed file");
        }

        let file = if create {
            let (file, created) = SegmentFile::open_or_create(
                &path,
                cycle,
                self.wire_type,
                self.segment_size,
                self.lock_timeout,
            )?;
            if created {
                info!(cycle, ?path, "Created segment file");
            }
            file
        } else {
            let Some(file) = SegmentFile::open_existing(&path, cycle, self.lock_timeout)? else {
                return Ok(None);
            };
            file
        };

        let segment = Arc::new(Segment::new(file)?);
        debug!(
            cycle,
            path = ?segment.path(),
            watermark = segment.watermark(),
            "Mapped segment"
        );
        Ok(Some(segment))
    }

    /// Replace the opening marker of `cycle` with the outcome of opening it,
    /// then wake the threads waiting on it.
    fn publish(
        self: &Arc<Self>,
        cycle: u32,
        gate: &OpenGate,
        opened: Result<Option<Arc<Segment>>>,
    ) -> Result<Option<SegmentHandle>> {
        let segment = match opened {
            Ok(Some(segment)) => segment,
            abandoned => {
                self.slots.lock().map.remove(&cycle);
                gate.finish();
                return abandoned.map(|_| None);
            }
        };

        // The handle is not out yet, so no release can overtake this.
        segment.retain();
        self.notify_acquired(&segment);
        self.slots
            .lock()
            .map
            .insert(cycle, Slot::Mapped(Arc::clone(&segment)));
        gate.finish();
        Ok(Some(self.handle(segment)))
    }

    fn handle(self: &Arc<Self>, segment: Arc<Segment>) -> SegmentHandle {
        SegmentHandle::new(segment, Arc::clone(self))
    }

    /// Drop one reference on `segment`, parking it idle when none remain.
    pub(crate) fn release_segment(&self, segment: &Arc<Segment>) -> Result<()> {
        let cycle = segment.cycle();
        let evicted = {
            let mut slots = self.slots.lock();
            let Some(remaining) = segment.try_release() else {
                error!(cycle, path = ?segment.path(), "Segment reference count would drop below zero");
                return ReferenceUnderflowSnafu { cycle }.fail();
            };
            if remaining > 0 {
                return Ok(());
            }

            let current = matches!(
                slots.map.get(&cycle),
                Some(Slot::Mapped(current)) if Arc::ptr_eq(current, segment)
            );
            if current {
                slots.idle.push_back(cycle);
                slots.shrink_idle(IDLE_SEGMENTS)
            } else {
                vec![Arc::clone(segment)]
            }
        };

        debug!(cycle, path = ?segment.path(), "Released segment");
        self.notify_released(segment);
        for segment in evicted {
            unmap(&segment);
        }
        Ok(())
    }

    /// Flush and unmap every idle segment.
    ///
    /// Returns how many mappings were dropped.
    pub fn evict_idle(&self) -> usize {
        let evicted = self.slots.lock().shrink_idle(0);
        for segment in &evicted {
            unmap(segment);
        }
        evicted.len()
    }

    /// Cycles that have a segment file, ascending.
    pub fn cycles(&self) -> Result<Vec<u32>> { scan_cycles(&self.dir, self.roll_cycle) }

    pub fn first_cycle(&self) -> Result<Option<u32>> { Ok(self.cycles()?.first().copied()) }

    pub fn last_cycle(&self) -> Result<Option<u32>> { Ok(self.cycles()?.last().copied()) }

    /// Nearest cycle with a segment file after `cycle` in `direction`.
    pub fn next_cycle(&self, cycle: u32, direction: TailerDirection) -> Result<Option<u32>> {
        let cycles = self.cycles()?;
        Ok(match direction {
            TailerDirection::Forward => cycles.into_iter().find(|c| *c > cycle),
            TailerDirection::Backward => cycles.into_iter().rev().find(|c| *c < cycle),
        })
    }

    /// Live handles on `cycle`, zero if it is not mapped.
    pub fn ref_count(&self, cycle: u32) -> usize { self.slots.lock().busy(cycle).unwrap_or(0) }

    /// Live handles across every mapped segment.
    pub fn outstanding_references(&self) -> usize {
        self.slots.lock().mapped().map(|s| s.ref_count()).sum()
    }

    /// Cycles with at least one live handle, ascending.
    pub fn live_segments(&self) -> Vec<u32> {
        let mut cycles: Vec<u32> = self
            .slots
            .lock()
            .mapped()
            .filter(|s| s.ref_count() > 0)
            .map(|s| s.cycle())
            .collect();
        cycles.sort_unstable();
        cycles
    }

    /// Cycles mapped with no live handle, least recently released first.
    pub fn idle_segments(&self) -> Vec<u32> { self.slots.lock().idle.iter().copied().collect() }

    /// Delete the segment file of an unreferenced cycle.
    ///
    /// Returns whether a file was removed.
    ///
    /// # Errors
    ///
    /// `SegmentInUse` if any handle on the cycle is alive or it is being
    /// opened.
    pub fn delete(&self, cycle: u32) -> Result<bool> {
        let mut slots = self.slots.lock();
        if let Some(refs) = slots.busy(cycle) {
            return SegmentInUseSnafu { cycle, refs }.fail();
        }
        drop(slots.take_idle(cycle));

        let path = segment_file_path(&self.dir, self.roll_cycle, cycle);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(cycle, ?path, "Deleted segment file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context(IoSnafu { path }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn StoreFileListener>) {
        self.listeners.write().push(listener);
    }

    /// Returns whether the listener was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn StoreFileListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    fn notify_acquired(&self, segment: &Segment) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_acquired(segment.cycle(), segment.path());
        }
    }

    fn notify_released(&self, segment: &Segment) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_released(segment.cycle(), segment.path());
        }
    }
}

fn unmap(segment: &Segment) {
    if let Err(e) = segment.flush() {
        error!(cycle = segment.cycle(), error = ?e, "Failed to flush evicted segment");
    }
    debug!(cycle = segment.cycle(), path = ?segment.path(), "Unmapped segment");
}

impl fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentStore")
            .field("dir", &self.dir)
            .field("roll_cycle", &self.roll_cycle)
            .field("wire_type", &self.wire_type)
            .field("live", &self.live_segments())
            .field("idle", &self.idle_segments())
            .field("listeners", &self.listeners.read().len())
            .finish_non_exhaustive()
    }
}

/// One reference on a mapped segment.
///
/// Dropping the handle releases the reference; [`release`](Self::release)
/// does the same but reports failures.
#[derive(Debug)]
pub struct SegmentHandle {
    segment:  Arc<Segment>,
    store:    Arc<SegmentStore>,
    released: bool,
}

impl SegmentHandle {
    fn new(segment: Arc<Segment>, store: Arc<SegmentStore>) -> Self {
        Self {
            segment,
            store,
            released: false,
        }
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.release_segment(&self.segment)
    }
}

impl Deref for SegmentHandle {
    type Target = Segment;

    fn deref(&self) -> &Segment { &self.segment }
}

impl Drop for SegmentHandle {
    fn drop(&mut self) {
        if !self.released {
            // Underflow is already logged by the store.
            let _ = self.store.release_segment(&self.segment);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{ManualTimeSource, QueueError, ReferenceCountingListener};

    fn config(dir: &Path) -> QueueConfig {
        QueueConfig {
            base_path: dir.to_path_buf(),
            roll_cycle: RollCycle::Hourly,
            segment_size: 4096,
            ..Default::default()
        }
    }

    fn store_with_listener(dir: &Path) -> (Arc<SegmentStore>, Arc<ReferenceCountingListener>) {
        let store = SegmentStore::open(&config(dir)).unwrap();
        let listener = Arc::new(ReferenceCountingListener::new());
        store.add_listener(listener.clone());
        (store, listener)
    }

    #[test]
    fn test_shared_acquire_and_release() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (store, listener) = store_with_listener(temp_dir.path());

        let first = store.acquire(491_220).unwrap();
        let second = store.acquire(491_220).unwrap();
        assert_eq!(store.ref_count(491_220), 2);
        assert_eq!(listener.acquired(), 1);

        store.release(first).unwrap();
        assert_eq!(store.ref_count(491_220), 1);
        assert_eq!(listener.released(), 0);
        assert!(matches!(
            store.delete(491_220),
            Err(QueueError::SegmentInUse { refs: 1, .. })
        ));

        store.release(second).unwrap();
        assert_eq!(store.ref_count(491_220), 0);
        assert_eq!(listener.released(), 1);
        assert_eq!(listener.balance(), 0);
        assert!(store.live_segments().is_empty());
    }

    #[test]
    fn test_remapping_fires_acquired_again() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (store, listener) = store_with_listener(temp_dir.path());

        drop(store.acquire(1).unwrap());
        drop(store.acquire(1).unwrap());

        assert_eq!(listener.acquired(), 2);
        assert_eq!(listener.released(), 2);
        assert_eq!(store.outstanding_references(), 0);
    }

    #[test]
    fn test_release_below_zero_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (store, listener) = store_with_listener(temp_dir.path());

        let handle = store.acquire(5).unwrap();
        let segment = Arc::clone(&handle.segment);
        store.release(handle).unwrap();

        assert!(matches!(
            store.release_segment(&segment),
            Err(QueueError::ReferenceUnderflow { cycle: 5 })
        ));
        assert_eq!(segment.ref_count(), 0);
        assert_eq!(listener.released(), 1);
    }

    #[test]
    fn test_acquire_existing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (store, listener) = store_with_listener(temp_dir.path());

        assert!(store.acquire_existing(10).unwrap().is_none());
        assert_eq!(listener.acquired(), 0);

        drop(store.acquire(10).unwrap());
        let handle = store.acquire_existing(10).unwrap().unwrap();
        assert_eq!(handle.cycle(), 10);
        assert_eq!(store.ref_count(10), 1);
    }

    #[test]
    fn test_delete_unreferenced_segment() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (store, _) = store_with_listener(temp_dir.path());

        drop(store.acquire(3).unwrap());
        assert_eq!(store.cycles().unwrap(), vec![3]);
        assert_eq!(store.idle_segments(), vec![3]);
        assert!(store.delete(3).unwrap());
        assert!(store.idle_segments().is_empty());
        assert!(!store.delete(3).unwrap());
        assert!(store.acquire_existing(3).unwrap().is_none());
    }

    #[test]
    fn test_idle_mapping_is_reused() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (store, listener) = store_with_listener(temp_dir.path());

        let first = store.acquire(1).unwrap();
        let segment = Arc::clone(&first.segment);
        drop(first);
        assert_eq!(store.idle_segments(), vec![1]);
        assert!(store.live_segments().is_empty());
        assert_eq!(listener.released(), 1);

        let second = store.acquire_existing(1).unwrap().unwrap();
        assert!(Arc::ptr_eq(&second.segment, &segment));
        assert!(store.idle_segments().is_empty());
        assert_eq!(listener.acquired(), 2);
        drop(second);

        assert_eq!(store.evict_idle(), 1);
        assert!(store.idle_segments().is_empty());
        let third = store.acquire(1).unwrap();
        assert!(!Arc::ptr_eq(&third.segment, &segment));
        drop(third);
        assert_eq!(listener.balance(), 0);
    }

    #[test]
    fn test_idle_cache_is_bounded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (store, listener) = store_with_listener(temp_dir.path());

        let total = u32::try_from(IDLE_SEGMENTS).unwrap() + 2;
        for cycle in 0..total {
            drop(store.acquire(cycle).unwrap());
        }

        assert_eq!(store.idle_segments(), (2..total).collect::<Vec<_>>());
        assert_eq!(listener.acquired(), u64::from(total));
        assert_eq!(listener.released(), u64::from(total));
    }

    #[test]
    fn test_concurrent_acquire_maps_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (store, listener) = store_with_listener(temp_dir.path());

        let handles: Vec<SegmentHandle> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| store.acquire(9).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(store.ref_count(9), 8);
        assert_eq!(listener.acquired(), 1);
        assert!(
            handles
                .windows(2)
                .all(|pair| Arc::ptr_eq(&pair[0].segment, &pair[1].segment))
        );

        drop(handles);
        assert_eq!(store.ref_count(9), 0);
        assert_eq!(listener.released(), 1);
    }

    #[test]
    fn test_other_cycles_stay_available_while_one_is_opening() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut slow = config(temp_dir.path());
        slow.lock_timeout = Duration::from_secs(5);
        let store = SegmentStore::open(&slow).unwrap();

        drop(store.acquire(1).unwrap());
        let mapped = store.acquire(2).unwrap();
        assert_eq!(store.evict_idle(), 1);

        // Stands in for another process still initialising cycle 1.
        let path = segment_file_path(store.dir(), RollCycle::Hourly, 1);
        let holder = std::fs::File::open(&path).unwrap();
        fs2::FileExt::lock_exclusive(&holder).unwrap();

        let (started_tx, started_rx) = crossbeam::channel::bounded(0);
        let opener = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                started_tx.send(()).unwrap();
                store.acquire_existing(1).map(|handle| handle.is_some())
            })
        };
        started_rx.recv().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        let other = store.acquire_existing(2).unwrap().unwrap();
        drop(store.acquire(3).unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(Arc::ptr_eq(&other.segment, &mapped.segment));
        assert!(!opener.is_finished());

        fs2::FileExt::unlock(&holder).unwrap();
        assert!(opener.join().unwrap().unwrap());
        assert_eq!(store.ref_count(1), 0);
    }

    #[test]
    fn test_cycle_navigation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (store, _) = store_with_listener(temp_dir.path());

        for cycle in [7, 3, 5] {
            drop(store.acquire(cycle).unwrap());
        }

        assert_eq!(store.first_cycle().unwrap(), Some(3));
        assert_eq!(store.last_cycle().unwrap(), Some(7));
        assert_eq!(store.next_cycle(3, TailerDirection::Forward).unwrap(), Some(5));
        assert_eq!(store.next_cycle(4, TailerDirection::Forward).unwrap(), Some(5));
        assert_eq!(store.next_cycle(7, TailerDirection::Forward).unwrap(), None);
        assert_eq!(store.next_cycle(7, TailerDirection::Backward).unwrap(), Some(5));
        assert_eq!(store.next_cycle(3, TailerDirection::Backward).unwrap(), None);
    }

    #[test]
    fn test_current_cycle_follows_clock() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (store, _) = store_with_listener(temp_dir.path());
        let clock = ManualTimeSource::new(1_768_392_000_000);

        assert_eq!(store.current_cycle(&clock), 491_220);
        clock.advance(Duration::from_secs(3600));
        assert_eq!(store.current_cycle(&clock), 491_221);
    }

    #[test]
    fn test_registry_shares_store_per_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let first = SegmentStore::open(&config(temp_dir.path())).unwrap();
        let second = SegmentStore::open(&config(&temp_dir.path().join("."))).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let mut daily = config(temp_dir.path());
        daily.roll_cycle = RollCycle::Daily;
        assert!(matches!(
            SegmentStore::open(&daily),
            Err(QueueError::IncompatibleStore { .. })
        ));

        let mut larger = config(temp_dir.path());
        larger.segment_size = 8192;
        assert!(matches!(
            SegmentStore::open(&larger),
            Err(QueueError::IncompatibleStore { .. })
        ));

        drop((first, second));
        assert!(SegmentStore::open(&daily).is_ok());
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl StoreFileListener for Counter {
        fn on_acquired(&self, _: u32, _: &Path) { self.0.fetch_add(1, Ordering::SeqCst); }

        fn on_released(&self, _: u32, _: &Path) {}
    }

    #[test]
    fn test_remove_listener() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(&config(temp_dir.path())).unwrap();
        let counter = Arc::new(Counter::default());
        let listener: Arc<dyn StoreFileListener> = counter.clone();

        store.add_listener(Arc::clone(&listener));
        drop(store.acquire(1).unwrap());
        assert!(store.remove_listener(&listener));
        assert!(!store.remove_listener(&listener));
        drop(store.acquire(2).unwrap());

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
