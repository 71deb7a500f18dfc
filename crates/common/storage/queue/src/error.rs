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

use std::{io, path::PathBuf, time::Duration};

use snafu::Snafu;

/// Queue operation errors.
///
/// Routine conditions (a bad address, the end of the log, an entry that is
/// not fully written yet) are reported through `Ok(false)` / `Ok(None)` by
/// the tailer and never surface here.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error on {}", path.display()))]
    Io { path: PathBuf, source: io::Error },

    /// Memory mapping operation failed.
    #[snafu(display("Mmap operation on {} failed: {message}", path.display()))]
    Mmap { path: PathBuf, message: String },

    /// A bounded wait on a file lock or the appender exclusion expired.
    #[snafu(display("Timed out after {waited:?} waiting for {what}"))]
    LockTimeout { what: String, waited: Duration },

    /// A segment reference was released more often than it was acquired.
    #[snafu(display("Reference count of cycle {cycle} dropped below zero"))]
    ReferenceUnderflow { cycle: u32 },

    /// The active segment has no room for the framed entry.
    #[snafu(display(
        "Segment for cycle {cycle} is full: entry needs {required} bytes, {available} available"
    ))]
    CapacityExceeded {
        cycle:     u32,
        required:  u64,
        available: u64,
    },

    /// More entries were written to a cycle than its sequence field holds.
    #[snafu(display("Sequence {sequence} in cycle {cycle} exceeds maximum {max}"))]
    SequenceOverflow { cycle: u32, sequence: u64, max: u64 },

    /// The cycle does not fit in the address bits left by the sequence field.
    #[snafu(display("Cycle {cycle} exceeds maximum {max}"))]
    CycleOutOfRange { cycle: u64, max: u64 },

    /// The sequence field width is outside the supported range.
    #[snafu(display("Unsupported sequence width of {bits} bits"))]
    InvalidSequenceBits { bits: u32 },

    /// Checksum mismatch detected on a committed entry.
    #[snafu(display("Corrupted entry {sequence} in cycle {cycle}"))]
    CorruptedEntry { cycle: u32, sequence: u64 },

    /// The segment file header is missing or does not match.
    #[snafu(display("Invalid segment file {}: {reason}", path.display()))]
    InvalidSegment { path: PathBuf, reason: String },

    /// The payload cannot be described by the length header.
    #[snafu(display("Payload of {len} bytes exceeds maximum {max}"))]
    PayloadTooLarge { len: usize, max: usize },

    /// `last_index_appended` was called before any successful write.
    #[snafu(display("No entry has been appended yet"))]
    NoEntryAppended,

    /// A segment cannot be deleted while handles to it are alive.
    #[snafu(display("Segment for cycle {cycle} is still referenced ({refs} handles)"))]
    SegmentInUse { cycle: u32, refs: usize },

    /// Two queues in one process disagree about a shared directory.
    #[snafu(display("Incompatible store for {}: {reason}", path.display()))]
    IncompatibleStore { path: PathBuf, reason: String },

    /// The appender or queue has been closed.
    #[snafu(display("Queue is closed"))]
    Closed,
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
