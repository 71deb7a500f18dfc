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

//! Persistent append-only record log on time-rolled, memory-mapped segments.
//!
//! One segment file exists per roll cycle. The [`Appender`] writes framed
//! entries into the current cycle's segment and returns an [`Address`] for
//! each; any number of [`Tailer`]s read forward, backward, or from an
//! arbitrary address. Segments are reference counted by the
//! [`SegmentStore`], which notifies [`StoreFileListener`]s when mappings are
//! created and dropped.

mod appender;
mod builder;
mod clock;
mod config;
mod crc;
mod entry;
mod error;
mod file;
mod index;
mod listener;
mod lock;
mod path;
mod queue;
mod segment;
mod store;
mod tailer;

pub use appender::Appender;
pub use builder::QueueBuilder;
pub use clock::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use config::{FlushMode, QueueConfig, RollCycle, WireType};
pub use entry::{Entry, MAX_PAYLOAD_LEN};
pub use error::{QueueError, Result};
pub use file::{SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, SEGMENT_VERSION};
pub use index::{Address, IndexCodec, MAX_SEQUENCE_BITS, MIN_SEQUENCE_BITS};
pub use listener::{ReferenceCountingListener, StoreFileListener};
pub use path::{SEGMENT_FILE_SUFFIX, segment_file_name, segment_file_path};
pub use queue::Queue;
pub use segment::Segment;
pub use store::{SegmentHandle, SegmentStore};
pub use tailer::{Tailer, TailerDirection, TailerState};
