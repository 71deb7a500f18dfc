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

//! Entry type and on-disk framing.
//!
//! ## On-Disk Entry Format
//!
//! Entries are stored back to back after the segment header:
//!
//! ```text
//! ┌─────────────────┬──────────────────────┬─────────────────┬──────────┐
//! │  Header (4B)    │   Payload (variable) │   CRC32 (4B)    │ Padding  │
//! │  little-endian  │   raw bytes          │   Full only     │ 0..3B    │
//! └─────────────────┴──────────────────────┴─────────────────┴──────────┘
//! ```
//!
//! - **Header**: bit 31 is the completion flag, bits 0..31 hold the payload
//!   length. The appender writes payload and trailer first and the header
//!   last, so a reader either sees a complete entry or a header that is
//!   zero / not flagged complete.
//! - **Payload**: opaque bytes.
//! - **CRC32**: checksum over length and payload, present only with
//!   [`WireType::Full`].
//! - **Padding**: zeros up to the next 4-byte boundary, so every header
//!   sits at an aligned offset and is published with one aligned store.

use bytes::Bytes;

use crate::{config::WireType, index::Address};

/// An entry read from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Where the entry lives; feed it back to
    /// [`Tailer::move_to_index`](crate::Tailer::move_to_index) to read it
    /// again.
    pub address: Address,

    /// The payload exactly as it was written.
    pub payload: Bytes,
}

/// Size of the entry header in bytes.
pub(crate) const HEADER_SIZE: u64 = 4;

/// Size of the CRC32 trailer in bytes.
pub(crate) const CRC_SIZE: u64 = 4;

/// Every frame starts on a multiple of this.
pub(crate) const FRAME_ALIGNMENT: u64 = 4;

/// Set in the header once the entry is fully written.
pub(crate) const COMPLETE_FLAG: u32 = 1 << 31;

/// Largest payload the header can describe.
pub const MAX_PAYLOAD_LEN: usize = (COMPLETE_FLAG - 1) as usize;

/// What a reader found in a header slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderState {
    /// Nothing written here yet.
    Empty,
    /// A writer has started but not finished this entry.
    Incomplete,
    /// A finished entry with the given payload length.
    Complete(u32),
}

#[inline]
pub(crate) const fn committed_header(length: u32) -> u32 { length | COMPLETE_FLAG }

#[inline]
pub(crate) const fn decode_header(word: u32) -> HeaderState {
    if word == 0 {
        HeaderState::Empty
    } else if word & COMPLETE_FLAG == 0 {
        HeaderState::Incomplete
    } else {
        HeaderState::Complete(word & !COMPLETE_FLAG)
    }
}

/// Total on-disk size of an entry with the given payload length, padding
/// included.
#[inline]
pub(crate) const fn frame_size(wire_type: WireType, payload_len: u64) -> u64 {
    let raw = match wire_type {
        WireType::Full => HEADER_SIZE + payload_len + CRC_SIZE,
        WireType::Minimal => HEADER_SIZE + payload_len,
    };
    (raw + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}
