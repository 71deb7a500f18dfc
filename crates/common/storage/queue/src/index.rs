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

//! Entry addresses and the codec that builds them.
//!
//! ## Address Layout
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │  cycle (64 - seq_bits)       │  sequence (seq_bits)         │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! The cycle occupies the high bits, so comparing two addresses as plain
//! integers orders them first by cycle and then by sequence inside the cycle.
//! That is the same order in which the appender issues them.
//!
//! The sequence width is fixed by the roll cycle. Running out of sequence
//! space inside one cycle is reported as [`QueueError::SequenceOverflow`];
//! it never wraps into the next cycle's range.
//!
//! [`QueueError::SequenceOverflow`]: crate::QueueError::SequenceOverflow

use std::fmt;

use snafu::ensure;

use crate::{
    Result,
    error::{CycleOutOfRangeSnafu, InvalidSequenceBitsSnafu, SequenceOverflowSnafu},
};

/// Smallest supported sequence width.
pub const MIN_SEQUENCE_BITS: u32 = 8;

/// Largest supported sequence width. Cycles are `u32`, so 32 bits of
/// sequence always leave room for any cycle.
pub const MAX_SEQUENCE_BITS: u32 = 32;

/// Opaque, totally ordered position of one entry in the queue.
///
/// Addresses can be handed to other threads (or processes) as a plain `u64`
/// and turned back into a position with
/// [`Tailer::move_to_index`](crate::Tailer::move_to_index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address {
    /// Wrap a raw address value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self { Self(raw) }

    /// The raw 64-bit value.
    #[must_use]
    pub const fn as_u64(self) -> u64 { self.0 }
}

impl From<u64> for Address {
    fn from(raw: u64) -> Self { Self(raw) }
}

impl From<Address> for u64 {
    fn from(address: Address) -> Self { address.0 }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:#x}", self.0) }
}

/// Encodes `(cycle, sequence)` pairs into [`Address`]es and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCodec {
    sequence_bits: u32,
}

impl IndexCodec {
    /// Create a codec with the given sequence field width.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidSequenceBits`](crate::QueueError) if the
    /// width is outside `MIN_SEQUENCE_BITS..=MAX_SEQUENCE_BITS`.
    pub fn new(sequence_bits: u32) -> Result<Self> {
        ensure!(
            (MIN_SEQUENCE_BITS..=MAX_SEQUENCE_BITS).contains(&sequence_bits),
            InvalidSequenceBitsSnafu {
                bits: sequence_bits,
            }
        );
        Ok(Self { sequence_bits })
    }

    /// Codec for widths known to be valid at compile time.
    pub(crate) const fn from_valid_bits(sequence_bits: u32) -> Self { Self { sequence_bits } }

    #[must_use]
    pub const fn sequence_bits(&self) -> u32 { self.sequence_bits }

    /// Largest sequence number that fits in one cycle.
    #[must_use]
    pub const fn max_sequence(&self) -> u64 { (1u64 << self.sequence_bits) - 1 }

    /// Largest cycle that fits above the sequence field.
    #[must_use]
    pub const fn max_cycle(&self) -> u64 { u64::MAX >> self.sequence_bits }

    /// Combine a cycle and an in-cycle sequence into an address.
    ///
    /// # Errors
    ///
    /// Fails with `SequenceOverflow` if `sequence` does not fit the sequence
    /// field, or `CycleOutOfRange` if `cycle` does not fit above it.
    pub fn encode(&self, cycle: u32, sequence: u64) -> Result<Address> {
        ensure!(
            sequence <= self.max_sequence(),
            SequenceOverflowSnafu {
                cycle,
                sequence,
                max: self.max_sequence(),
            }
        );
        ensure!(
            u64::from(cycle) <= self.max_cycle(),
            CycleOutOfRangeSnafu {
                cycle: u64::from(cycle),
                max:   self.max_cycle(),
            }
        );
        Ok(Address((u64::from(cycle) << self.sequence_bits) | sequence))
    }

    /// Split an address into `(cycle, sequence)`.
    ///
    /// # Errors
    ///
    /// Fails with `CycleOutOfRange` if the cycle part does not fit a `u32`,
    /// which only happens for addresses this codec never produced.
    pub fn decode(&self, address: Address) -> Result<(u32, u64)> {
        let raw = address.as_u64();
        let cycle = raw >> self.sequence_bits;
        let sequence = raw & self.max_sequence();
        let cycle = u32::try_from(cycle).map_err(|_| {
            CycleOutOfRangeSnafu {
                cycle,
                max: u64::from(u32::MAX),
            }
            .build()
        })?;
        Ok((cycle, sequence))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;
    use crate::QueueError;

    #[test_case(16, 0, 0 ; "first entry of cycle zero")]
    #[test_case(16, 7, 65_535 ; "last sequence of a narrow cycle")]
    #[test_case(32, 474_810, 12 ; "hourly cycle")]
    #[test_case(32, u32::MAX, u64::from(u32::MAX) ; "largest cycle and sequence")]
    fn test_encode_decode(bits: u32, cycle: u32, sequence: u64) {
        let codec = IndexCodec::new(bits).unwrap();
        let address = codec.encode(cycle, sequence).unwrap();
        assert_eq!(codec.decode(address).unwrap(), (cycle, sequence));
    }

    #[test]
    fn test_address_layout() {
        let codec = IndexCodec::new(32).unwrap();
        let address = codec.encode(3, 5).unwrap();
        assert_eq!(address.as_u64(), (3u64 << 32) | 5);
        assert_eq!(address.to_string(), "0x300000005");
    }

    #[test]
    fn test_sequence_overflow_is_an_error() {
        let codec = IndexCodec::new(8).unwrap();
        assert!(codec.encode(1, 255).is_ok());
        let err = codec.encode(1, 256).unwrap_err();
        assert!(matches!(
            err,
            QueueError::SequenceOverflow {
                cycle: 1,
                sequence: 256,
                max: 255,
            }
        ));
    }

    #[test_case(0 ; "zero bits")]
    #[test_case(7 ; "below minimum")]
    #[test_case(33 ; "above maximum")]
    fn test_invalid_sequence_bits(bits: u32) {
        assert!(matches!(
            IndexCodec::new(bits),
            Err(QueueError::InvalidSequenceBits { .. })
        ));
    }

    #[test]
    fn test_decode_foreign_address() {
        let codec = IndexCodec::new(8).unwrap();
        assert!(matches!(
            codec.decode(Address::from_raw(u64::MAX)),
            Err(QueueError::CycleOutOfRange { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_order_matches_cycle_then_sequence(
            c1 in 0u32..1_000_000,
            s1 in 0u64..(1 << 20),
            c2 in 0u32..1_000_000,
            s2 in 0u64..(1 << 20),
        ) {
            let codec = IndexCodec::new(20).unwrap();
            let a1 = codec.encode(c1, s1).unwrap();
            let a2 = codec.encode(c2, s2).unwrap();
            prop_assert_eq!(a1.cmp(&a2), (c1, s1).cmp(&(c2, s2)));
        }
    }
}
