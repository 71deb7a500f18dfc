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

use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::index::IndexCodec;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub base_path:    PathBuf,
    pub roll_cycle:   RollCycle,
    pub wire_type:    WireType,
    /// Bytes pre-allocated for every segment file, header included.
    pub segment_size: u64,
    /// Upper bound for every lock wait (file locks and appender exclusion).
    pub lock_timeout: Duration,
    pub flush_mode:   FlushMode,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_path:    PathBuf::from("./queue_data"),
            roll_cycle:   RollCycle::Daily,
            wire_type:    WireType::Full,
            segment_size: 64 * 1024 * 1024,
            lock_timeout: Duration::from_secs(10),
            flush_mode:   FlushMode::Async,
        }
    }
}

/// How often the queue starts a new segment, and how the cycle is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollCycle {
    /// One segment per second; meant for exercising rolls in tests.
    TestSecondly,
    Minutely,
    Hourly,
    Daily,
}

impl RollCycle {
    /// Cycle duration in milliseconds.
    #[must_use]
    pub const fn length_millis(self) -> i64 {
        match self {
            Self::TestSecondly => 1_000,
            Self::Minutely => 60 * 1_000,
            Self::Hourly => 60 * 60 * 1_000,
            Self::Daily => 24 * 60 * 60 * 1_000,
        }
    }

    /// Width of the in-cycle sequence field of an address.
    #[must_use]
    pub const fn sequence_bits(self) -> u32 {
        match self {
            Self::TestSecondly => 24,
            Self::Minutely | Self::Hourly | Self::Daily => 32,
        }
    }

    #[must_use]
    pub const fn codec(self) -> IndexCodec { IndexCodec::from_valid_bits(self.sequence_bits()) }

    /// `strftime` pattern used for segment file stems.
    #[must_use]
    pub const fn format(self) -> &'static str {
        match self {
            Self::TestSecondly => "%Y%m%d-%H%M%S",
            Self::Minutely => "%Y%m%d-%H%M",
            Self::Hourly => "%Y%m%d-%H",
            Self::Daily => "%Y%m%d",
        }
    }

    /// Suffix that completes a stem to `%Y%m%d-%H%M%S` for parsing.
    const fn parse_padding(self) -> &'static str {
        match self {
            Self::TestSecondly => "",
            Self::Minutely => "00",
            Self::Hourly => "0000",
            Self::Daily => "-000000",
        }
    }

    /// Cycle containing the given wall-clock instant.
    ///
    /// Instants before the epoch or past the last representable cycle are
    /// clamped.
    #[must_use]
    pub fn cycle_at(self, millis: i64) -> u32 {
        let cycle = millis.div_euclid(self.length_millis());
        u32::try_from(cycle.max(0)).unwrap_or(u32::MAX)
    }

    /// Start of the cycle as a UTC timestamp.
    #[must_use]
    pub fn cycle_start(self, cycle: u32) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(i64::from(cycle) * self.length_millis())
    }

    /// Format a cycle as a file stem, e.g. `20260114-12` for hourly cycles.
    #[must_use]
    pub fn format_cycle(self, cycle: u32) -> String {
        self.cycle_start(cycle)
            .map(|start| start.format(self.format()).to_string())
            .unwrap_or_else(|| format!("cycle-{cycle}"))
    }

    /// Inverse of [`format_cycle`](Self::format_cycle). Returns `None` for
    /// stems that this roll cycle does not produce.
    #[must_use]
    pub fn parse_cycle(self, stem: &str) -> Option<u32> {
        let padded = format!("{stem}{}", self.parse_padding());
        let time = NaiveDateTime::parse_from_str(&padded, "%Y%m%d-%H%M%S").ok()?;
        let millis = time.and_utc().timestamp_millis();
        if millis < 0 || millis % self.length_millis() != 0 {
            return None;
        }
        let cycle = u32::try_from(millis / self.length_millis()).ok()?;
        (self.format_cycle(cycle) == stem).then_some(cycle)
    }
}

/// Entry framing written into segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    /// Length header, payload and a CRC32 trailer.
    Full,
    /// Length header and payload only.
    Minimal,
}

impl WireType {
    pub(crate) const fn to_byte(self) -> u8 {
        match self {
            Self::Full => 1,
            Self::Minimal => 2,
        }
    }

    pub(crate) const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Full),
            2 => Some(Self::Minimal),
            _ => None,
        }
    }
}

/// When the appender pushes written bytes to the backing file.
#[derive(Debug, Clone)]
pub enum FlushMode {
    /// Leave write-back to the OS.
    Async,
    /// Flush the written range after every entry.
    Sync,
    /// Flush once `bytes` are pending or `interval` has passed.
    Batch { bytes: usize, interval: Duration },
}
