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

//! One roll cycle's backing store.
//!
//! A [`Segment`] wraps a mapped [`SegmentFile`] with the bookkeeping every
//! reader and the writer share:
//!
//! - a **position table** mapping each committed sequence to its byte offset,
//!   rebuilt by scanning when the file is mapped and extended as entries are
//!   appended (by this process or, via [`refresh`](Segment::refresh), by
//!   another one);
//! - the **watermark**, the end of the last committed entry, which only ever
//!   moves forward;
//! - the **reference count** maintained by the
//!   [`SegmentStore`](crate::SegmentStore).
//!
//! Only committed entries enter the position table, so a reader can never be
//! handed a torn write.

use std::{
    fmt,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use bytes::Bytes;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use snafu::ensure;
use tracing::warn;

use crate::{
    Result, WireType,
    crc::{entry_crc, verify_entry_crc},
    entry::{HEADER_SIZE, HeaderState, MAX_PAYLOAD_LEN, committed_header, decode_header, frame_size},
    error::{CapacityExceededSnafu, CorruptedEntrySnafu, PayloadTooLargeSnafu, SequenceOverflowSnafu},
    file::{SEGMENT_HEADER_SIZE, SegmentFile},
    lock::LockKind,
};

#[derive(Debug)]
struct PositionTable {
    /// Byte offset of each committed entry, indexed by sequence.
    positions: Vec<u64>,
    /// End of the last committed entry.
    watermark: u64,
}

/// Where an appended entry landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Appended {
    pub sequence: u64,
    pub offset:   u64,
    pub size:     u64,
}

/// A mapped segment shared by the appender and any number of tailers.
pub struct Segment {
    file:  SegmentFile,
    refs:  AtomicUsize,
    table: RwLock<PositionTable>,
}

impl Segment {
    /// Wrap a mapped file and index the entries already committed in it.
    pub(crate) fn new(file: SegmentFile) -> Result<Self> {
        let segment = Self {
            file,
            refs: AtomicUsize::new(0),
            table: RwLock::new(PositionTable {
                positions: Vec::new(),
                watermark: SEGMENT_HEADER_SIZE,
            }),
        };
        segment.scan(&mut segment.table.write())?;
        Ok(segment)
    }

    pub fn cycle(&self) -> u32 { self.file.cycle() }

    pub fn path(&self) -> &Path { self.file.path() }

    pub fn capacity(&self) -> u64 { self.file.capacity() }

    pub fn wire_type(&self) -> WireType { self.file.wire_type() }

    /// End of the last committed entry known to this process.
    pub fn watermark(&self) -> u64 { self.table.read().watermark }

    /// Live handles on this segment.
    pub fn ref_count(&self) -> usize { self.refs.load(Ordering::Acquire) }

    /// Number of committed entries, after picking up anything appended since
    /// the last look.
    pub fn refresh(&self) -> Result<u64> {
        let table = self.table.upgradable_read();
        if !self.has_pending(table.watermark)? {
            return Ok(table.positions.len() as u64);
        }
        let mut table = RwLockUpgradableReadGuard::upgrade(table);
        self.scan(&mut table)?;
        Ok(table.positions.len() as u64)
    }

    /// Read the committed entry with the given in-cycle sequence.
    ///
    /// Returns `Ok(None)` if that entry has not been committed yet.
    pub fn read(&self, sequence: u64) -> Result<Option<Bytes>> {
        let Some(offset) = self.position(sequence)? else {
            return Ok(None);
        };

        let HeaderState::Complete(length) = decode_header(self.file.read_u32(offset)?) else {
            return Ok(None);
        };

        let payload_offset = offset + HEADER_SIZE;
        let mut payload = vec![0u8; length as usize];
        if length > 0 {
            self.file.read_at(payload_offset, &mut payload)?;
        }

        if self.wire_type() == WireType::Full {
            let stored = self.file.read_u32(payload_offset + u64::from(length))?;
            ensure!(
                verify_entry_crc(length, &payload, stored),
                CorruptedEntrySnafu {
                    cycle: self.cycle(),
                    sequence,
                }
            );
        }

        Ok(Some(Bytes::from(payload)))
    }

    /// Append one framed entry.
    ///
    /// Payload and trailer are written before the header, and the entry only
    /// becomes visible once the header carries the completion flag. The
    /// backing file is locked for the duration so writers in other processes
    /// cannot interleave.
    pub(crate) fn append(
        &self,
        payload: &[u8],
        max_sequence: u64,
        lock_timeout: Duration,
    ) -> Result<Appended> {
        ensure!(
            payload.len() <= MAX_PAYLOAD_LEN,
            PayloadTooLargeSnafu {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            }
        );

        let mut table = self.table.write();
        let _file_lock = self.file.lock(LockKind::Exclusive, lock_timeout)?;
        self.scan(&mut table)?;

        let sequence = table.positions.len() as u64;
        ensure!(
            sequence <= max_sequence,
            SequenceOverflowSnafu {
                cycle: self.cycle(),
                sequence,
                max: max_sequence,
            }
        );

        let length = payload.len() as u32;
        let offset = table.watermark;
        let size = frame_size(self.wire_type(), u64::from(length));
        let available = self.capacity().saturating_sub(offset);
        ensure!(
            size <= available,
            CapacityExceededSnafu {
                cycle: self.cycle(),
                required: size,
                available,
            }
        );

        let payload_offset = offset + HEADER_SIZE;
        if !payload.is_empty() {
            self.file.write_at(payload_offset, payload)?;
        }
        if self.wire_type() == WireType::Full {
            let crc = entry_crc(length, payload);
            self.file
                .write_at(payload_offset + u64::from(length), &crc.to_le_bytes())?;
        }
        self.file
            .write_at(offset, &committed_header(length).to_le_bytes())?;

        table.positions.push(offset);
        table.watermark = offset + size;

        Ok(Appended {
            sequence,
            offset,
            size,
        })
    }

    pub fn flush(&self) -> Result<()> { self.file.flush() }

    pub fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
        self.file.flush_range(offset, len)
    }

    pub(crate) fn retain(&self) -> usize { self.refs.fetch_add(1, Ordering::AcqRel) + 1 }

    /// Drop one reference. Returns `None` if the count is already zero.
    pub(crate) fn try_release(&self) -> Option<usize> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
            .ok()
            .map(|previous| previous - 1)
    }

    fn position(&self, sequence: u64) -> Result<Option<u64>> {
        let index = usize::try_from(sequence).unwrap_or(usize::MAX);
        if let Some(offset) = self.table.read().positions.get(index) {
            return Ok(Some(*offset));
        }
        self.refresh()?;
        Ok(self.table.read().positions.get(index).copied())
    }

    fn has_pending(&self, watermark: u64) -> Result<bool> {
        if watermark + HEADER_SIZE > self.capacity() {
            return Ok(false);
        }
        Ok(self.file.read_u32(watermark)? != 0)
    }

    /// Extend the position table with entries committed past the watermark.
    fn scan(&self, table: &mut PositionTable) -> Result<()> {
        loop {
            let offset = table.watermark;
            if offset + HEADER_SIZE > self.capacity() {
                return Ok(());
            }

            let length = match decode_header(self.file.read_u32(offset)?) {
                HeaderState::Empty | HeaderState::Incomplete => return Ok(()),
                HeaderState::Complete(length) => length,
            };

            let end = offset + frame_size(self.wire_type(), u64::from(length));
            if end > self.capacity() {
                warn!(
                    cycle = self.cycle(),
                    offset,
                    length,
                    "Entry length runs past the end of the segment, treating as not yet written"
                );
                return Ok(());
            }

            table.positions.push(offset);
            table.watermark = end;
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("cycle", &self.cycle())
            .field("path", &self.path())
            .field("refs", &self.ref_count())
            .field("watermark", &self.watermark())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::{QueueError, entry::COMPLETE_FLAG};

    const TIMEOUT: Duration = Duration::from_secs(1);
    const MAX_SEQ: u64 = u32::MAX as u64;

    fn segment_in(dir: &Path, wire_type: WireType, capacity: u64) -> Segment {
        let path = dir.join("20260114.seg");
        let (file, _) = SegmentFile::open_or_create(&path, 20_467, wire_type, capacity, TIMEOUT)
            .unwrap();
        Segment::new(file).unwrap()
    }

    #[test_case(WireType::Full ; "full framing")]
    #[test_case(WireType::Minimal ; "minimal framing")]
    fn test_append_and_read(wire_type: WireType) {
        let temp_dir = tempfile::tempdir().unwrap();
        let segment = segment_in(temp_dir.path(), wire_type, 4096);

        let first = segment.append(b"hello", MAX_SEQ, TIMEOUT).unwrap();
        let second = segment.append(b"", MAX_SEQ, TIMEOUT).unwrap();
        let third = segment.append(b"world!", MAX_SEQ, TIMEOUT).unwrap();

        assert_eq!(
            (first.sequence, second.sequence, third.sequence),
            (0, 1, 2)
        );
        assert_eq!(first.offset, SEGMENT_HEADER_SIZE);
        assert_eq!(second.offset, first.offset + first.size);
        assert_eq!(segment.watermark(), third.offset + third.size);
        assert_eq!(segment.refresh().unwrap(), 3);

        assert_eq!(segment.read(0).unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(segment.read(1).unwrap().unwrap().as_ref(), b"");
        assert_eq!(segment.read(2).unwrap().unwrap().as_ref(), b"world!");
        assert!(segment.read(3).unwrap().is_none());
    }

    #[test_case(WireType::Full ; "full framing")]
    #[test_case(WireType::Minimal ; "minimal framing")]
    fn test_headers_are_aligned(wire_type: WireType) {
        let temp_dir = tempfile::tempdir().unwrap();
        let segment = segment_in(temp_dir.path(), wire_type, 4096);

        for len in 0..16usize {
            let appended = segment.append(&vec![0xA5; len], MAX_SEQ, TIMEOUT).unwrap();
            assert_eq!(appended.offset % 4, 0, "payload of {len} bytes");
            assert_eq!(appended.size % 4, 0, "payload of {len} bytes");
        }
        assert_eq!(segment.watermark() % 4, 0);

        let reopened = segment_in(temp_dir.path(), wire_type, 4096);
        assert_eq!(reopened.refresh().unwrap(), 16);
        for len in 0..16usize {
            let payload = reopened.read(len as u64).unwrap().unwrap();
            assert_eq!(payload.as_ref(), vec![0xA5; len].as_slice());
        }
    }

    #[test]
    fn test_capacity_exceeded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let segment = segment_in(temp_dir.path(), WireType::Full, SEGMENT_HEADER_SIZE + 32);

        segment.append(&[1u8; 20], MAX_SEQ, TIMEOUT).unwrap();
        let err = segment.append(&[2u8; 20], MAX_SEQ, TIMEOUT).unwrap_err();
        assert!(matches!(
            err,
            QueueError::CapacityExceeded {
                required: 28,
                available: 4,
                ..
            }
        ));
        assert_eq!(segment.refresh().unwrap(), 1);
    }

    #[test]
    fn test_sequence_overflow() {
        let temp_dir = tempfile::tempdir().unwrap();
        let segment = segment_in(temp_dir.path(), WireType::Minimal, 4096);

        segment.append(b"a", 1, TIMEOUT).unwrap();
        segment.append(b"b", 1, TIMEOUT).unwrap();
        let err = segment.append(b"c", 1, TIMEOUT).unwrap_err();
        assert!(matches!(err, QueueError::SequenceOverflow { sequence: 2, .. }));
    }

    #[test]
    fn test_torn_write_is_not_visible() {
        let temp_dir = tempfile::tempdir().unwrap();
        let segment = segment_in(temp_dir.path(), WireType::Minimal, 4096);
        segment.append(b"done", MAX_SEQ, TIMEOUT).unwrap();
        let offset = segment.watermark();

        // Payload written, header missing.
        segment.file.write_at(offset + HEADER_SIZE, b"torn").unwrap();
        assert_eq!(segment.refresh().unwrap(), 1);
        assert!(segment.read(1).unwrap().is_none());

        // Header written without the completion flag.
        segment.file.write_at(offset, &4u32.to_le_bytes()).unwrap();
        assert_eq!(segment.refresh().unwrap(), 1);

        segment
            .file
            .write_at(offset, &(4u32 | COMPLETE_FLAG).to_le_bytes())
            .unwrap();
        assert_eq!(segment.refresh().unwrap(), 2);
        assert_eq!(segment.read(1).unwrap().unwrap().as_ref(), b"torn");
    }

    #[test]
    fn test_oversized_length_is_not_trusted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let segment = segment_in(temp_dir.path(), WireType::Minimal, 4096);
        let offset = segment.watermark();

        segment
            .file
            .write_at(offset, &(100_000u32 | COMPLETE_FLAG).to_le_bytes())
            .unwrap();
        assert_eq!(segment.refresh().unwrap(), 0);
        assert!(segment.read(0).unwrap().is_none());
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let segment = segment_in(temp_dir.path(), WireType::Full, 4096);
        let appended = segment.append(b"payload", MAX_SEQ, TIMEOUT).unwrap();

        segment
            .file
            .write_at(appended.offset + HEADER_SIZE, b"X")
            .unwrap();
        assert!(matches!(
            segment.read(0),
            Err(QueueError::CorruptedEntry { sequence: 0, .. })
        ));
    }

    #[test]
    fn test_second_mapping_sees_new_entries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let writer = segment_in(temp_dir.path(), WireType::Full, 4096);
        let reader = segment_in(temp_dir.path(), WireType::Full, 4096);

        assert_eq!(reader.refresh().unwrap(), 0);
        writer.append(b"one", MAX_SEQ, TIMEOUT).unwrap();
        writer.append(b"two", MAX_SEQ, TIMEOUT).unwrap();

        assert_eq!(reader.read(1).unwrap().unwrap().as_ref(), b"two");
        assert_eq!(reader.refresh().unwrap(), 2);

        // The reader's mapping can continue the sequence.
        let appended = reader.append(b"three", MAX_SEQ, TIMEOUT).unwrap();
        assert_eq!(appended.sequence, 2);
        assert_eq!(writer.read(2).unwrap().unwrap().as_ref(), b"three");
    }

    #[test]
    fn test_reopen_rebuilds_positions() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let segment = segment_in(temp_dir.path(), WireType::Full, 4096);
            for i in 0..10u64 {
                segment.append(&i.to_le_bytes(), MAX_SEQ, TIMEOUT).unwrap();
            }
            segment.flush().unwrap();
        }

        let segment = segment_in(temp_dir.path(), WireType::Full, 4096);
        assert_eq!(segment.refresh().unwrap(), 10);
        assert_eq!(segment.read(7).unwrap().unwrap().as_ref(), &7u64.to_le_bytes());
    }

    #[test]
    fn test_reference_count_never_negative() {
        let temp_dir = tempfile::tempdir().unwrap();
        let segment = segment_in(temp_dir.path(), WireType::Full, 4096);

        assert_eq!(segment.retain(), 1);
        assert_eq!(segment.retain(), 2);
        assert_eq!(segment.try_release(), Some(1));
        assert_eq!(segment.try_release(), Some(0));
        assert_eq!(segment.try_release(), None);
        assert_eq!(segment.ref_count(), 0);
    }
}
