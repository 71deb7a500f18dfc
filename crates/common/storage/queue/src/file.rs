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

//! Memory-mapped segment files using mmap-io.
//!
//! ## Segment File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Header (64 bytes)                        │
//! ├──────────┬────────────┬────────────┬──────────┬──────────────┤
//! │ magic 4B │ version 4B │ cycle 4B   │ wire 1B  │ reserved     │
//! └──────────┴────────────┴────────────┴──────────┴──────────────┘
//! ┌──────────────────────────────────────────────────────────────┐
//! │              Entries (see `entry` module), then zeros         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The file is pre-allocated to its full capacity and the header is written
//! while holding an exclusive lock, so any process that can take a shared
//! lock afterwards sees a complete header.

use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use mmap_io::MemoryMappedFile;
use snafu::{ResultExt, ensure};

use crate::{
    Result, WireType,
    error::{InvalidSegmentSnafu, IoSnafu, MmapSnafu, QueueError},
    lock::{FileLockGuard, LockKind, lock_file},
};

/// Magic bytes identifying a segment file: "RQSG".
pub const SEGMENT_MAGIC: [u8; 4] = *b"RQSG";

/// Current segment format version.
pub const SEGMENT_VERSION: u32 = 1;

/// Size of the segment header; entries start at this offset.
pub const SEGMENT_HEADER_SIZE: u64 = 64;

/// A pre-allocated, memory-mapped segment file.
///
/// Reads and writes go through mmap-io's region API and may be issued from
/// several threads at once.
pub struct SegmentFile {
    mmap:      MemoryMappedFile,
    /// Kept open for advisory locking.
    file:      File,
    path:      PathBuf,
    cycle:     u32,
    wire_type: WireType,
    capacity:  u64,
}

impl SegmentFile {
    /// Open the segment for `cycle`, creating and initialising it first if
    /// the file does not exist yet.
    ///
    /// Returns the file and whether this call created it.
    pub fn open_or_create(
        path: &Path,
        cycle: u32,
        wire_type: WireType,
        capacity: u64,
        lock_timeout: Duration,
    ) -> Result<(Self, bool)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .context(IoSnafu { path })?;

        let created = {
            let _guard = lock_file(&file, path, LockKind::Exclusive, lock_timeout)?;
            let len = file.metadata().context(IoSnafu { path })?.len();
            if len == 0 {
                ensure!(
                    capacity > SEGMENT_HEADER_SIZE,
                    InvalidSegmentSnafu {
                        path,
                        reason: format!("capacity {capacity} leaves no room for entries"),
                    }
                );
                file.set_len(capacity).context(IoSnafu { path })?;
                write_header(&file, path, cycle, wire_type)?;
                true
            } else {
                false
            }
        };

        Self::map(file, path, cycle).map(|segment| (segment, created))
    }

    /// Open the segment for `cycle` if its file exists.
    pub fn open_existing(path: &Path, cycle: u32, lock_timeout: Duration) -> Result<Option<Self>> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(IoSnafu { path }),
        };

        {
            // Waits out a creator that is still writing the header.
            let _guard = lock_file(&file, path, LockKind::Shared, lock_timeout)?;
            let len = file.metadata().context(IoSnafu { path })?.len();
            ensure!(
                len > SEGMENT_HEADER_SIZE,
                InvalidSegmentSnafu {
                    path,
                    reason: format!("file is only {len} bytes"),
                }
            );
        }

        Self::map(file, path, cycle).map(Some)
    }

    fn map(file: File, path: &Path, cycle: u32) -> Result<Self> {
        let mmap = MemoryMappedFile::open_rw(path).map_err(|e| mmap_error(path, &e))?;
        let capacity = mmap.len();

        let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
        mmap.read_into(0, &mut header)
            .map_err(|e| mmap_error(path, &e))?;
        let wire_type = validate_header(&header, path, cycle)?;

        Ok(Self {
            mmap,
            file,
            path: path.to_path_buf(),
            cycle,
            wire_type,
            capacity,
        })
    }

    /// Write data at the specified offset.
    #[inline]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.mmap
            .update_region(offset, data)
            .map_err(|e| mmap_error(&self.path, &e))
    }

    /// Read data from the specified offset into the provided buffer.
    #[inline]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.mmap
            .read_into(offset, buf)
            .map_err(|e| mmap_error(&self.path, &e))
    }

    #[inline]
    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Take an advisory lock on the backing file.
    pub(crate) fn lock(&self, kind: LockKind, timeout: Duration) -> Result<FileLockGuard<'_>> {
        lock_file(&self.file, &self.path, kind, timeout)
    }

    /// Flush the whole mapping to the backing file.
    pub fn flush(&self) -> Result<()> { self.mmap.flush().map_err(|e| mmap_error(&self.path, &e)) }

    /// Flush a specific range to the backing file.
    pub fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
        self.mmap
            .flush_range(offset, len)
            .map_err(|e| mmap_error(&self.path, &e))
    }

    /// Total file size, header included.
    pub fn capacity(&self) -> u64 { self.capacity }

    pub fn cycle(&self) -> u32 { self.cycle }

    pub fn wire_type(&self) -> WireType { self.wire_type }

    pub fn path(&self) -> &Path { &self.path }
}

fn mmap_error(path: &Path, err: &impl std::fmt::Display) -> QueueError {
    MmapSnafu {
        path,
        message: err.to_string(),
    }
    .build()
}

fn write_header(file: &File, path: &Path, cycle: u32, wire_type: WireType) -> Result<()> {
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&SEGMENT_MAGIC);
    header[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&cycle.to_le_bytes());
    header[12] = wire_type.to_byte();

    let mut writer = file;
    writer
        .seek(SeekFrom::Start(0))
        .context(IoSnafu { path })?;
    writer.write_all(&header).context(IoSnafu { path })?;
    writer.sync_data().context(IoSnafu { path })
}

fn validate_header(header: &[u8], path: &Path, cycle: u32) -> Result<WireType> {
    let invalid = |reason: String| InvalidSegmentSnafu { path, reason }.build();

    if header[0..4] != SEGMENT_MAGIC {
        return Err(invalid(format!("bad magic {:?}", &header[0..4])));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != SEGMENT_VERSION {
        return Err(invalid(format!("unsupported version {version}")));
    }

    let stored_cycle = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if stored_cycle != cycle {
        return Err(invalid(format!(
            "header names cycle {stored_cycle}, expected {cycle}"
        )));
    }

    WireType::from_byte(header[12]).ok_or_else(|| invalid(format!("unknown wire type {}", header[12])))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_create_segment_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("a.seg");

        let (file, created) =
            SegmentFile::open_or_create(&path, 7, WireType::Full, 4096, TIMEOUT).unwrap();
        assert!(created);
        assert_eq!(file.capacity(), 4096);
        assert_eq!(file.cycle(), 7);
        assert_eq!(file.wire_type(), WireType::Full);
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_keeps_header_and_data() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("a.seg");

        {
            let (file, _) =
                SegmentFile::open_or_create(&path, 3, WireType::Minimal, 4096, TIMEOUT).unwrap();
            file.write_at(SEGMENT_HEADER_SIZE, b"Hello, World!").unwrap();
            file.flush().unwrap();
        }

        let (file, created) =
            SegmentFile::open_or_create(&path, 3, WireType::Full, 8192, TIMEOUT).unwrap();
        assert!(!created);
        assert_eq!(file.wire_type(), WireType::Minimal);
        assert_eq!(file.capacity(), 4096);

        let mut buf = [0u8; 13];
        file.read_at(SEGMENT_HEADER_SIZE, &mut buf).unwrap();
        assert_eq!(&buf, b"Hello, World!");
    }

    #[test]
    fn test_open_existing_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("missing.seg");
        assert!(SegmentFile::open_existing(&path, 1, TIMEOUT).unwrap().is_none());
    }

    #[test]
    fn test_open_existing_rejects_wrong_cycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("a.seg");
        SegmentFile::open_or_create(&path, 1, WireType::Full, 4096, TIMEOUT).unwrap();

        let err = SegmentFile::open_existing(&path, 2, TIMEOUT)
            .err()
            .expect("cycle mismatch must be rejected");
        assert!(matches!(err, QueueError::InvalidSegment { .. }));
    }

    #[test]
    fn test_open_existing_rejects_foreign_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("a.seg");
        std::fs::write(&path, vec![0xABu8; 1024]).unwrap();

        let err = SegmentFile::open_existing(&path, 1, TIMEOUT)
            .err()
            .expect("foreign file must be rejected");
        assert!(matches!(err, QueueError::InvalidSegment { .. }));
    }

    #[test]
    fn test_capacity_must_exceed_header() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("tiny.seg");
        let result = SegmentFile::open_or_create(&path, 1, WireType::Full, 32, TIMEOUT);
        assert!(matches!(result, Err(QueueError::InvalidSegment { .. })));
    }
}
