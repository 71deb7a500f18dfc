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

//! Bounded advisory file locks.
//!
//! Locks are taken per open file description, so two handles on the same
//! file conflict even inside one process.

use std::{
    fs::File,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use crossbeam::utils::Backoff;
use fs2::FileExt;
use snafu::ResultExt;
use tracing::warn;

use crate::{
    Result,
    error::{IoSnafu, LockTimeoutSnafu},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockKind {
    Shared,
    Exclusive,
}

/// Holds a file lock until dropped.
#[derive(Debug)]
pub(crate) struct FileLockGuard<'a> {
    file: &'a File,
    path: &'a Path,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            warn!(path = ?self.path, error = ?e, "Failed to unlock segment file");
        }
    }
}

/// Lock `file`, retrying until `timeout` has passed.
pub(crate) fn lock_file<'a>(
    file: &'a File,
    path: &'a Path,
    kind: LockKind,
    timeout: Duration,
) -> Result<FileLockGuard<'a>> {
    let started = Instant::now();
    let backoff = Backoff::new();

    loop {
        let attempt = match kind {
            LockKind::Shared => FileExt::try_lock_shared(file),
            LockKind::Exclusive => FileExt::try_lock_exclusive(file),
        };

        match attempt {
            Ok(()) => return Ok(FileLockGuard { file, path }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                let waited = started.elapsed();
                if waited >= timeout {
                    return LockTimeoutSnafu {
                        what: format!("{kind:?} lock on {}", path.display()),
                        waited,
                    }
                    .fail();
                }
                if backoff.is_completed() {
                    thread::sleep(Duration::from_millis(1));
                } else {
                    backoff.snooze();
                }
            }
            Err(e) => return Err(e).context(IoSnafu { path }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueError;

    #[test]
    fn test_exclusive_lock_times_out_while_held() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("locked.seg");
        let holder = File::create(&path).unwrap();
        let contender = File::open(&path).unwrap();

        let _held = lock_file(&holder, &path, LockKind::Exclusive, Duration::from_secs(1)).unwrap();

        let started = Instant::now();
        let err = lock_file(
            &contender,
            &path,
            LockKind::Exclusive,
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert!(matches!(err, QueueError::LockTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("locked.seg");
        let first = File::create(&path).unwrap();
        let second = File::open(&path).unwrap();

        drop(lock_file(&first, &path, LockKind::Exclusive, Duration::from_secs(1)).unwrap());
        lock_file(&second, &path, LockKind::Exclusive, Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("shared.seg");
        let first = File::create(&path).unwrap();
        let second = File::open(&path).unwrap();

        let _a = lock_file(&first, &path, LockKind::Shared, Duration::from_millis(50)).unwrap();
        let _b = lock_file(&second, &path, LockKind::Shared, Duration::from_millis(50)).unwrap();
    }
}
