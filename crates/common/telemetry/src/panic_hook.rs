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

//! Panic reporting through `tracing`.
//!
//! With the `deadlock_detection` feature a background thread also polls
//! `parking_lot` for lock cycles, which covers the segment store and
//! appender locks.

#[cfg(feature = "deadlock_detection")]
use std::time::Duration;
use std::{
    panic::{self, PanicHookInfo},
    sync::atomic::{AtomicU64, Ordering},
};

use backtrace::Backtrace;

static PANICS: AtomicU64 = AtomicU64::new(0);

/// Number of panics reported since [`set_panic_hook`] was installed.
pub fn panic_count() -> u64 { PANICS.load(Ordering::Relaxed) }

/// Replace the panic handler with one that logs the panic, its location and
/// a backtrace as an `ERROR` event before running the previous handler.
pub fn set_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        report(info);
        default_hook(info);
    }));

    #[cfg(feature = "deadlock_detection")]
    spawn_deadlock_detector();
}

fn report(info: &PanicHookInfo<'_>) {
    PANICS.fetch_add(1, Ordering::Relaxed);
    let backtrace = format!("{:?}", Backtrace::new());
    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");
    match info.location() {
        Some(location) => tracing::error!(
            message = %info,
            thread,
            backtrace = %backtrace,
            panic.file = location.file(),
            panic.line = location.line(),
            panic.column = location.column(),
        ),
        None => tracing::error!(message = %info, thread, backtrace = %backtrace),
    }
}

#[cfg(feature = "deadlock_detection")]
fn spawn_deadlock_detector() {
    let spawned = std::thread::Builder::new()
        .name("deadlock-detector".to_string())
        .spawn(|| {
            loop {
                std::thread::sleep(Duration::from_secs(5));
                let deadlocks = parking_lot::deadlock::check_deadlock();
                if deadlocks.is_empty() {
                    continue;
                }

                tracing::error!("{} deadlocks detected", deadlocks.len());
                for (i, threads) in deadlocks.iter().enumerate() {
                    tracing::error!("Deadlock #{}", i);
                    for t in threads {
                        tracing::error!("Thread Id {:#?}", t.thread_id());
                        tracing::error!("{:#?}", t.backtrace());
                    }
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to start deadlock detector");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_counts_caught_panics() {
        set_panic_hook();
        let before = panic_count();
        let result = std::thread::spawn(|| panic!("segment worker failed")).join();
        assert!(result.is_err());
        assert!(panic_count() > before);
    }
}
