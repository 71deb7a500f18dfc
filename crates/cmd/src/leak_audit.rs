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

//! Secondary leak check: which segment files does this process still map?
//!
//! Only Linux exposes the process mappings this reads. The in-process
//! counters on the segment store remain the authoritative answer.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use rollq_queue::SEGMENT_FILE_SUFFIX;

/// Segment files under `dir` that are still mapped into this process.
///
/// Returns `None` where process mappings cannot be inspected.
pub fn mapped_segments(dir: &Path) -> Option<Vec<PathBuf>> {
    let maps = read_process_maps()?;
    Some(segments_in_maps(&maps, dir))
}

#[cfg(target_os = "linux")]
fn read_process_maps() -> Option<String> {
    match std::fs::read_to_string("/proc/self/maps") {
        Ok(maps) => Some(maps),
        Err(e) => {
            tracing::warn!(error = %e, "cannot read /proc/self/maps");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn read_process_maps() -> Option<String> { None }

/// Distinct segment paths under `dir` in `/proc/<pid>/maps` formatted text.
fn segments_in_maps(maps: &str, dir: &Path) -> Vec<PathBuf> {
    let suffix = format!(".{SEGMENT_FILE_SUFFIX}");
    let found: BTreeSet<PathBuf> = maps
        .lines()
        // The pathname column is last and is the only one starting with '/'.
        .filter_map(|line| line.find('/').map(|start| line[start..].trim_end()))
        .filter(|path| path.ends_with(&suffix))
        .map(PathBuf::from)
        .filter(|path| path.starts_with(dir))
        .collect();
    found.into_iter().collect()
}
