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

use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::{Result, RollCycle, error::IoSnafu};

/// Extension of segment files.
pub const SEGMENT_FILE_SUFFIX: &str = "seg";

/// Generates a segment file name, e.g. `20260114-12.seg` for hourly cycles.
pub fn segment_file_name(roll_cycle: RollCycle, cycle: u32) -> String {
    format!("{}.{SEGMENT_FILE_SUFFIX}", roll_cycle.format_cycle(cycle))
}

/// Returns the full path of a cycle's segment file: `base/<stem>.seg`.
pub fn segment_file_path<P: AsRef<Path>>(base: P, roll_cycle: RollCycle, cycle: u32) -> PathBuf {
    base.as_ref().join(segment_file_name(roll_cycle, cycle))
}

/// Extracts the cycle from a segment file path, if it is one of ours.
pub fn cycle_of_path(roll_cycle: RollCycle, path: &Path) -> Option<u32> {
    if path.extension().and_then(|s| s.to_str()) != Some(SEGMENT_FILE_SUFFIX) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    roll_cycle.parse_cycle(stem)
}

/// Lists the cycles that have a segment file under `base`, ascending.
///
/// Files that do not parse as a cycle of `roll_cycle` are ignored.
pub fn scan_cycles<P: AsRef<Path>>(base: P, roll_cycle: RollCycle) -> Result<Vec<u32>> {
    let base = base.as_ref();
    if !base.exists() {
        return Ok(Vec::new());
    }

    let mut cycles = Vec::new();
    for entry in std::fs::read_dir(base).context(IoSnafu { path: base })? {
        let entry = entry.context(IoSnafu { path: base })?;
        let path = entry.path();
        if path.is_file()
            && let Some(cycle) = cycle_of_path(roll_cycle, &path)
        {
            cycles.push(cycle);
        }
    }

    cycles.sort_unstable();
    Ok(cycles)
}
