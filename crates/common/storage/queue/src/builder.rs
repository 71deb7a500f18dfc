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

use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
    FlushMode, Queue, QueueConfig, Result, RollCycle, WireType,
    clock::{SystemTimeSource, TimeSource},
    listener::StoreFileListener,
};

pub struct QueueBuilder {
    config:      QueueConfig,
    time_source: Arc<dyn TimeSource>,
    listeners:   Vec<Arc<dyn StoreFileListener>>,
}

impl QueueBuilder {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self::from_config(QueueConfig {
            base_path: base_path.into(),
            ..Default::default()
        })
    }

    pub fn from_config(config: QueueConfig) -> Self {
        Self {
            config,
            time_source: Arc::new(SystemTimeSource),
            listeners: Vec::new(),
        }
    }

    pub fn roll_cycle(mut self, roll_cycle: RollCycle) -> Self {
        self.config.roll_cycle = roll_cycle;
        self
    }

    pub fn wire_type(mut self, wire_type: WireType) -> Self {
        self.config.wire_type = wire_type;
        self
    }

    /// Capacity of each new segment file. Every queue sharing a directory in
    /// this process must use the same size.
    pub fn segment_size(mut self, size: u64) -> Self {
        self.config.segment_size = size;
        self
    }

    /// Bound on waiting for the appender or a segment file lock.
    ///
    /// Segment file locks are taken by the directory's shared store, which
    /// keeps the timeout of the first queue that opened it.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    /// Clock used to pick the cycle of each write.
    pub fn time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Register a listener on the queue's segment store.
    pub fn store_file_listener(mut self, listener: Arc<dyn StoreFileListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<Queue> { Queue::new(self.config, self.time_source, self.listeners) }
}
