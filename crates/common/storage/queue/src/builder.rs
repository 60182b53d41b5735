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

use std::{path::PathBuf, sync::Arc};

use crate::{Dispatcher, FileQueue, HashAlgorithm, QueueConfig, Result, RetryPolicy};

pub struct FileQueueBuilder {
    config: QueueConfig,
}

impl FileQueueBuilder {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(dir: P, name: S) -> Self {
        Self {
            config: QueueConfig {
                dir: dir.into(),
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Starts from a deserialized configuration.
    pub fn from_config(config: QueueConfig) -> Self { Self { config } }

    pub fn max_file_size(mut self, size: u32) -> Self {
        self.config.max_file_size = size;
        self
    }

    pub fn max_file_num(mut self, num: u32) -> Self {
        self.config.max_file_num = num;
        self
    }

    pub fn buffered_push(mut self, buffered: bool) -> Self {
        self.config.buffered_push = buffered;
        self
    }

    pub fn buffered_poll(mut self, buffered: bool) -> Self {
        self.config.buffered_poll = buffered;
        self
    }

    pub fn hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.config.hash_algorithm = algorithm;
        self
    }

    pub fn buffered_pos(mut self, updates: u32) -> Self {
        self.config.buffered_pos = updates;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn config(&self) -> &QueueConfig { &self.config }

    pub fn build(self, dispatcher: &Arc<Dispatcher>) -> Result<FileQueue> {
        FileQueue::open(self.config, dispatcher)
    }
}
