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

//! Queue facade.
//!
//! A [`FileQueue`] couples the segment [`Writer`] of one queue directory with
//! the consumers it registers on a shared [`Dispatcher`].
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fileq::{
//!     Confirmer, ConsumerOptions, Dispatcher, DispatcherConfig, FileQueueBuilder, Message,
//!     ThreadPool,
//! };
//!
//! let pool = Arc::new(ThreadPool::new("handler", 2)?);
//! let dispatcher = Arc::new(Dispatcher::start(pool, DispatcherConfig::default())?);
//! let queue = FileQueueBuilder::new("/tmp/fileq", "events").build(&dispatcher)?;
//!
//! queue.add_consumer(
//!     ConsumerOptions::new("indexer").sequential(true),
//!     |msg: &Message, _: &Confirmer| !msg.is_empty(),
//! )?;
//! queue.push_checked(b"payload")?;
//! queue.close()?;
//! # Ok::<(), fileq::QueueError>(())
//! ```

use std::{
    fmt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use snafu::ensure;
use tracing::{error, info};

use crate::{
    ConsumerOptions, Dispatcher, MessageHandler, QueueConfig, Result, error::ClosedSnafu,
    writer::Writer,
};

pub struct FileQueue {
    config:     QueueConfig,
    writer:     Arc<Writer>,
    dispatcher: Arc<Dispatcher>,
    // keeps registration and close from interleaving
    register:   Mutex<()>,
    closed:     AtomicBool,
}

impl FileQueue {
    pub(crate) fn open(config: QueueConfig, dispatcher: &Arc<Dispatcher>) -> Result<Self> {
        let writer = Arc::new(Writer::open(&config, dispatcher.dispatch_handle())?);
        info!(
            queue = %writer.queue_key(),
            cur_file_no = writer.cur_file_no(),
            min_file_no = writer.min_file_no(),
            "Queue opened"
        );
        Ok(Self {
            config,
            writer,
            dispatcher: Arc::clone(dispatcher),
            register: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Appends a message without a checksum.
    pub fn push(&self, payload: &[u8]) -> Result<()> { self.push_with(payload, false) }

    /// Appends a message carrying a checksum verified on read.
    pub fn push_checked(&self, payload: &[u8]) -> Result<()> { self.push_with(payload, true) }

    pub fn push_with(&self, payload: &[u8], check_hash: bool) -> Result<()> {
        self.ensure_open()?;
        self.writer.write(payload, check_hash)
    }

    /// Attaches a consumer. Returns `false` when a consumer of that name is
    /// already attached; its cursor file is left untouched.
    pub fn add_consumer<H: MessageHandler>(&self, options: ConsumerOptions, handler: H) -> Result<bool> {
        let _guard = self.register.lock();
        self.ensure_open()?;
        self.dispatcher
            .add_consumer(&self.writer, &self.config, &options, Arc::new(handler))
    }

    /// Detaches and closes a consumer, persisting its cursor.
    pub fn remove_consumer(&self, name: &str) -> bool {
        let _guard = self.register.lock();
        self.dispatcher.rmv_consumer(self.queue_key(), name)
    }

    /// Pauses one consumer, or all of them with `None`.
    pub fn pause_consumer(&self, name: Option<&str>) {
        self.dispatcher.pause_consumer(self.queue_key(), name);
    }

    pub fn continue_consumer(&self, name: Option<&str>) {
        self.dispatcher.continue_consumer(self.queue_key(), name);
    }

    pub fn has_consumer(&self, name: &str) -> bool {
        self.dispatcher.has_consumer(self.queue_key(), name)
    }

    pub fn consumer_names(&self) -> Vec<String> { self.dispatcher.consumer_names(self.queue_key()) }

    /// Makes buffered writes visible to readers.
    pub fn hasten(&self) { self.writer.hasten(); }

    /// Detaches every consumer and closes the writer. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let _guard = self.register.lock();
            self.dispatcher.rmv_consumers(self.queue_key());
        }
        self.writer.close()?;
        info!(queue = %self.queue_key(), "Queue closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    pub fn name(&self) -> &str { &self.config.name }

    pub fn dir(&self) -> &Path { &self.config.dir }

    pub fn queue_key(&self) -> &str { self.writer.queue_key() }

    pub fn config(&self) -> &QueueConfig { &self.config }

    pub fn cur_file_no(&self) -> u32 { self.writer.cur_file_no() }

    pub fn min_file_no(&self) -> u32 { self.writer.min_file_no() }

    pub fn writer(&self) -> &Arc<Writer> { &self.writer }

    fn ensure_open(&self) -> Result<()> {
        ensure!(
            !self.is_closed(),
            ClosedSnafu {
                queue: self.queue_key().to_string(),
            }
        );
        Ok(())
    }
}

impl Drop for FileQueue {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(queue = %self.queue_key(), error = %e, "Failed to close queue");
        }
    }
}

impl fmt::Debug for FileQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileQueue")
            .field("queue", &self.queue_key())
            .field("cur_file_no", &self.cur_file_no())
            .field("min_file_no", &self.min_file_no())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
