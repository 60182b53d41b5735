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

//! Embedded, file-backed, append-only message queue.
//!
//! A queue is a directory of numbered segment files `<name>.<n>` written by a
//! single [`writer::Writer`]. Any number of named consumers read it
//! independently, each persisting its cursor in `<name>_<consumer>`. A shared
//! [`Dispatcher`] polls every consumer on one thread and hands messages to an
//! [`Executor`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fileq::{ConsumerOptions, FileQueueBuilder, QueueRegistry, ThreadPool};
//!
//! let registry = QueueRegistry::start(Arc::new(ThreadPool::new("handler", 4)?))?;
//! let queue = registry.create(FileQueueBuilder::new("/tmp/fileq", "orders"))?;
//! queue.add_consumer(ConsumerOptions::new("audit"), |msg: &fileq::Message, _: &fileq::Confirmer| {
//!     println!("{} bytes", msg.len());
//!     true
//! })?;
//! queue.push(b"hello")?;
//! # Ok::<(), fileq::QueueError>(())
//! ```

pub mod builder;
pub mod checksum;
pub mod config;
pub mod consume_state;
pub mod dispatcher;
pub mod error;
pub mod format;
pub mod message;
pub mod path;
pub mod pool;
pub mod queue;
pub mod reader;
pub mod recovery;
pub mod registry;
pub mod stream;
pub mod writer;

pub use builder::FileQueueBuilder;
pub use checksum::HashAlgorithm;
pub use config::{ConsumerOptions, DispatcherConfig, QueueConfig, RetryPolicy};
pub use consume_state::Cursor;
pub use dispatcher::{Confirmer, Dispatcher, MessageHandler};
pub use error::{QueueError, Result};
pub use format::InitPosition;
pub use message::Message;
pub use pool::{Executor, ThreadPool};
pub use queue::FileQueue;
pub use registry::QueueRegistry;
pub use stream::StreamMode;
