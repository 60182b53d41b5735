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

//! Poll loop delivering messages from every registered consumer.
//!
//! ## Architecture
//!
//! One dedicated thread performs all reads. Handlers run on an [`Executor`]:
//!
//! ```text
//!  Writer::write ──ready()──┐
//!  Reader::confirm ─ready()─┤
//!                           ▼
//!  ┌──────────────────────────────┐   handle(msg)   ┌──────────────┐
//!  │ fileq-dispatcher (poll loop) │ ──────────────► │   Executor   │
//!  │ read() every consumer        │                 │ (ThreadPool) │
//!  └──────────────────────────────┘                 └──────────────┘
//! ```
//!
//! When a full cycle finds nothing the thread parks for at most `idle_wait`.
//! `ready()` only pays for an unpark while the loop is not tracing. A
//! `pending` flag covers a signal that arrives between a consumer's empty read
//! and the park.
//!
//! Consumers of a queue are kept in a copy-on-write list, registration never
//! blocks the poll thread for longer than an `Arc` clone.

use std::{
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam::sync::{Parker, Unparker};
use parking_lot::{Mutex, RwLock};
use snafu::ResultExt;
use tracing::{debug, error, info, warn};

use crate::{
    ConsumerOptions, DispatcherConfig, Message, QueueConfig, Result, error::ThreadSpawnSnafu,
    pool::Executor, reader::Reader, writer::Writer,
};

/// Signals from the write and confirm paths towards the poll loop.
pub trait Dispatch: Send + Sync {
    /// New data or a state change may be available.
    fn ready(&self);

    /// Lowest segment still needed by a consumer of `queue_key`, 0 if none.
    fn min_file_no(&self, queue_key: &str) -> u32;
}

/// Processes messages of one consumer.
///
/// With auto-confirm the return value confirms the message. Otherwise the
/// handler calls [`Confirmer::confirm`] itself, possibly later and from
/// another thread.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, msg: &Message, confirmer: &Confirmer) -> bool;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message, &Confirmer) -> bool + Send + Sync + 'static,
{
    fn handle(&self, msg: &Message, confirmer: &Confirmer) -> bool { self(msg, confirmer) }
}

/// Confirms messages of one consumer.
#[derive(Clone)]
pub struct Confirmer {
    consumer: Arc<Consumer>,
}

impl Confirmer {
    pub fn confirm(&self, ok: bool) { self.consumer.confirm(ok); }

    pub fn consumer(&self) -> &str { &self.consumer.name }

    pub fn queue(&self) -> &str { &self.consumer.queue_key }
}

impl fmt::Debug for Confirmer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Confirmer")
            .field("queue", &self.consumer.queue_key)
            .field("consumer", &self.consumer.name)
            .finish()
    }
}

pub(crate) struct Consumer {
    queue_key:    String,
    name:         String,
    reader:       Mutex<Reader>,
    handler:      Arc<dyn MessageHandler>,
    auto_confirm: bool,
    paused:       AtomicBool,
    file_no:      Arc<AtomicU32>,
}

impl Consumer {
    fn read(&self) -> Option<Message> {
        match self.reader.lock().read() {
            Ok(msg) => msg,
            Err(e) => {
                error!(queue = %self.queue_key, consumer = %self.name, error = %e, "Failed to read message");
                None
            }
        }
    }

    fn handle(self: &Arc<Self>, msg: &Message) {
        let confirmer = Confirmer {
            consumer: Arc::clone(self),
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(msg, &confirmer)));
        let ok = result.unwrap_or_else(|_| {
            error!(queue = %self.queue_key, consumer = %self.name, "Handler panicked");
            false
        });
        if self.auto_confirm {
            self.confirm(ok);
        }
    }

    fn confirm(&self, ok: bool) { self.reader.lock().confirm(ok); }

    fn hasten(&self) { self.reader.lock().hasten(); }

    fn close(&self) { self.reader.lock().close(); }

    fn cur_file_no(&self) -> u32 { self.file_no.load(Ordering::Acquire) }

    fn is_paused(&self) -> bool { self.paused.load(Ordering::Acquire) }
}

type ConsumerList = Arc<Vec<Arc<Consumer>>>;

struct Shared {
    queues:    RwLock<HashMap<String, ConsumerList>>,
    running:   AtomicBool,
    tracing:   AtomicBool,
    pending:   AtomicBool,
    total:     AtomicU64,
    executor:  Arc<dyn Executor>,
    unparker:  Unparker,
    config:    DispatcherConfig,
}

impl Shared {
    fn snapshot(&self) -> Vec<ConsumerList> { self.queues.read().values().cloned().collect() }

    fn run(&self, parker: &Parker) {
        info!(idle_wait = ?self.config.idle_wait, "Dispatcher started");

        while self.running.load(Ordering::Acquire) {
            self.pending.store(false, Ordering::SeqCst);
            let mut msg_num = 0u64;

            for consumers in self.snapshot() {
                for consumer in consumers.iter() {
                    if consumer.is_paused() {
                        continue;
                    }
                    let Some(msg) = consumer.read() else {
                        continue;
                    };
                    msg_num += 1;
                    let consumer = Arc::clone(consumer);
                    self.executor
                        .execute(Box::new(move || consumer.handle(&msg)));
                }
            }

            if msg_num == 0 {
                self.tracing.store(false, Ordering::SeqCst);
                if !self.pending.swap(false, Ordering::SeqCst) && self.running.load(Ordering::Acquire)
                {
                    parker.park_timeout(self.config.idle_wait);
                }
                self.tracing.store(true, Ordering::SeqCst);

                for consumers in self.snapshot() {
                    for consumer in consumers.iter() {
                        // flush buffered writers so readers see fresh data
                        consumer.hasten();
                    }
                }
            } else {
                self.total.fetch_add(msg_num, Ordering::Relaxed);
            }
        }

        let queues = std::mem::take(&mut *self.queues.write());
        for (queue, consumers) in queues {
            debug!(queue = %queue, "Close queue consumers");
            for consumer in consumers.iter() {
                consumer.close();
            }
        }
        info!(
            total = self.total.load(Ordering::Relaxed),
            "Dispatcher finished"
        );
    }

    fn update<F>(&self, queue_key: &str, f: F) -> Vec<Arc<Consumer>>
    where
        F: FnOnce(&[Arc<Consumer>]) -> (Option<Vec<Arc<Consumer>>>, Vec<Arc<Consumer>>),
    {
        let mut queues = self.queues.write();
        let current = queues.get(queue_key).cloned().unwrap_or_default();
        let (next, removed) = f(&current);
        match next {
            Some(next) if next.is_empty() => {
                queues.remove(queue_key);
            }
            Some(next) => {
                queues.insert(queue_key.to_string(), Arc::new(next));
            }
            None => {}
        }
        removed
    }
}

impl Dispatch for Shared {
    fn ready(&self) {
        self.pending.store(true, Ordering::SeqCst);
        if !self.tracing.load(Ordering::SeqCst) {
            self.unparker.unpark();
        }
    }

    fn min_file_no(&self, queue_key: &str) -> u32 {
        let queues = self.queues.read();
        queues
            .get(queue_key)
            .and_then(|consumers| consumers.iter().map(|c| c.cur_file_no()).min())
            .unwrap_or(0)
    }
}

/// Owns the poll thread. Dropping it shuts the loop down.
pub struct Dispatcher {
    shared:   Arc<Shared>,
    handle:   Mutex<Option<JoinHandle<()>>>,
    /// Serializes registration so a cursor file is only opened for a free
    /// name.
    register: Mutex<()>,
}

impl Dispatcher {
    /// Spawns the poll thread.
    pub fn start(executor: Arc<dyn Executor>, config: DispatcherConfig) -> Result<Self> {
        let parker = Parker::new();
        let shared = Arc::new(Shared {
            queues: RwLock::new(HashMap::new()),
            running: AtomicBool::new(true),
            tracing: AtomicBool::new(true),
            pending: AtomicBool::new(false),
            total: AtomicU64::new(0),
            executor,
            unparker: parker.unparker().clone(),
            config,
        });

        let name = "fileq-dispatcher";
        let poll = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || poll.run(&parker))
            .context(ThreadSpawnSnafu { name })?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
            register: Mutex::new(()),
        })
    }

    /// Handle given to writers and readers.
    pub fn dispatch_handle(&self) -> Arc<dyn Dispatch> { self.shared.clone() }

    /// Opens a reader for `options` on `writer` and registers it.
    ///
    /// A name already present on the queue is rejected with `Ok(false)`
    /// before its cursor file is touched.
    pub fn add_consumer(
        &self,
        writer: &Arc<Writer>,
        config: &QueueConfig,
        options: &ConsumerOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<bool> {
        let queue_key = writer.queue_key();
        let name = options.name.as_str();
        let _guard = self.register.lock();
        if !self.is_running() {
            warn!(queue = %queue_key, consumer = %name, "Dispatcher stopped, consumer ignored");
            return Ok(false);
        }
        if self.has_consumer(queue_key, name) {
            warn!(queue = %queue_key, consumer = %name, "Consumer already exists, ignored");
            return Ok(false);
        }

        let reader = Reader::open(Arc::clone(writer), self.dispatch_handle(), config, options)?;
        let consumer = Arc::new(Consumer {
            file_no: reader.file_no_handle(),
            queue_key: queue_key.to_string(),
            name: name.to_string(),
            reader: Mutex::new(reader),
            handler,
            auto_confirm: options.auto_confirm,
            paused: AtomicBool::new(false),
        });
        self.shared.update(queue_key, |current| {
            let mut next = current.to_vec();
            next.push(consumer);
            (Some(next), Vec::new())
        });

        info!(queue = %queue_key, consumer = %name, "Consumer added");
        self.shared.ready();
        Ok(true)
    }

    /// Removes and closes one consumer.
    pub fn rmv_consumer(&self, queue_key: &str, name: &str) -> bool {
        // held until the cursor is saved, a re-add then reads the final state
        let _guard = self.register.lock();
        let removed = self.shared.update(queue_key, |current| {
            let (gone, kept): (Vec<_>, Vec<_>) =
                current.iter().cloned().partition(|c| c.name == name);
            if gone.is_empty() {
                (None, gone)
            } else {
                (Some(kept), gone)
            }
        });
        if removed.is_empty() {
            info!(queue = %queue_key, consumer = %name, "Consumer not exists");
            return false;
        }
        for consumer in &removed {
            consumer.close();
        }
        info!(queue = %queue_key, consumer = %name, "Consumer removed");
        true
    }

    /// Removes and closes every consumer of a queue.
    pub fn rmv_consumers(&self, queue_key: &str) {
        let _guard = self.register.lock();
        let removed = self
            .shared
            .update(queue_key, |current| (Some(Vec::new()), current.to_vec()));
        for consumer in &removed {
            consumer.close();
        }
        debug!(queue = %queue_key, count = removed.len(), "Consumers removed");
    }

    fn set_paused(&self, queue_key: &str, name: Option<&str>, paused: bool) {
        let consumers = self.shared.queues.read().get(queue_key).cloned();
        let Some(consumers) = consumers else {
            info!(queue = %queue_key, "Queue not exists");
            return;
        };
        for consumer in consumers.iter() {
            if name.is_none_or(|n| n == consumer.name) {
                consumer.paused.store(paused, Ordering::Release);
                debug!(queue = %queue_key, consumer = %consumer.name, paused, "Consumer state changed");
            }
        }
        if !paused {
            self.shared.ready();
        }
    }

    /// Takes consumer `name`, or all of the queue, out of the poll rotation.
    pub fn pause_consumer(&self, queue_key: &str, name: Option<&str>) {
        self.set_paused(queue_key, name, true);
    }

    /// Puts paused consumers back into the poll rotation.
    pub fn continue_consumer(&self, queue_key: &str, name: Option<&str>) {
        self.set_paused(queue_key, name, false);
    }

    pub fn has_consumer(&self, queue_key: &str, name: &str) -> bool {
        self.shared
            .queues
            .read()
            .get(queue_key)
            .is_some_and(|consumers| consumers.iter().any(|c| c.name == name))
    }

    pub fn consumer_names(&self, queue_key: &str) -> Vec<String> {
        self.shared
            .queues
            .read()
            .get(queue_key)
            .map(|consumers| consumers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_paused(&self, queue_key: &str, name: &str) -> Option<bool> {
        self.shared
            .queues
            .read()
            .get(queue_key)
            .and_then(|consumers| consumers.iter().find(|c| c.name == name).map(|c| c.is_paused()))
    }

    pub fn min_file_no(&self, queue_key: &str) -> u32 { self.shared.min_file_no(queue_key) }

    pub fn ready(&self) { self.shared.ready(); }

    /// Delivery attempts since start, failed redeliveries included.
    pub fn handled_msg_num(&self) -> u64 { self.shared.total.load(Ordering::Relaxed) }

    pub fn is_running(&self) -> bool { self.shared.running.load(Ordering::Acquire) }

    /// Stops the loop, closes every consumer and waits for the poll thread.
    ///
    /// Handlers already running are not interrupted; their confirms become
    /// no-ops.
    pub fn shutdown(&self) {
        {
            let _guard = self.register.lock();
            if !self.shared.running.swap(false, Ordering::AcqRel) {
                return;
            }
        }
        info!("Dispatcher shutting down");
        self.shared.unparker.unpark();

        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("Dispatcher thread panicked");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) { self.shutdown(); }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("running", &self.is_running())
            .field("handled_msg_num", &self.handled_msg_num())
            .finish_non_exhaustive()
    }
}
