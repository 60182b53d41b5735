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

//! Worker pool running message handlers off the poll thread.

use std::{
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
};

use crossbeam::channel::{Sender, unbounded};
use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::{debug, error, warn};

use crate::{Result, error::ThreadSpawnSnafu};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs submitted by the dispatcher.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Fixed number of named threads fed through an unbounded channel.
pub struct ThreadPool {
    name:    String,
    tx:      Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns `size` workers named `<name>-<index>`.
    pub fn new<S: Into<String>>(name: S, size: usize) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size.max(1));

        for index in 0..size.max(1) {
            let rx = rx.clone();
            let thread_name = format!("{name}-{index}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    for job in rx {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("Job panicked in worker pool");
                        }
                    }
                })
                .context(ThreadSpawnSnafu { name: thread_name })?;
            workers.push(handle);
        }

        debug!(pool = %name, size = workers.len(), "Thread pool started");
        Ok(Self {
            name,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Stops accepting jobs, lets queued ones finish and joins the workers.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.name, "Worker thread panicked");
            }
        }
        debug!(pool = %self.name, "Thread pool stopped");
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => {
                if tx.send(job).is_err() {
                    warn!(pool = %self.name, "Worker pool disconnected, job dropped");
                }
            }
            None => warn!(pool = %self.name, "Worker pool shut down, job dropped"),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) { self.shutdown(); }
}
