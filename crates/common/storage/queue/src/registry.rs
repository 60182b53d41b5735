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

//! Named queues sharing one dispatcher.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use snafu::ensure;
use tracing::{error, info};

use crate::{
    Dispatcher, DispatcherConfig, Executor, FileQueue, FileQueueBuilder, Result,
    error::QueueExistsSnafu,
};

pub struct QueueRegistry {
    dispatcher: Arc<Dispatcher>,
    queues:     RwLock<HashMap<String, Arc<FileQueue>>>,
}

impl QueueRegistry {
    /// Starts a dispatcher with default settings on `executor`.
    pub fn start(executor: Arc<dyn Executor>) -> Result<Self> {
        Self::with_config(executor, DispatcherConfig::default())
    }

    pub fn with_config(executor: Arc<dyn Executor>, config: DispatcherConfig) -> Result<Self> {
        Ok(Self {
            dispatcher: Arc::new(Dispatcher::start(executor, config)?),
            queues:     RwLock::new(HashMap::new()),
        })
    }

    /// Opens a queue and registers it under its name.
    pub fn create(&self, builder: FileQueueBuilder) -> Result<Arc<FileQueue>> {
        let mut queues = self.queues.write();
        let name = builder.config().name.clone();
        ensure!(!queues.contains_key(&name), QueueExistsSnafu { name });

        let queue = Arc::new(builder.build(&self.dispatcher)?);
        queues.insert(name, Arc::clone(&queue));
        Ok(queue)
    }

    pub fn get(&self, name: &str) -> Option<Arc<FileQueue>> { self.queues.read().get(name).cloned() }

    /// Unregisters and closes a queue.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let Some(queue) = self.queues.write().remove(name) else {
            return Ok(false);
        };
        queue.close()?;
        Ok(true)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> { &self.dispatcher }

    /// Closes every queue and stops the dispatcher.
    pub fn stop(&self) {
        let queues = std::mem::take(&mut *self.queues.write());
        for (name, queue) in queues {
            if let Err(e) = queue.close() {
                error!(queue = %name, error = %e, "Failed to close queue");
            }
        }
        self.dispatcher.shutdown();
        info!(handled = self.dispatcher.handled_msg_num(), "Queue registry stopped");
    }
}

impl Drop for QueueRegistry {
    fn drop(&mut self) { self.stop(); }
}

impl fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.names())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
