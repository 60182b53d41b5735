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

use std::{io, path::PathBuf};

use snafu::{Location, Snafu};

/// Queue operation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(context(false), display("IO error: {source}"))]
    Io { source: io::Error },

    /// The queue directory did not exist and could not be created.
    #[snafu(display("Failed to create queue directory {}", dir.display()))]
    DirCreate {
        dir:    PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        loc:    Location,
    },

    /// A configuration value is out of range.
    #[snafu(display("Invalid queue configuration: {message}"))]
    InvalidConfig {
        message: String,
        #[snafu(implicit)]
        loc:     Location,
    },

    /// The message exceeds the maximum frame payload.
    #[snafu(display("Message too large, len {len} exceeds {max}"))]
    TooLarge {
        len: usize,
        max: usize,
        #[snafu(implicit)]
        loc: Location,
    },

    /// Segment header is truncated or does not match the file it lives in.
    #[snafu(display("Corrupt segment {}: {reason}", path.display()))]
    CorruptSegment {
        path:   PathBuf,
        reason: String,
        #[snafu(implicit)]
        loc:    Location,
    },

    /// The writer or queue has been closed.
    #[snafu(display("Queue {queue} is closed"))]
    Closed {
        queue: String,
        #[snafu(implicit)]
        loc:   Location,
    },

    /// A queue with the same name is already registered.
    #[snafu(display("Queue {name} already exists"))]
    QueueExists {
        name: String,
        #[snafu(implicit)]
        loc:  Location,
    },

    /// Failed to spawn a named background thread.
    #[snafu(display("Failed to spawn thread {name}"))]
    ThreadSpawn {
        name:   String,
        source: io::Error,
        #[snafu(implicit)]
        loc:    Location,
    },
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
