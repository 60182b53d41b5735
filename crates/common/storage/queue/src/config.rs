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

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::{
    HashAlgorithm, InitPosition, Result, StreamMode, error::InvalidConfigSnafu,
    format::MAX_MSG_SIZE,
};

/// Smallest accepted segment size.
pub const MIN_FILE_SIZE: u32 = 4 * 1024;

/// Largest accepted segment size. Positions inside a segment are 32-bit and
/// one oversized message may follow the last write below the limit.
pub const MAX_FILE_SIZE: u32 = i32::MAX as u32 - 2 * MAX_MSG_SIZE as u32;

/// Configuration of one named queue.
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory holding segments and cursor files.
    #[default(_code = "PathBuf::from(\"./queue_data\")")]
    pub dir:            PathBuf,
    #[default = "queue"]
    pub name:           String,
    /// Segment size that triggers rotation.
    #[default(16 * 1024 * 1024)]
    pub max_file_size:  u32,
    /// Segments retained before consumed ones are deleted.
    #[default = 100]
    pub max_file_num:   u32,
    /// Buffer producer writes; they become visible on the next `hasten`.
    pub buffered_push:  bool,
    /// Buffer consumer reads.
    pub buffered_poll:  bool,
    pub hash_algorithm: HashAlgorithm,
    /// Cursor updates tolerated before a save is forced.
    #[default = 1024]
    pub buffered_pos:   u32,
    pub retry:          RetryPolicy,
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.name.is_empty(),
            InvalidConfigSnafu {
                message: "queue name must not be empty",
            }
        );
        ensure!(
            !self.name.contains(['/', '\\']),
            InvalidConfigSnafu {
                message: format!("queue name {:?} must not contain path separators", self.name),
            }
        );
        ensure!(
            (MIN_FILE_SIZE..=MAX_FILE_SIZE).contains(&self.max_file_size),
            InvalidConfigSnafu {
                message: format!(
                    "max_file_size {} out of range [{MIN_FILE_SIZE}, {MAX_FILE_SIZE}]",
                    self.max_file_size
                ),
            }
        );
        ensure!(
            self.max_file_num >= 1,
            InvalidConfigSnafu {
                message: "max_file_num must be at least 1",
            }
        );
        self.retry.validate()
    }

    pub fn push_mode(&self) -> StreamMode {
        if self.buffered_push {
            StreamMode::Buffered
        } else {
            StreamMode::Direct
        }
    }

    pub fn poll_mode(&self) -> StreamMode {
        if self.buffered_poll {
            StreamMode::Buffered
        } else {
            StreamMode::Direct
        }
    }
}

/// Redelivery policy of sequential consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first redelivery.
    #[default(_code = "Duration::from_millis(500)")]
    pub min_interval:     Duration,
    /// Cap of the doubling delay.
    #[default(_code = "Duration::from_secs(16)")]
    pub max_interval:     Duration,
    /// Consecutive failures after which the frame is re-read from disk.
    #[default = 10]
    pub max_failed_times: u32,
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.min_interval <= self.max_interval,
            InvalidConfigSnafu {
                message: format!(
                    "retry min_interval {:?} exceeds max_interval {:?}",
                    self.min_interval, self.max_interval
                ),
            }
        );
        ensure!(
            self.max_failed_times >= 1,
            InvalidConfigSnafu {
                message: "max_failed_times must be at least 1",
            }
        );
        Ok(())
    }

    /// Delay after `failed_times` consecutive failures.
    pub fn backoff(&self, failed_times: u32) -> Duration {
        let shift = failed_times.saturating_sub(1).min(31);
        self.min_interval
            .saturating_mul(1u32 << shift)
            .min(self.max_interval)
    }
}

/// Poll loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Longest park when a cycle finds nothing.
    #[default(_code = "Duration::from_secs(1)")]
    pub idle_wait: Duration,
}

/// How a consumer is attached to a queue.
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
pub struct ConsumerOptions {
    pub name:         String,
    /// One message in flight, confirmed before the next is delivered.
    pub sequential:   bool,
    pub position:     InitPosition,
    /// Confirm with the handler's return value.
    #[default = true]
    pub auto_confirm: bool,
}

impl ConsumerOptions {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    pub fn position(mut self, position: InitPosition) -> Self {
        self.position = position;
        self
    }

    pub fn auto_confirm(mut self, auto_confirm: bool) -> Self {
        self.auto_confirm = auto_confirm;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.name.is_empty() && !self.name.contains(['/', '\\']),
            InvalidConfigSnafu {
                message: format!("invalid consumer name {:?}", self.name),
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::QueueError;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_file_size, 16 * 1024 * 1024);
        assert_eq!(config.max_file_num, 100);
        assert_eq!(config.buffered_pos, 1024);
        assert_eq!(config.push_mode(), StreamMode::Direct);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Rolling);
        assert!(config.validate().is_ok());

        let retry = RetryPolicy::default();
        assert_eq!(retry.min_interval, Duration::from_millis(500));
        assert_eq!(retry.max_interval, Duration::from_secs(16));
        assert_eq!(retry.max_failed_times, 10);

        let consumer = ConsumerOptions::new("c");
        assert!(consumer.auto_confirm);
        assert!(!consumer.sequential);
        assert_eq!(consumer.position, InitPosition::Cur);
    }

    #[test_case(MIN_FILE_SIZE - 1, 10 ; "file too small")]
    #[test_case(MAX_FILE_SIZE + 1, 10 ; "file too large")]
    #[test_case(MIN_FILE_SIZE, 0 ; "no files")]
    fn test_validate_rejects(max_file_size: u32, max_file_num: u32) {
        let config = QueueConfig {
            max_file_size,
            max_file_num,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(QueueError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let config = QueueConfig {
            name: "a/b".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(ConsumerOptions::new("").validate().is_err());
    }

    #[test_case(1, 500 ; "first retry")]
    #[test_case(2, 1000 ; "doubles")]
    #[test_case(6, 16000 ; "reaches cap")]
    #[test_case(40, 16000 ; "stays capped")]
    fn test_backoff(failed_times: u32, expected_ms: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.backoff(failed_times),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"name":"orders","max_file_num":3,"hash_algorithm":"crc32"}"#)
                .unwrap();
        assert_eq!(config.name, "orders");
        assert_eq!(config.max_file_num, 3);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Crc32);
        assert_eq!(config.max_file_size, 16 * 1024 * 1024);
    }
}
