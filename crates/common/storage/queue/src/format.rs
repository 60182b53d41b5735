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

//! On-disk layout shared by segments and cursor files.
//!
//! ## Segment Layout
//!
//! Every segment starts with a fixed header followed by message frames:
//!
//! ```text
//! ┌──────────────┬─────────────┬───────────────┐
//! │ "QUEUE" (5B) │ version(1B) │ fileNo (4B)   │
//! └──────────────┴─────────────┴───────────────┘
//! ┌──────────────────┬────────────────────┬───────────────────┐
//! │ lenWord (4B)     │ hash (4B, optional)│ payload (len B)   │
//! └──────────────────┴────────────────────┴───────────────────┘
//! ```
//!
//! All integers are big-endian. Bit 30 of `lenWord` marks the presence of the
//! hash, bits 0-29 hold the payload length.
//!
//! A cursor file reuses the header with `fileNo` fixed to 0 and is followed by
//! `(fileNo, readPos)` records, the last complete one being authoritative.

use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::{Result, error::CorruptSegmentSnafu};

/// Magic bytes at the start of every queue file.
pub const MAGIC: &[u8; 5] = b"QUEUE";

/// Current format version.
pub const VERSION: u8 = 0;

/// Header length: magic + version + file number.
pub const FILE_HEAD_LEN: u32 = 10;

/// Maximum payload length of a single message.
pub const MAX_MSG_SIZE: usize = 1 << 20;

/// Flag in the length word telling a hash follows.
pub const MSG_HASH_FLAG: u32 = 0x4000_0000;

/// Mask extracting the payload length from the length word.
pub const MSG_LEN_MASK: u32 = 0x3FFF_FFFF;

/// Initial capacity of reusable frame buffers.
pub const DEFAULT_BUF_LEN: usize = 1024;

/// Size of the length word and of the optional hash.
pub const INT_SIZE: u32 = 4;

const HEAD_LEN: usize = FILE_HEAD_LEN as usize;

/// Where a new consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPosition {
    /// Resume from the durable cursor.
    #[default]
    Cur,
    /// Oldest retained segment.
    Head,
    /// Current end of the writer.
    End,
}

/// Encodes the header for `file_no`.
#[must_use]
pub fn encode_header(file_no: u32) -> [u8; HEAD_LEN] {
    let mut head = [0u8; HEAD_LEN];
    head[..MAGIC.len()].copy_from_slice(MAGIC);
    head[MAGIC.len()] = VERSION;
    head[MAGIC.len() + 1..].copy_from_slice(&file_no.to_be_bytes());
    head
}

/// Decodes a header read from `path` and returns its file number.
pub fn decode_header(path: &Path, head: &[u8]) -> Result<u32> {
    ensure!(
        head.len() >= HEAD_LEN,
        CorruptSegmentSnafu {
            path:   path.to_path_buf(),
            reason: format!("truncated header, {} bytes", head.len()),
        }
    );
    ensure!(
        &head[..MAGIC.len()] == MAGIC,
        CorruptSegmentSnafu {
            path:   path.to_path_buf(),
            reason: "bad magic".to_string(),
        }
    );
    let version = head[MAGIC.len()];
    ensure!(
        version == VERSION,
        CorruptSegmentSnafu {
            path:   path.to_path_buf(),
            reason: format!("unsupported version {version}"),
        }
    );
    Ok(read_u32(&head[MAGIC.len() + 1..]))
}

/// Reads a big-endian `u32` from the first four bytes of `buf`.
#[inline]
pub(crate) fn read_u32(buf: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[..4]);
    u32::from_be_bytes(word)
}

/// Decoded length word of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len:      u32,
    pub has_hash: bool,
}

impl FrameHeader {
    #[must_use]
    pub const fn parse(word: u32) -> Self {
        Self {
            len:      word & MSG_LEN_MASK,
            has_hash: word & MSG_HASH_FLAG != 0,
        }
    }

    /// Bytes following the length word: optional hash plus payload.
    #[must_use]
    pub const fn body_len(self) -> u32 {
        if self.has_hash {
            self.len + INT_SIZE
        } else {
            self.len
        }
    }
}

/// Appends one frame to `buf`, which is cleared first.
pub(crate) fn encode_frame(buf: &mut Vec<u8>, payload: &[u8], hash: Option<u32>) {
    buf.clear();
    // payload length is bounded by MAX_MSG_SIZE before we get here
    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;
    match hash {
        Some(hash) => {
            buf.extend_from_slice(&(len | MSG_HASH_FLAG).to_be_bytes());
            buf.extend_from_slice(&hash.to_be_bytes());
        }
        None => buf.extend_from_slice(&len.to_be_bytes()),
    }
    buf.extend_from_slice(payload);
}
