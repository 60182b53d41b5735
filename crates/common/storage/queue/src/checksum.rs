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

//! Frame checksums.
//!
//! The default is a rolling multiplicative hash (`h = h * 31 + byte`). It only
//! catches garbled or partially written frames. Queues that want a stronger
//! check can switch to CRC-32 (IEEE) via crc32fast; the flag bit in the
//! length word means the same thing for both, so the choice has to stay fixed
//! for the lifetime of a queue directory.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    #[default]
    Rolling,
    Crc32,
}

impl HashAlgorithm {
    #[inline]
    #[must_use]
    pub fn checksum(self, data: &[u8]) -> u32 {
        match self {
            Self::Rolling => rolling_hash(data),
            Self::Crc32 => crc32(data),
        }
    }

    /// Returns `true` if `expected` matches the checksum of `data`.
    #[inline]
    #[must_use]
    pub fn verify(self, data: &[u8], expected: u32) -> bool { self.checksum(data) == expected }
}

#[inline]
#[must_use]
pub fn rolling_hash(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |h, &b| h.wrapping_mul(31).wrapping_add(u32::from(b)))
}

#[inline]
fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
