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

//! Messages handed to consumers.

use bytes::Bytes;

/// A message read from the queue.
///
/// The payload is reference counted, cloning a message does not copy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    /// `false` when the frame carried a checksum that did not match.
    correct: bool,
}

impl Message {
    pub fn new<B: Into<Bytes>>(payload: B, correct: bool) -> Self {
        Self {
            payload: payload.into(),
            correct,
        }
    }

    pub fn payload(&self) -> &[u8] { &self.payload }

    pub fn bytes(&self) -> &Bytes { &self.payload }

    pub fn into_bytes(self) -> Bytes { self.payload }

    pub fn len(&self) -> usize { self.payload.len() }

    pub fn is_empty(&self) -> bool { self.payload.is_empty() }

    /// Whether the payload passed its checksum, or carried none.
    pub fn is_correct(&self) -> bool { self.correct }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_accessors() {
        let msg = Message::new(&b"ccc"[..], true);
        assert_eq!(msg.len(), 3);
        assert!(!msg.is_empty());
        assert_eq!(msg.payload(), b"ccc");
        assert!(msg.is_correct());

        let cloned = msg.clone();
        assert_eq!(cloned.into_bytes(), Bytes::from_static(b"ccc"));
        assert!(!Message::new(Vec::new(), false).is_correct());
    }
}
