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

//! Durable consumer cursor.
//!
//! Each consumer keeps its `(fileNo, readPos)` in an append-only file:
//!
//! ```text
//! ┌────────────────────────┬──────────────────────┬──────────────────────┐
//! │ header (fileNo = 0)    │ fileNo(4) readPos(4) │ fileNo(4) readPos(4) │ ...
//! └────────────────────────┴──────────────────────┴──────────────────────┘
//! ```
//!
//! The last complete record wins. Records are written at most once per
//! [`SAVE_INTERVAL`] unless forced, or once `buffered_pos` updates piled up.
//! A crash therefore replays at most that many messages. When the file grows
//! past [`MAX_STATE_SIZE`] it is rewritten with just the current cursor.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    Result,
    format::{FILE_HEAD_LEN, INT_SIZE, decode_header, encode_header, read_u32},
    stream::{DirectInput, DirectOutput, InputStream, OutputStream},
};

/// Minimum time between two non-forced flushes.
pub const SAVE_INTERVAL: Duration = Duration::from_secs(1);

/// Size at which the cursor file is compacted.
pub const MAX_STATE_SIZE: u64 = 100 * 1024 * 8 + FILE_HEAD_LEN as u64;

const RECORD_LEN: usize = (INT_SIZE * 2) as usize;

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// A consumer's read position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub file_no:  u32,
    pub read_pos: u32,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            file_no:  0,
            read_pos: FILE_HEAD_LEN,
        }
    }
}

/// Reads the cursor stored at `path` without modifying the file.
///
/// Returns `None` if the file is missing or its header is invalid.
pub fn read_cursor(path: &Path) -> Result<Option<Cursor>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut input = DirectInput::open(path)?;
    let mut head = [0u8; FILE_HEAD_LEN as usize];
    let n = input.read_exact_or_eof(&mut head)?;
    match decode_header(path, &head[..n]) {
        Ok(0) => {}
        Ok(file_no) => {
            warn!(path = ?path, file_no, "Cursor header must carry file number 0");
            return Ok(None);
        }
        Err(e) => {
            warn!(path = ?path, error = %e, "Invalid cursor file");
            return Ok(None);
        }
    }

    let mut cursor = Cursor::default();
    let mut record = [0u8; RECORD_LEN];
    while input.read_exact_or_eof(&mut record)? == RECORD_LEN {
        cursor = Cursor {
            file_no:  read_u32(&record),
            read_pos: read_u32(&record[INT_SIZE as usize..]),
        };
    }
    Ok(Some(cursor))
}

/// Persistent read position of one consumer.
pub struct ConsumeState {
    path:           PathBuf,
    out:            Option<DirectOutput>,
    cursor:         Cursor,
    buffered_pos:   u32,
    buffered_times: u32,
    changed:        bool,
    record_time:    Instant,
}

impl ConsumeState {
    /// Loads the cursor at `path` and rewrites the file compacted.
    ///
    /// `buffered_pos` is the number of updates after which a save is forced.
    pub fn open<P: AsRef<Path>>(path: P, buffered_pos: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cursor = read_cursor(&path)?.unwrap_or_default();

        let mut state = Self {
            path,
            out: None,
            cursor,
            buffered_pos: buffered_pos.max(1),
            buffered_times: 0,
            changed: false,
            record_time: Instant::now(),
        };
        state.init()?;
        Ok(state)
    }

    /// Rewrites the file with only the current cursor. The new content is
    /// synced under a temporary name first and renamed over the old file, so
    /// a crash leaves either version intact.
    fn init(&mut self) -> Result<()> {
        info!(path = ?self.path, cursor = ?self.cursor, "Create consume state file");
        let tmp_path = tmp_path(&self.path);
        {
            let mut tmp = DirectOutput::create(&tmp_path)?;
            let mut head = Vec::with_capacity(FILE_HEAD_LEN as usize + RECORD_LEN);
            head.extend_from_slice(&encode_header(0));
            head.extend_from_slice(&self.encode_record());
            tmp.write(&head)?;
            tmp.sync()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        self.out = Some(DirectOutput::append(&self.path)?);
        Ok(())
    }

    fn encode_record(&self) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[..4].copy_from_slice(&self.cursor.file_no.to_be_bytes());
        record[4..].copy_from_slice(&self.cursor.read_pos.to_be_bytes());
        record
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn cursor(&self) -> Cursor { self.cursor }

    pub fn file_no(&self) -> u32 { self.cursor.file_no }

    pub fn read_pos(&self) -> u32 { self.cursor.read_pos }

    /// Records a new segment and position.
    pub fn save_at(&mut self, file_no: u32, read_pos: u32, force: bool) {
        let next = Cursor { file_no, read_pos };
        self.update(next, force);
    }

    /// Records a new position in the current segment.
    pub fn save(&mut self, read_pos: u32, force: bool) {
        let next = Cursor {
            file_no: self.cursor.file_no,
            read_pos,
        };
        self.update(next, force);
    }

    fn update(&mut self, next: Cursor, force: bool) {
        if next != self.cursor {
            self.changed = true;
            self.buffered_times += 1;
            self.cursor = next;
        }
        let due = force || self.buffered_times >= self.buffered_pos;
        self.flush(due, force);
    }

    /// Writes the cursor if it changed and `due` or the time window expired.
    /// Only `sync` saves wait for the disk.
    fn flush(&mut self, due: bool, sync: bool) {
        if !self.changed || self.out.is_none() {
            return;
        }
        let now = Instant::now();
        if !due && now.duration_since(self.record_time) < SAVE_INTERVAL {
            return;
        }
        self.record_time = now;
        self.buffered_times = 0;

        match self.write_record(sync) {
            Ok(()) => self.changed = false,
            Err(e) => error!(path = ?self.path, error = %e, "Failed to save consume state"),
        }
    }

    fn write_record(&mut self, sync: bool) -> Result<()> {
        let record = self.encode_record();
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        if out.size() >= MAX_STATE_SIZE {
            debug!(path = ?self.path, size = out.size(), "Compacting consume state");
            self.out = None;
            return self.init();
        }
        out.write(&record)?;
        if sync {
            out.sync()?;
        }
        Ok(())
    }

    /// Forces a final save and releases the file. Later saves only update
    /// the in-memory cursor.
    pub fn close(&mut self) {
        if self.out.is_none() {
            return;
        }
        debug!(path = ?self.path, cursor = ?self.cursor, "Close consume state");
        self.flush(true, true);
        self.out = None;
    }

    pub fn is_closed(&self) -> bool { self.out.is_none() }
}

impl Drop for ConsumeState {
    fn drop(&mut self) { self.close(); }
}

impl fmt::Debug for ConsumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeState")
            .field("path", &self.path)
            .field("cursor", &self.cursor)
            .field("changed", &self.changed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_fresh_state_starts_after_header() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q_c");

        let state = ConsumeState::open(&path, 16).unwrap();
        assert_eq!(state.cursor(), Cursor::default());
        assert_eq!(state.read_pos(), FILE_HEAD_LEN);

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, FILE_HEAD_LEN as u64 + RECORD_LEN as u64);
    }

    #[test]
    fn test_forced_save_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q_c");

        let mut state = ConsumeState::open(&path, 1024).unwrap();
        state.save_at(3, 120, true);
        drop(state);

        let state = ConsumeState::open(&path, 1024).unwrap();
        assert_eq!(
            state.cursor(),
            Cursor {
                file_no:  3,
                read_pos: 120,
            }
        );
    }

    #[test]
    fn test_unforced_saves_are_buffered() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q_c");

        let mut state = ConsumeState::open(&path, 4).unwrap();
        // inside the time window and under the count threshold
        state.save(20, false);
        state.save(30, false);
        state.save(40, false);
        assert_eq!(read_cursor(&path).unwrap(), Some(Cursor::default()));

        // fourth update reaches the threshold
        state.save(50, false);
        assert_eq!(
            read_cursor(&path).unwrap(),
            Some(Cursor {
                file_no:  0,
                read_pos: 50,
            })
        );
    }

    #[test]
    fn test_close_flushes_pending_update() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q_c");

        let mut state = ConsumeState::open(&path, 1024).unwrap();
        state.save_at(1, 77, false);
        state.close();
        assert!(state.is_closed());

        // saves after close only move the in-memory cursor
        state.save(99, true);
        assert_eq!(state.read_pos(), 99);
        assert_eq!(
            read_cursor(&path).unwrap(),
            Some(Cursor {
                file_no:  1,
                read_pos: 77,
            })
        );
    }

    #[test]
    fn test_invalid_file_resets_cursor() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q_c");
        std::fs::write(&path, b"garbage-garbage").unwrap();

        let state = ConsumeState::open(&path, 8).unwrap();
        assert_eq!(state.cursor(), Cursor::default());
    }

    #[test]
    fn test_partial_trailing_record_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q_c");

        let mut state = ConsumeState::open(&path, 1).unwrap();
        state.save_at(2, 64, true);
        drop(state);

        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&[0, 0, 0, 9, 0]);
        std::fs::write(&path, data).unwrap();

        assert_eq!(
            read_cursor(&path).unwrap(),
            Some(Cursor {
                file_no:  2,
                read_pos: 64,
            })
        );
    }

    #[test]
    fn test_compaction_keeps_latest_cursor() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q_c");

        let mut state = ConsumeState::open(&path, 1).unwrap();
        let records = (MAX_STATE_SIZE / RECORD_LEN as u64) as u32 + 2;
        for pos in 0..records {
            state.save(FILE_HEAD_LEN + pos + 1, false);
        }
        let size = std::fs::metadata(&path).unwrap().len();
        assert!(size <= MAX_STATE_SIZE + RECORD_LEN as u64);
        assert_eq!(read_cursor(&path).unwrap(), Some(state.cursor()));
    }

    #[test]
    fn test_rewrite_leaves_no_temporary_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q_c");
        let tmp = temp_dir.path().join("q_c.tmp");
        // left over from an interrupted rewrite
        std::fs::write(&tmp, b"garbage").unwrap();

        let mut state = ConsumeState::open(&path, 1024).unwrap();
        assert!(!tmp.exists());
        state.save_at(2, 64, true);
        drop(state);

        let mut state = ConsumeState::open(&path, 1024).unwrap();
        assert!(!tmp.exists());
        assert_eq!(
            state.cursor(),
            Cursor {
                file_no:  2,
                read_pos: 64,
            }
        );

        // appends after the rename land in the renamed file
        state.save_at(2, 80, true);
        assert_eq!(
            read_cursor(&path).unwrap(),
            Some(Cursor {
                file_no:  2,
                read_pos: 80,
            })
        );
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            FILE_HEAD_LEN as u64 + 2 * RECORD_LEN as u64
        );
    }
}
