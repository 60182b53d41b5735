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

//! Segment writer.
//!
//! Producers append frames to the active segment `<name>.<curFileNo>` under a
//! single mutex. Once the segment reaches `max_file_size` the writer opens
//! `curFileNo + 1` and deletes the oldest segments that exceed
//! `max_file_num` and that no consumer still needs.
//!
//! ```text
//!  minFileNo                        curFileNo
//!     │                                 │
//!  ┌──▼──┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌────▼─────┐
//!  │ q.3 │ │ q.4 │ │ q.5 │ │ q.6 │ │ q.7 ...  │ ◄── write()
//!  └─────┘ └─────┘ └─────┘ └─────┘ └──────────┘
//!  ◄── deletable while below every consumer's fileNo
//! ```
//!
//! A restarted writer never appends to an old segment: it resumes at
//! `maxFileNo + 1`.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, error, info, warn};

use crate::{
    HashAlgorithm, QueueConfig, Result, StreamMode,
    dispatcher::Dispatch,
    error::{ClosedSnafu, DirCreateSnafu, InvalidConfigSnafu, TooLargeSnafu},
    format::{DEFAULT_BUF_LEN, MAX_MSG_SIZE, encode_frame, encode_header},
    path::{cursor_path, segment_path},
    recovery::scan_segment_range,
    stream::{OutputStream, create_output},
};

struct WriterInner {
    out:            Option<Box<dyn OutputStream>>,
    buf:            Vec<u8>,
    failed_deletes: Vec<PathBuf>,
}

/// Appends messages to the segments of one queue.
pub struct Writer {
    dir:            PathBuf,
    name:           String,
    queue_key:      String,
    max_file_size:  u32,
    max_file_num:   u32,
    mode:           StreamMode,
    hash_algorithm: HashAlgorithm,
    dispatcher:     Arc<dyn Dispatch>,
    cur_file_no:    AtomicU32,
    min_file_no:    AtomicU32,
    inner:          Mutex<WriterInner>,
}

impl Writer {
    /// Opens the writer of the queue described by `config`.
    ///
    /// Creates the directory if needed and starts a fresh segment after the
    /// newest valid one found on disk.
    pub fn open(config: &QueueConfig, dispatcher: Arc<dyn Dispatch>) -> Result<Self> {
        config.validate()?;

        let dir = config.dir.clone();
        if !dir.exists() {
            info!(dir = ?dir, "Create queue directory");
            std::fs::create_dir_all(&dir).context(DirCreateSnafu { dir: dir.clone() })?;
        }

        let (min_file_no, cur_file_no) = match scan_segment_range(&dir, &config.name)? {
            Some(range) => {
                let next = range
                    .max_file_no
                    .checked_add(1)
                    .context(InvalidConfigSnafu {
                        message: format!("segment numbers of {} exhausted", config.name),
                    })?;
                (range.min_file_no, next)
            }
            None => (0, 0),
        };

        let writer = Self {
            queue_key: dir.join(&config.name).to_string_lossy().into_owned(),
            dir,
            name: config.name.clone(),
            max_file_size: config.max_file_size,
            max_file_num: config.max_file_num,
            mode: config.push_mode(),
            hash_algorithm: config.hash_algorithm,
            dispatcher,
            cur_file_no: AtomicU32::new(cur_file_no),
            min_file_no: AtomicU32::new(min_file_no),
            inner: Mutex::new(WriterInner {
                out:            None,
                buf:            Vec::with_capacity(DEFAULT_BUF_LEN),
                failed_deletes: Vec::new(),
            }),
        };
        let out = writer.open_segment(cur_file_no)?;
        writer.inner.lock().out = Some(out);

        info!(
            queue = %writer.queue_key,
            min_file_no,
            cur_file_no,
            mode = ?writer.mode,
            "Writer opened"
        );
        Ok(writer)
    }

    fn open_segment(&self, file_no: u32) -> Result<Box<dyn OutputStream>> {
        let path = self.segment_path(file_no);
        let mut out = create_output(&path, self.mode)?;
        out.write(&encode_header(file_no))?;
        out.flush()?;
        debug!(path = ?path, "Segment created");
        Ok(out)
    }

    /// Appends one message. With `check_hash` the frame carries a checksum
    /// that readers verify.
    pub fn write(&self, payload: &[u8], check_hash: bool) -> Result<()> {
        ensure!(
            payload.len() <= MAX_MSG_SIZE,
            TooLargeSnafu {
                len: payload.len(),
                max: MAX_MSG_SIZE,
            }
        );
        let hash = check_hash.then(|| self.hash_algorithm.checksum(payload));

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let out = inner.out.as_mut().context(ClosedSnafu {
                queue: self.queue_key.clone(),
            })?;
            encode_frame(&mut inner.buf, payload, hash);
            out.write(&inner.buf)?;
            if out.size() >= u64::from(self.max_file_size) {
                self.rotate(inner)?;
            }
        }

        self.dispatcher.ready();
        Ok(())
    }

    fn rotate(&self, inner: &mut WriterInner) -> Result<()> {
        let next = self.cur_file_no() + 1;
        let out = self.open_segment(next)?;
        if let Some(old) = inner.out.as_mut() {
            old.flush()?;
        }
        inner.out = Some(out);
        // published only once the segment exists
        self.cur_file_no.store(next, Ordering::Release);
        debug!(queue = %self.queue_key, file_no = next, "Segment rotated");
        self.remove_files(inner, next);
        Ok(())
    }

    /// Deletes the oldest segments beyond `max_file_num` that every consumer
    /// has moved past.
    fn remove_files(&self, inner: &mut WriterInner, latest_file_no: u32) {
        // earlier failures are retried on every rotation, pinned or not
        inner.failed_deletes.retain(|path| match std::fs::remove_file(path) {
            Ok(()) => {
                info!(path = ?path, "Removed segment on retry");
                false
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(_) => true,
        });

        let min_file_no = self.min_file_no();
        let cur_num = latest_file_no.saturating_sub(min_file_no) + 1;
        if cur_num < self.max_file_num {
            return;
        }
        let consumer_min = self.dispatcher.min_file_no(&self.queue_key);
        let useless_num = consumer_min.saturating_sub(min_file_no);
        let rmv_num = (cur_num - self.max_file_num).min(useless_num);
        if rmv_num == 0 {
            return;
        }

        info!(
            queue = %self.queue_key,
            max_file_num = self.max_file_num,
            rmv_num,
            "Too many segments, removing consumed ones"
        );
        for file_no in min_file_no..min_file_no + rmv_num {
            let path = self.segment_path(file_no);
            if !path.exists() {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = ?path, "Removed segment"),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to remove segment, will retry");
                    inner.failed_deletes.push(path);
                }
            }
        }
        self.min_file_no
            .store(min_file_no + rmv_num, Ordering::Release);
    }

    /// Flushes buffered output so readers can observe it.
    pub fn hasten(&self) {
        let mut inner = self.inner.lock();
        if let Some(out) = inner.out.as_mut() {
            if let Err(e) = out.flush() {
                error!(queue = %self.queue_key, error = %e, "Failed to flush segment");
            }
        }
    }

    /// Flushes and releases the active segment, then runs a last cleanup.
    /// Writes afterwards fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let flushed = match inner.out.take() {
            Some(mut out) => {
                debug!(path = ?out.path(), size = out.size(), "Writer close");
                out.flush()
            }
            None => Ok(()),
        };
        self.remove_files(&mut inner, self.cur_file_no());
        flushed?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool { self.inner.lock().out.is_none() }

    pub fn cur_file_no(&self) -> u32 { self.cur_file_no.load(Ordering::Acquire) }

    pub fn min_file_no(&self) -> u32 { self.min_file_no.load(Ordering::Acquire) }

    /// Bytes in the active segment, buffered ones included.
    pub fn size(&self) -> u32 { self.tail().1 }

    /// Active segment number and its size, read together.
    #[allow(clippy::cast_possible_truncation)]
    pub fn tail(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        let size = inner.out.as_ref().map_or(0, |out| out.size() as u32);
        (self.cur_file_no(), size)
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn name(&self) -> &str { &self.name }

    /// `dir/name`, identifies the queue towards the dispatcher.
    pub fn queue_key(&self) -> &str { &self.queue_key }

    pub fn hash_algorithm(&self) -> HashAlgorithm { self.hash_algorithm }

    pub fn segment_path(&self, file_no: u32) -> PathBuf {
        segment_path(&self.dir, &self.name, file_no)
    }

    pub fn cursor_path(&self, consumer: &str) -> PathBuf {
        cursor_path(&self.dir, &self.name, consumer)
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("queue", &self.queue_key)
            .field("min_file_no", &self.min_file_no())
            .field("cur_file_no", &self.cur_file_no())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        QueueError,
        format::{FILE_HEAD_LEN, FrameHeader, read_u32},
        recovery::read_segment_header,
        test_util::StubDispatch,
    };

    struct TestFixture {
        _temp_dir:  TempDir,
        config:     QueueConfig,
        dispatcher: Arc<StubDispatch>,
    }

    impl TestFixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let config = QueueConfig {
                dir: temp_dir.path().join("queue"),
                name: "q".to_string(),
                max_file_size: 4096,
                max_file_num: 2,
                ..Default::default()
            };
            Self {
                _temp_dir: temp_dir,
                config,
                dispatcher: Arc::new(StubDispatch::default()),
            }
        }

        fn writer(&self) -> Writer { Writer::open(&self.config, self.dispatcher.clone()).unwrap() }
    }

    #[test]
    fn test_fresh_queue_starts_at_zero() {
        let fixture = TestFixture::new();
        let writer = fixture.writer();

        assert!(fixture.config.dir.exists());
        assert_eq!(writer.cur_file_no(), 0);
        assert_eq!(writer.min_file_no(), 0);
        assert_eq!(writer.size(), FILE_HEAD_LEN);
        assert_eq!(read_segment_header(&writer.segment_path(0)).unwrap(), 0);
    }

    #[test]
    fn test_write_frames_and_signal_ready() {
        let fixture = TestFixture::new();
        let writer = fixture.writer();

        writer.write(b"a", false).unwrap();
        writer.write(b"bb", true).unwrap();
        assert_eq!(fixture.dispatcher.ready_count(), 2);

        let data = std::fs::read(writer.segment_path(0)).unwrap();
        let body = &data[FILE_HEAD_LEN as usize..];
        assert_eq!(body[..5], [0, 0, 0, 1, b'a']);
        let second = FrameHeader::parse(read_u32(&body[5..]));
        assert!(second.has_hash);
        assert_eq!(second.len, 2);
        assert_eq!(read_u32(&body[9..]), HashAlgorithm::Rolling.checksum(b"bb"));
        assert_eq!(&body[13..], b"bb");
    }

    #[test]
    fn test_rejects_oversized_message() {
        let fixture = TestFixture::new();
        let writer = fixture.writer();
        let payload = vec![0u8; MAX_MSG_SIZE + 1];
        assert!(matches!(
            writer.write(&payload, false),
            Err(QueueError::TooLarge { .. })
        ));
        assert_eq!(fixture.dispatcher.ready_count(), 0);
    }

    #[test]
    fn test_rotation_writes_valid_header() {
        let fixture = TestFixture::new();
        let writer = fixture.writer();
        let payload = vec![7u8; 1000];

        for _ in 0..5 {
            writer.write(&payload, false).unwrap();
        }
        assert_eq!(writer.cur_file_no(), 1);
        assert_eq!(read_segment_header(&writer.segment_path(1)).unwrap(), 1);
        assert!(writer.segment_path(0).exists());
    }

    #[test]
    fn test_gc_respects_consumer_min_file_no() {
        let fixture = TestFixture::new();
        let writer = fixture.writer();
        let payload = vec![1u8; 2048];

        // a consumer still sits on segment 0
        fixture.dispatcher.set_min_file_no(0);
        for _ in 0..6 {
            writer.write(&payload, false).unwrap();
        }
        assert_eq!(writer.cur_file_no(), 3);
        assert_eq!(writer.min_file_no(), 0);
        assert!(writer.segment_path(0).exists());

        // consumer moved to segment 3, everything beyond two files goes
        fixture.dispatcher.set_min_file_no(3);
        writer.write(&payload, false).unwrap();
        writer.write(&payload, false).unwrap();
        assert_eq!(writer.cur_file_no(), 4);
        assert_eq!(writer.min_file_no(), 3);
        for no in 0..3 {
            assert!(!writer.segment_path(no).exists());
        }
        assert!(writer.segment_path(3).exists());
    }

    #[test]
    fn test_failed_delete_retried_while_consumer_pins_gc() {
        let fixture = TestFixture::new();
        let writer = fixture.writer();
        let stale = writer.dir().join("stale-segment");
        std::fs::write(&stale, b"left behind").unwrap();
        writer.inner.lock().failed_deletes.push(stale.clone());

        fixture.dispatcher.set_min_file_no(0);
        let payload = vec![1u8; 2048];
        writer.write(&payload, false).unwrap();
        writer.write(&payload, false).unwrap();
        assert_eq!(writer.cur_file_no(), 1);
        assert_eq!(writer.min_file_no(), 0);

        assert!(!stale.exists());
        assert!(writer.inner.lock().failed_deletes.is_empty());
    }

    #[test]
    fn test_restart_resumes_after_last_segment() {
        let fixture = TestFixture::new();
        {
            let writer = fixture.writer();
            writer.write(b"before restart", false).unwrap();
            writer.close().unwrap();
        }
        let writer = fixture.writer();
        assert_eq!(writer.min_file_no(), 0);
        assert_eq!(writer.cur_file_no(), 1);
        assert!(writer.segment_path(0).exists());
    }

    #[test]
    fn test_write_after_close_fails() {
        let fixture = TestFixture::new();
        let writer = fixture.writer();
        writer.close().unwrap();
        assert!(writer.is_closed());
        assert!(matches!(
            writer.write(b"late", false),
            Err(QueueError::Closed { .. })
        ));
    }

    #[test]
    fn test_buffered_output_visible_after_hasten() {
        let mut fixture = TestFixture::new();
        fixture.config.buffered_push = true;
        let writer = fixture.writer();

        writer.write(b"buffered", false).unwrap();
        let on_disk = std::fs::metadata(writer.segment_path(0)).unwrap().len();
        assert_eq!(on_disk, u64::from(FILE_HEAD_LEN));

        writer.hasten();
        let on_disk = std::fs::metadata(writer.segment_path(0)).unwrap().len();
        assert_eq!(on_disk, u64::from(FILE_HEAD_LEN) + 4 + 8);
    }
}
