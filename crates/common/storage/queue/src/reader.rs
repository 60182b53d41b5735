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

//! Consumer read path.
//!
//! A [`Reader`] walks the segments of one queue on behalf of one consumer:
//!
//! ```text
//!   cursor (fileNo, readPos)
//!        │
//!  ┌─────▼─────┐   exhausted and not active   ┌───────────┐
//!  │  q.N      │ ───────────────────────────► │  q.N+1    │ ...
//!  └───────────┘   (header-only skipped)      └───────────┘
//! ```
//!
//! Two behaviours share the segment handling:
//!
//! - Concurrent: every `read` hands out the next message, `confirm(true)`
//!   persists the current position, failures are dropped.
//! - Sequential: one message in flight. A failed message is redelivered after
//!   a doubling backoff; after `max_failed_times` failures the frame is read
//!   again from disk instead of from memory.
//!
//! Frames with an oversized length are skipped. Frames with a checksum
//! mismatch are delivered with `is_correct() == false`.

use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use snafu::ensure;
use tracing::{debug, info, warn};

use crate::{
    ConsumerOptions, InitPosition, Message, QueueConfig, Result, RetryPolicy, StreamMode,
    consume_state::{ConsumeState, Cursor},
    dispatcher::Dispatch,
    error::CorruptSegmentSnafu,
    format::{DEFAULT_BUF_LEN, FILE_HEAD_LEN, FrameHeader, INT_SIZE, MAX_MSG_SIZE, decode_header, read_u32},
    stream::{InputStream, open_input},
    writer::Writer,
};

/// Where payload bytes are read into.
pub enum PayloadBuffer {
    /// New allocation per message, for many messages in flight.
    Fresh,
    /// One reused allocation, for a single message in flight.
    Arena(BytesMut),
}

impl PayloadBuffer {
    /// Reads `len` bytes, `None` if the stream ended first.
    fn read(&mut self, input: &mut dyn InputStream, len: usize) -> io::Result<Option<Bytes>> {
        match self {
            Self::Fresh => {
                let mut buf = vec![0u8; len];
                if input.read_exact_or_eof(&mut buf)? < len {
                    return Ok(None);
                }
                Ok(Some(Bytes::from(buf)))
            }
            Self::Arena(arena) => {
                arena.clear();
                arena.resize(len, 0);
                if input.read_exact_or_eof(&mut arena[..])? < len {
                    return Ok(None);
                }
                Ok(Some(arena.split().freeze()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequentialStatus {
    /// Nothing in flight.
    Idle,
    /// Delivered, waiting for `confirm`.
    WaitConfirm,
    /// Handler failed, waiting for the retry delay.
    Failed,
}

/// State of a sequential consumer.
#[derive(Debug)]
pub struct SequentialState {
    status:       SequentialStatus,
    failed_times: u32,
    retried_at:   Instant,
    retry:        RetryPolicy,
    last:         Option<Message>,
    /// Segment and offset of the in-flight frame.
    inflight:     Option<(u32, u32)>,
}

impl SequentialState {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            status: SequentialStatus::Idle,
            failed_times: 0,
            retried_at: Instant::now(),
            retry,
            last: None,
            inflight: None,
        }
    }

    pub fn status(&self) -> SequentialStatus { self.status }

    pub fn failed_times(&self) -> u32 { self.failed_times }

    fn deliver(&mut self, msg: Message, file_no: u32, start: u32) {
        self.status = SequentialStatus::WaitConfirm;
        self.retried_at = Instant::now();
        self.last = Some(msg);
        self.inflight = Some((file_no, start));
    }
}

pub enum ReadMode {
    Concurrent,
    Sequential(SequentialState),
}

/// Reads one consumer's messages from the segments of a queue.
pub struct Reader {
    name:        String,
    writer:      Arc<Writer>,
    dispatcher:  Arc<dyn Dispatch>,
    stream_mode: StreamMode,
    state:       ConsumeState,
    input:       Option<Box<dyn InputStream>>,
    buffer:      PayloadBuffer,
    mode:        ReadMode,
    file_no:     Arc<AtomicU32>,
    closed:      bool,
}

impl Reader {
    /// Opens the cursor of `options.name` and positions the reader.
    pub fn open(
        writer: Arc<Writer>,
        dispatcher: Arc<dyn Dispatch>,
        config: &QueueConfig,
        options: &ConsumerOptions,
    ) -> Result<Self> {
        options.validate()?;
        let state = ConsumeState::open(writer.cursor_path(&options.name), config.buffered_pos)?;
        let (mode, buffer) = if options.sequential {
            (
                ReadMode::Sequential(SequentialState::new(config.retry)),
                PayloadBuffer::Arena(BytesMut::with_capacity(DEFAULT_BUF_LEN)),
            )
        } else {
            (ReadMode::Concurrent, PayloadBuffer::Fresh)
        };

        let mut reader = Self {
            name: options.name.clone(),
            file_no: Arc::new(AtomicU32::new(state.file_no())),
            writer,
            dispatcher,
            stream_mode: config.poll_mode(),
            state,
            input: None,
            buffer,
            mode,
            closed: false,
        };
        reader.init(options.position)?;
        Ok(reader)
    }

    fn init(&mut self, position: InitPosition) -> Result<()> {
        let Cursor { file_no, read_pos } = match position {
            InitPosition::End => {
                self.writer.hasten();
                let (file_no, size) = self.writer.tail();
                Cursor {
                    file_no,
                    read_pos: size,
                }
            }
            InitPosition::Head => Cursor {
                file_no:  self.writer.min_file_no(),
                read_pos: FILE_HEAD_LEN,
            },
            InitPosition::Cur => self.clamp(self.state.cursor()),
        };

        self.input = match self.open_segment(file_no) {
            Ok(Some(mut input)) => {
                if read_pos > FILE_HEAD_LEN {
                    input.skip(read_pos - FILE_HEAD_LEN)?;
                }
                Some(input)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(consumer = %self.name, file_no, error = %e, "Failed to open segment");
                None
            }
        };
        self.state.save_at(file_no, read_pos, true);
        self.file_no.store(file_no, Ordering::Release);

        debug!(
            queue = %self.writer.queue_key(),
            consumer = %self.name,
            ?position,
            file_no,
            read_pos,
            "Reader positioned"
        );
        Ok(())
    }

    /// Moves a stored cursor back into the retained segment range.
    fn clamp(&self, cursor: Cursor) -> Cursor {
        let writer_cur = self.writer.cur_file_no();
        let writer_min = self.writer.min_file_no();
        let read_pos = cursor.read_pos.max(FILE_HEAD_LEN);

        if cursor.file_no > writer_cur {
            warn!(
                consumer = %self.name,
                path = ?self.writer.segment_path(cursor.file_no),
                writer_cur,
                "Messages lost, cursor beyond the active segment"
            );
            return Cursor {
                file_no:  writer_cur,
                read_pos: FILE_HEAD_LEN,
            };
        }
        if cursor.file_no < writer_min {
            warn!(
                consumer = %self.name,
                path = ?self.writer.segment_path(cursor.file_no),
                writer_min,
                "Messages lost, cursor segment already removed"
            );
            return Cursor {
                file_no:  writer_min,
                read_pos: FILE_HEAD_LEN,
            };
        }
        Cursor {
            file_no: cursor.file_no,
            read_pos,
        }
    }

    /// Opens segment `file_no` positioned after its header.
    ///
    /// Returns `None` if the file does not exist.
    fn open_segment(&self, file_no: u32) -> Result<Option<Box<dyn InputStream>>> {
        let path = self.writer.segment_path(file_no);
        if !path.exists() {
            info!(path = ?path, "Segment not exists");
            return Ok(None);
        }
        let mut input = open_input(&path, self.stream_mode)?;
        let mut head = [0u8; FILE_HEAD_LEN as usize];
        let n = input.read_exact_or_eof(&mut head)?;
        let head_no = decode_header(&path, &head[..n])?;
        ensure!(
            head_no == file_no,
            CorruptSegmentSnafu {
                path,
                reason: format!("header file number {head_no} does not match {file_no}"),
            }
        );
        Ok(Some(input))
    }

    fn record_segment(&mut self, file_no: u32) {
        self.state.save_at(file_no, FILE_HEAD_LEN, true);
        self.file_no.store(file_no, Ordering::Release);
    }

    /// Opens the first segment after the current one that has data, or the
    /// active segment.
    fn open_next(&mut self) -> Option<Box<dyn InputStream>> {
        let last = self.writer.cur_file_no();
        let mut file_no = self.state.file_no() + 1;
        while file_no <= last {
            match self.open_segment(file_no) {
                Ok(Some(mut input)) => {
                    let has_data = matches!(input.has_more(INT_SIZE), Ok(true));
                    self.record_segment(file_no);
                    if has_data || file_no == last {
                        return Some(input);
                    }
                    debug!(consumer = %self.name, file_no, "Skip segment without messages");
                }
                Ok(None) => {}
                Err(e) => warn!(consumer = %self.name, file_no, error = %e, "Failed to open segment"),
            }
            file_no += 1;
        }
        None
    }

    /// Positions the stream on the next frame if one may be available.
    fn prepare(&mut self) -> Result<bool> {
        let cur = self.state.file_no();
        if cur >= self.writer.cur_file_no() {
            if self.input.is_none() {
                match self.open_segment(cur) {
                    Ok(Some(mut input)) => {
                        let pos = self.state.read_pos();
                        if pos > FILE_HEAD_LEN {
                            input.skip(pos - FILE_HEAD_LEN)?;
                        }
                        self.input = Some(input);
                    }
                    Ok(None) => return Ok(false),
                    Err(e) => {
                        warn!(consumer = %self.name, file_no = cur, error = %e, "Failed to open active segment");
                        return Ok(false);
                    }
                }
            }
            let Some(input) = self.input.as_mut() else {
                return Ok(false);
            };
            if !input.has_more(INT_SIZE)? {
                // remember where we idle
                let pos = input.read_pos();
                self.state.save(pos, false);
                return Ok(false);
            }
            return Ok(true);
        }

        let exhausted = match self.input.as_mut() {
            Some(input) => !input.has_more(INT_SIZE)?,
            None => true,
        };
        if exhausted {
            self.input = None;
            self.input = self.open_next();
            return match self.input.as_mut() {
                Some(input) => Ok(input.has_more(INT_SIZE)?),
                None => Ok(false),
            };
        }
        Ok(true)
    }

    /// Decodes the frame at the current position together with its offset.
    fn decode_frame(&mut self) -> Result<Option<(Message, u32)>> {
        let file_no = self.state.file_no();
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };

        let start = input.read_pos();
        let mut word = [0u8; INT_SIZE as usize];
        if input.read_exact_or_eof(&mut word)? < word.len() {
            input.rewind_to(start)?;
            return Ok(None);
        }
        let header = FrameHeader::parse(read_u32(&word));
        let body_len = header.body_len();

        if header.len as usize > MAX_MSG_SIZE {
            input.skip(body_len)?;
            let pos = input.read_pos();
            warn!(
                path = ?input.path(),
                pos = start,
                len = header.len,
                "Invalid message length, skipping frame"
            );
            self.state.save(pos, false);
            return Ok(None);
        }

        if !input.has_more(body_len)? {
            if file_no >= self.writer.cur_file_no() {
                // still being written
                input.rewind_to(start)?;
                return Ok(None);
            }
            // the writer flushes a segment before moving on, look once more
            if !input.has_more(body_len)? {
                warn!(
                    path = ?input.path(),
                    pos = start,
                    len = header.len,
                    "Truncated frame at end of segment, skipping the rest"
                );
                self.input = None;
                return Ok(None);
            }
        }

        let expected = if header.has_hash {
            let mut hash = [0u8; INT_SIZE as usize];
            input.read_exact_or_eof(&mut hash)?;
            Some(read_u32(&hash))
        } else {
            None
        };
        let Some(payload) = self.buffer.read(&mut **input, header.len as usize)? else {
            input.rewind_to(start)?;
            return Ok(None);
        };

        let correct = match expected {
            Some(hash) => {
                let ok = self.writer.hash_algorithm().verify(&payload, hash);
                if !ok {
                    warn!(path = ?input.path(), pos = start, "Invalid hash value");
                }
                ok
            }
            None => true,
        };
        Ok(Some((Message::new(payload, correct), start)))
    }

    fn fetch(&mut self) -> Result<Option<(Message, u32)>> {
        if !self.prepare()? {
            return Ok(None);
        }
        self.decode_frame()
    }

    /// Returns the next message to hand to the consumer, if any.
    ///
    /// Sequential readers return `None` while a message waits for `confirm`
    /// or while a failed one waits for its retry delay.
    pub fn read(&mut self) -> Result<Option<Message>> {
        if self.closed {
            return Ok(None);
        }
        let Some(status) = self.sequential_status() else {
            return Ok(self.fetch()?.map(|(msg, _)| msg));
        };
        match status {
            SequentialStatus::WaitConfirm => Ok(None),
            SequentialStatus::Failed => self.retry(),
            SequentialStatus::Idle => {
                let Some((msg, start)) = self.fetch()? else {
                    return Ok(None);
                };
                let file_no = self.state.file_no();
                if let ReadMode::Sequential(seq) = &mut self.mode {
                    seq.deliver(msg.clone(), file_no, start);
                }
                Ok(Some(msg))
            }
        }
    }

    fn retry(&mut self) -> Result<Option<Message>> {
        let ReadMode::Sequential(seq) = &mut self.mode else {
            return Ok(None);
        };
        if seq.retried_at.elapsed() <= seq.retry.backoff(seq.failed_times) {
            return Ok(None);
        }
        seq.retried_at = Instant::now();
        let reread = seq.failed_times >= seq.retry.max_failed_times;
        let inflight = seq.inflight;
        let last = seq.last.clone();

        let msg = match (reread, inflight) {
            (true, Some((file_no, start))) => match self.reread(file_no, start) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(consumer = %self.name, file_no, pos = start, error = %e, "Failed to re-read message");
                    None
                }
            },
            _ => last,
        };

        if let (Some(msg), ReadMode::Sequential(seq)) = (&msg, &mut self.mode) {
            seq.status = SequentialStatus::WaitConfirm;
            seq.last = Some(msg.clone());
        }
        Ok(msg)
    }

    /// Reopens segment `file_no` and decodes the frame at `start` again.
    fn reread(&mut self, file_no: u32, start: u32) -> Result<Option<Message>> {
        info!(
            consumer = %self.name,
            file_no,
            pos = start,
            "Too many failures, re-reading message from disk"
        );
        self.input = None;
        let Some(mut input) = self.open_segment(file_no)? else {
            return Ok(None);
        };
        input.skip(start.saturating_sub(FILE_HEAD_LEN))?;
        self.input = Some(input);
        Ok(self.decode_frame()?.map(|(msg, _)| msg))
    }

    /// Reports the outcome of the last delivered message.
    ///
    /// Ignored once the reader is closed.
    pub fn confirm(&mut self, ok: bool) {
        if self.closed {
            debug!(consumer = %self.name, ok, "Confirm after close ignored");
            return;
        }
        match &mut self.mode {
            ReadMode::Concurrent => {
                if let (true, Some(input)) = (ok, self.input.as_ref()) {
                    self.state.save(input.read_pos(), false);
                }
            }
            ReadMode::Sequential(seq) => {
                if seq.status != SequentialStatus::WaitConfirm {
                    debug!(consumer = %self.name, status = ?seq.status, "Unexpected confirm ignored");
                    return;
                }
                if ok {
                    seq.status = SequentialStatus::Idle;
                    seq.failed_times = 0;
                    seq.last = None;
                    seq.inflight = None;
                    if let Some(input) = self.input.as_ref() {
                        self.state.save(input.read_pos(), false);
                    }
                } else {
                    seq.status = SequentialStatus::Failed;
                    seq.failed_times += 1;
                    debug!(consumer = %self.name, failed_times = seq.failed_times, "Message failed");
                }
                self.dispatcher.ready();
            }
        }
    }

    /// Asks the writer to flush when this reader has caught up.
    pub fn hasten(&mut self) {
        let idle = match self.input.as_mut() {
            Some(input) => !matches!(input.has_more(INT_SIZE), Ok(true)),
            None => true,
        };
        if idle {
            self.writer.hasten();
        }
    }

    /// Persists the position and releases files. An unconfirmed sequential
    /// message is delivered again after reopening.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let pending = match &self.mode {
            ReadMode::Sequential(seq) if seq.status != SequentialStatus::Idle => seq.inflight,
            _ => None,
        };
        if let Some(input) = self.input.take() {
            let pos = match pending {
                Some((file_no, start)) if file_no == self.state.file_no() => start,
                _ => input.read_pos(),
            };
            self.state.save(pos, true);
        }
        self.state.close();
        debug!(consumer = %self.name, cursor = ?self.state.cursor(), "Reader closed");
    }

    pub fn is_closed(&self) -> bool { self.closed }

    pub fn name(&self) -> &str { &self.name }

    pub fn writer(&self) -> &Arc<Writer> { &self.writer }

    pub fn cur_file_no(&self) -> u32 { self.state.file_no() }

    pub fn cursor(&self) -> Cursor { self.state.cursor() }

    /// Shared view of the segment being read, updated on every switch.
    pub fn file_no_handle(&self) -> Arc<AtomicU32> { Arc::clone(&self.file_no) }

    pub fn is_sequential(&self) -> bool { matches!(self.mode, ReadMode::Sequential(_)) }

    pub fn sequential_status(&self) -> Option<SequentialStatus> {
        match &self.mode {
            ReadMode::Sequential(seq) => Some(seq.status()),
            ReadMode::Concurrent => None,
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) { self.close(); }
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("queue", &self.writer.queue_key())
            .field("name", &self.name)
            .field("cursor", &self.state.cursor())
            .field("sequential", &self.is_sequential())
            .finish_non_exhaustive()
    }
}
