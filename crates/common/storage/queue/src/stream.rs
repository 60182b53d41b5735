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

//! Byte streams over segment and cursor files.
//!
//! Two flavours are provided and selected with [`StreamMode`]:
//!
//! - `Direct`: every write goes straight to the file, readers see it at once.
//! - `Buffered`: `BufReader`/`BufWriter`, writes become visible after a flush.
//!
//! Readers track their own position and a cached file length. The cached
//! length may lag behind the writer, it is only refreshed when it claims there
//! is not enough data.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Selects how a segment file is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    #[default]
    Direct,
    Buffered,
}

/// Sequential reader over one file.
pub trait InputStream: Send {
    fn path(&self) -> &Path;

    /// Byte offset of the next read.
    fn read_pos(&self) -> u32;

    /// Reads up to `buf.len()` bytes, returns how many were read.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Moves the read position forward by `n` bytes. The file is not required
    /// to be that long yet.
    fn skip(&mut self, n: u32) -> io::Result<()>;

    /// Moves the read position back to `pos`.
    fn rewind_to(&mut self, pos: u32) -> io::Result<()>;

    /// Whether at least `n` bytes are available past the read position.
    fn has_more(&mut self, n: u32) -> io::Result<bool>;

    /// Fills `buf` unless end of file is hit first; returns the bytes read.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

/// Append-only writer over one file.
pub trait OutputStream: Send {
    fn path(&self) -> &Path;

    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Pushes buffered bytes to the OS so readers can see them.
    fn flush(&mut self) -> io::Result<()>;

    /// Flushes and waits for the data to reach the disk.
    fn sync(&mut self) -> io::Result<()>;

    /// Bytes written to the file so far, including pre-existing content.
    fn size(&self) -> u64;
}

/// Access to the file underneath a possibly buffered handle.
pub trait FileBacked {
    fn file(&self) -> &File;
}

impl FileBacked for File {
    fn file(&self) -> &File { self }
}

impl FileBacked for BufReader<File> {
    fn file(&self) -> &File { self.get_ref() }
}

impl FileBacked for BufWriter<File> {
    fn file(&self) -> &File { self.get_ref() }
}

/// Input stream over any seekable file handle.
pub struct SegmentInput<R> {
    inner:      R,
    path:       PathBuf,
    pos:        u64,
    cached_len: u64,
}

pub type DirectInput = SegmentInput<File>;
pub type BufferedInput = SegmentInput<BufReader<File>>;

impl<R: Read + Seek + FileBacked> SegmentInput<R> {
    fn new(inner: R, path: PathBuf) -> io::Result<Self> {
        let cached_len = inner.file().metadata()?.len();
        Ok(Self {
            inner,
            path,
            pos: 0,
            cached_len,
        })
    }

    fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }
}

impl DirectInput {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Self::new(file, path)
    }
}

impl BufferedInput {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Self::new(BufReader::new(file), path)
    }
}

impl<R: Read + Seek + FileBacked + Send> InputStream for SegmentInput<R> {
    fn path(&self) -> &Path { &self.path }

    // Positions are bounded by the validated maximum segment size.
    #[allow(clippy::cast_possible_truncation)]
    fn read_pos(&self) -> u32 { self.pos as u32 }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        self.cached_len = self.cached_len.max(self.pos);
        Ok(n)
    }

    fn skip(&mut self, n: u32) -> io::Result<()> { self.seek_to(self.pos + u64::from(n)) }

    fn rewind_to(&mut self, pos: u32) -> io::Result<()> { self.seek_to(u64::from(pos)) }

    fn has_more(&mut self, n: u32) -> io::Result<bool> {
        let want = self.pos + u64::from(n);
        if self.cached_len >= want {
            return Ok(true);
        }
        self.cached_len = self.inner.file().metadata()?.len();
        Ok(self.cached_len >= want)
    }
}

/// Output stream over any writable file handle.
pub struct SegmentOutput<W: Write> {
    inner: W,
    path:  PathBuf,
    size:  u64,
}

pub type DirectOutput = SegmentOutput<File>;
pub type BufferedOutput = SegmentOutput<BufWriter<File>>;

fn open_for_write(path: &Path, truncate: bool) -> io::Result<(File, u64)> {
    let mut opts = OpenOptions::new();
    opts.create(true);
    if truncate {
        opts.write(true).truncate(true);
    } else {
        opts.append(true);
    }
    let file = opts.open(path)?;
    let size = file.metadata()?.len();
    Ok((file, size))
}

impl DirectOutput {
    /// Creates `path`, discarding any previous content.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (inner, size) = open_for_write(&path, true)?;
        Ok(Self { inner, path, size })
    }

    /// Opens `path` for appending, creating it if missing.
    pub fn append<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (inner, size) = open_for_write(&path, false)?;
        Ok(Self { inner, path, size })
    }
}

impl BufferedOutput {
    /// Creates `path`, discarding any previous content.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, size) = open_for_write(&path, true)?;
        Ok(Self {
            inner: BufWriter::new(file),
            path,
            size,
        })
    }
}

impl<W: Write + FileBacked + Send> OutputStream for SegmentOutput<W> {
    fn path(&self) -> &Path { &self.path }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)?;
        self.size += buf.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> { self.inner.flush() }

    fn sync(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.file().sync_data()
    }

    fn size(&self) -> u64 { self.size }
}

/// Opens `path` for reading in the given mode.
pub fn open_input(path: &Path, mode: StreamMode) -> io::Result<Box<dyn InputStream>> {
    Ok(match mode {
        StreamMode::Direct => Box::new(DirectInput::open(path)?),
        StreamMode::Buffered => Box::new(BufferedInput::open(path)?),
    })
}

/// Creates `path` for writing in the given mode, truncating it.
pub fn create_output(path: &Path, mode: StreamMode) -> io::Result<Box<dyn OutputStream>> {
    Ok(match mode {
        StreamMode::Direct => Box::new(DirectOutput::create(path)?),
        StreamMode::Buffered => Box::new(BufferedOutput::create(path)?),
    })
}
