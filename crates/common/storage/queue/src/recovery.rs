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

//! Startup scan and offline verification of segment files.
//!
//! The writer never appends to a segment left over from a previous run. On
//! startup it only needs the range of valid file numbers:
//! 1. List `<name>.<fileNo>` files in the queue directory
//! 2. Validate each header (magic, version, file number matches the name)
//! 3. Return [`SegmentRange`] over the valid ones, writing resumes at `max + 1`
//!
//! Segments with a broken header are left on disk but excluded from the range.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::{
    HashAlgorithm, Result,
    format::{FILE_HEAD_LEN, FrameHeader, INT_SIZE, MAX_MSG_SIZE, decode_header, read_u32},
    path::scan_segments,
    stream::{DirectInput, InputStream},
};

/// Valid file numbers found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRange {
    pub min_file_no: u32,
    pub max_file_no: u32,
}

/// Reads and validates the header of the segment at `path`.
///
/// Returns the file number stored in the header.
pub fn read_segment_header(path: &Path) -> Result<u32> {
    let mut head = [0u8; FILE_HEAD_LEN as usize];
    let n = DirectInput::open(path)?.read_exact_or_eof(&mut head)?;
    decode_header(path, &head[..n])
}

/// Scans `dir` for segments of queue `name`.
///
/// Returns `None` when no valid segment exists.
pub fn scan_segment_range(dir: &Path, name: &str) -> Result<Option<SegmentRange>> {
    let mut range: Option<SegmentRange> = None;

    for (file_no, path) in scan_segments(dir, name)? {
        match read_segment_header(&path) {
            Ok(head_no) if head_no == file_no => {
                range = Some(match range {
                    None => SegmentRange {
                        min_file_no: file_no,
                        max_file_no: file_no,
                    },
                    Some(r) => SegmentRange {
                        min_file_no: r.min_file_no.min(file_no),
                        max_file_no: r.max_file_no.max(file_no),
                    },
                });
            }
            Ok(head_no) => {
                warn!(path = ?path, file_no, head_no, "Segment header does not match its name, ignoring");
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Invalid segment header, ignoring");
            }
        }
    }

    info!(dir = ?dir, name, range = ?range, "Segment scan complete");
    Ok(range)
}

/// Result of walking every frame of one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentReport {
    pub file_no:           u32,
    pub header_ok:         bool,
    pub frames:            u64,
    pub hashed_frames:     u64,
    pub checksum_failures: u64,
    pub oversized_frames:  u64,
    pub bytes:             u64,
    /// Bytes at the end that do not form a complete frame.
    pub torn_tail:         u64,
}

/// Walks all frames of a segment, verifying checksums with `algorithm`.
///
/// A broken header is reported, not returned as an error.
pub fn verify_segment(path: &Path, file_no: u32, algorithm: HashAlgorithm) -> Result<SegmentReport> {
    let mut report = SegmentReport {
        file_no,
        bytes: std::fs::metadata(path)?.len(),
        ..SegmentReport::default()
    };

    match read_segment_header(path) {
        Ok(head_no) if head_no == file_no => report.header_ok = true,
        Ok(head_no) => {
            warn!(path = ?path, file_no, head_no, "Segment header does not match its name");
            return Ok(report);
        }
        Err(e) => {
            warn!(path = ?path, error = %e, "Invalid segment header");
            return Ok(report);
        }
    }

    let mut input = DirectInput::open(path)?;
    input.skip(FILE_HEAD_LEN)?;
    let mut word = [0u8; INT_SIZE as usize];
    let mut body = Vec::new();

    loop {
        let frame_start = input.read_pos();
        if !input.has_more(INT_SIZE)? {
            report.torn_tail = report.bytes - u64::from(frame_start);
            break;
        }
        input.read_exact_or_eof(&mut word)?;
        let header = FrameHeader::parse(read_u32(&word));

        if header.len as usize > MAX_MSG_SIZE {
            report.oversized_frames += 1;
            if !input.has_more(header.body_len())? {
                report.torn_tail = report.bytes - u64::from(frame_start);
                break;
            }
            input.skip(header.body_len())?;
            continue;
        }

        if !input.has_more(header.body_len())? {
            report.torn_tail = report.bytes - u64::from(frame_start);
            break;
        }
        body.resize(header.body_len() as usize, 0);
        input.read_exact_or_eof(&mut body)?;

        report.frames += 1;
        if header.has_hash {
            report.hashed_frames += 1;
            let (hash, payload) = body.split_at(INT_SIZE as usize);
            if !algorithm.verify(payload, read_u32(hash)) {
                report.checksum_failures += 1;
            }
        }
    }

    debug!(path = ?path, report = ?report, "Segment verified");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        format::{encode_frame, encode_header},
        path::segment_path,
    };

    fn write_segment(dir: &Path, name: &str, file_no: u32, head_no: u32, frames: &[(&[u8], bool)]) -> PathBuf {
        let path = segment_path(dir, name, file_no);
        let mut data = encode_header(head_no).to_vec();
        let mut buf = Vec::new();
        for (payload, hashed) in frames {
            let hash = hashed.then(|| HashAlgorithm::Rolling.checksum(payload));
            encode_frame(&mut buf, payload, hash);
            data.extend_from_slice(&buf);
        }
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_scan_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(scan_segment_range(temp_dir.path(), "q").unwrap(), None);
    }

    #[test]
    fn test_scan_skips_invalid_headers() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        write_segment(dir, "q", 2, 2, &[]);
        write_segment(dir, "q", 3, 3, &[]);
        // name says 9, header says 4
        write_segment(dir, "q", 9, 4, &[]);
        // header truncated
        std::fs::write(segment_path(dir, "q", 0), b"QUE").unwrap();

        let range = scan_segment_range(dir, "q").unwrap().unwrap();
        assert_eq!(
            range,
            SegmentRange {
                min_file_no: 2,
                max_file_no: 3,
            }
        );
    }

    #[test]
    fn test_verify_counts_frames_and_failures() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_segment(
            temp_dir.path(),
            "q",
            0,
            0,
            &[(b"a", false), (b"bb", true), (b"ccc", true)],
        );

        // flip the last payload byte of "ccc"
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        data.extend_from_slice(&[0, 0]);
        std::fs::write(&path, &data).unwrap();

        let report = verify_segment(&path, 0, HashAlgorithm::Rolling).unwrap();
        assert!(report.header_ok);
        assert_eq!(report.frames, 3);
        assert_eq!(report.hashed_frames, 2);
        assert_eq!(report.checksum_failures, 1);
        assert_eq!(report.torn_tail, 2);
    }

    #[test]
    fn test_verify_reports_header_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_segment(temp_dir.path(), "q", 1, 5, &[(b"x", false)]);
        let report = verify_segment(&path, 1, HashAlgorithm::Rolling).unwrap();
        assert!(!report.header_ok);
        assert_eq!(report.frames, 0);
    }
}
