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

//! File naming inside a queue directory.
//!
//! ```text
//! <dir>/<name>.<fileNo>      segment
//! <dir>/<name>_<consumer>    consumer cursor
//! ```

use std::path::{Path, PathBuf};

use crate::Result;

/// Returns the path of segment `file_no`: `dir/name.file_no`.
pub fn segment_path<P: AsRef<Path>>(dir: P, name: &str, file_no: u32) -> PathBuf {
    dir.as_ref().join(format!("{name}.{file_no}"))
}

/// Returns the cursor path of `consumer`: `dir/name_consumer`.
pub fn cursor_path<P: AsRef<Path>>(dir: P, name: &str, consumer: &str) -> PathBuf {
    dir.as_ref().join(format!("{name}_{consumer}"))
}

/// Parses the file number out of a segment file name belonging to `name`.
///
/// Returns `None` for anything that is not exactly `name.<digits>`.
pub fn parse_segment_no(name: &str, file_name: &str) -> Option<u32> {
    let suffix = file_name.strip_prefix(name)?.strip_prefix('.')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Lists all segments of `name` under `dir`, sorted by file number.
pub fn scan_segments<P: AsRef<Path>>(dir: P, name: &str) -> Result<Vec<(u32, PathBuf)>> {
    let dir = dir.as_ref();
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(no) = parse_segment_no(name, file_name) {
            segments.push((no, path));
        }
    }

    segments.sort_by_key(|(no, _)| *no);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(segment_path("/q", "orders", 7), PathBuf::from("/q/orders.7"));
        assert_eq!(
            cursor_path("/q", "orders", "billing"),
            PathBuf::from("/q/orders_billing")
        );
    }

    #[test]
    fn test_parse_segment_no() {
        assert_eq!(parse_segment_no("orders", "orders.0"), Some(0));
        assert_eq!(parse_segment_no("orders", "orders.42"), Some(42));
        assert_eq!(parse_segment_no("orders", "orders."), None);
        assert_eq!(parse_segment_no("orders", "orders.4x"), None);
        assert_eq!(parse_segment_no("orders", "orders_billing"), None);
        assert_eq!(parse_segment_no("orders", "ordersx.1"), None);
        assert_eq!(parse_segment_no("orders", "orders.99999999999"), None);
    }

    #[test]
    fn test_scan_segments() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let base = temp_dir.path();

        for name in ["q.3", "q.1", "q.10", "q_c1", "other.2", "q.tmp"] {
            std::fs::File::create(base.join(name)).unwrap();
        }
        std::fs::create_dir(base.join("q.5")).unwrap();

        let found: Vec<u32> = scan_segments(base, "q")
            .unwrap()
            .into_iter()
            .map(|(no, _)| no)
            .collect();
        assert_eq!(found, vec![1, 3, 10]);
    }

    #[test]
    fn test_scan_missing_dir() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let found = scan_segments(temp_dir.path().join("nope"), "q").unwrap();
        assert!(found.is_empty());
    }
}
