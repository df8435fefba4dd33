//! Mark-space management and marks-file scanning.
//!
//! Every object in a fast-import stream is labelled with a mark, a small
//! positive integer. One repository owns a single 20-bit mark space: commit
//! marks grow upward from 1, blob marks grow downward from [`MAX_MARK`], and
//! the two counters must never meet. The mark above [`MAX_MARK`] is reserved
//! for the notes ref.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::warn;

use crate::errors::{MarksError, RepositoryError};

/// Largest usable mark. Some importer versions are buggy for larger values.
pub const MAX_MARK: u32 = (1 << 20) - 2;

/// Repository-wide mark reserved for note commits on `refs/notes/commits`.
pub const NOTES_MARK: u32 = MAX_MARK + 1;

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Two-directional mark allocator for a single repository.
#[derive(Debug)]
pub struct MarkAllocator {
    repository: String,
    last_commit_mark: u32,
    next_file_mark: u32,
}

impl MarkAllocator {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            last_commit_mark: 0,
            next_file_mark: MAX_MARK,
        }
    }

    /// Allocate the next commit mark, growing upward.
    pub fn next_commit_mark(&mut self) -> Result<u32, RepositoryError> {
        let mark = self.last_commit_mark + 1;
        if mark + 1 >= self.next_file_mark {
            return Err(RepositoryError::MarkSpaceExhausted {
                repository: self.repository.clone(),
            });
        }
        self.last_commit_mark = mark;
        Ok(mark)
    }

    /// Allocate the next blob mark, growing downward.
    pub fn next_blob_mark(&mut self) -> Result<u32, RepositoryError> {
        let mark = self.next_file_mark;
        if mark <= self.last_commit_mark + 1 {
            return Err(RepositoryError::MarkSpaceExhausted {
                repository: self.repository.clone(),
            });
        }
        self.next_file_mark = mark - 1;
        Ok(mark)
    }

    /// Reclaim the blob half of the space. Valid only while no transaction
    /// is outstanding, since blobs are referenced by at most one pending
    /// commit.
    pub fn release_blob_marks(&mut self) {
        self.next_file_mark = MAX_MARK;
    }

    /// Lift the commit watermark to a mark recovered from a previous run.
    pub fn record_high_water(&mut self, mark: u32) {
        if self.last_commit_mark < mark {
            self.last_commit_mark = mark;
        }
    }

    pub fn last_commit_mark(&self) -> u32 {
        self.last_commit_mark
    }

    pub fn next_file_mark(&self) -> u32 {
        self.next_file_mark
    }
}

// ---------------------------------------------------------------------------
// Marks file scan
// ---------------------------------------------------------------------------

/// Scan the export-marks file and return the largest mark `M` such that
/// every mark in `[1, M]` appears exactly once, in order.
///
/// The file is authored by the fast-import child (`:<mark> <sha>` per line,
/// sorted). A gap, duplicate or descending pair ends the scan at the
/// previous mark: everything past it is from an interrupted checkpoint and
/// will be re-exported. A line that does not look like a mark at all, seen
/// before any gap, means the file is not a marks file.
pub fn last_valid_mark(path: &Path) -> Result<u32, MarksError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut prev_mark: u32 = 0;
    let mut lineno: u64 = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        lineno += 1;
        if line.is_empty() {
            continue;
        }

        let mark = parse_mark_line(&line).ok_or(MarksError::Corrupt {
            path: path.to_path_buf(),
            line: lineno,
        })?;

        if mark <= prev_mark {
            warn!(
                path = %path.display(),
                line = lineno,
                mark,
                "marks file has duplicate or unsorted entries, stopping scan"
            );
            break;
        }
        if mark > prev_mark + 1 {
            break;
        }
        prev_mark = mark;
    }

    Ok(prev_mark)
}

fn parse_mark_line(line: &str) -> Option<u32> {
    let rest = line.strip_prefix(':')?;
    let (number, _sha) = rest.split_once(' ')?;
    match number.parse::<u32>() {
        Ok(mark) if mark > 0 => Some(mark),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_directions() {
        let mut alloc = MarkAllocator::new("repo");
        assert_eq!(alloc.next_commit_mark().unwrap(), 1);
        assert_eq!(alloc.next_commit_mark().unwrap(), 2);
        assert_eq!(alloc.next_blob_mark().unwrap(), MAX_MARK);
        assert_eq!(alloc.next_blob_mark().unwrap(), MAX_MARK - 1);
        assert!(alloc.next_file_mark() > alloc.last_commit_mark() + 1);
    }

    #[test]
    fn test_allocator_exhaustion() {
        let mut alloc = MarkAllocator::new("repo");
        alloc.record_high_water(MAX_MARK - 3);
        assert_eq!(alloc.next_blob_mark().unwrap(), MAX_MARK);
        assert_eq!(alloc.next_blob_mark().unwrap(), MAX_MARK - 1);
        // next_file_mark is now MAX_MARK - 2 == last_commit_mark + 1
        assert!(matches!(
            alloc.next_blob_mark(),
            Err(RepositoryError::MarkSpaceExhausted { .. })
        ));
        assert!(matches!(
            alloc.next_commit_mark(),
            Err(RepositoryError::MarkSpaceExhausted { .. })
        ));
    }

    #[test]
    fn test_release_blob_marks() {
        let mut alloc = MarkAllocator::new("repo");
        alloc.next_blob_mark().unwrap();
        alloc.next_blob_mark().unwrap();
        alloc.release_blob_marks();
        assert_eq!(alloc.next_blob_mark().unwrap(), MAX_MARK);
    }

    #[test]
    fn test_record_high_water_only_lifts() {
        let mut alloc = MarkAllocator::new("repo");
        alloc.record_high_water(7);
        alloc.record_high_water(3);
        assert_eq!(alloc.last_commit_mark(), 7);
        assert_eq!(alloc.next_commit_mark().unwrap(), 8);
    }

    fn write_marks(lines: &[&str]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marks-repo");
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        (dir, path)
    }

    #[test]
    fn test_last_valid_mark_contiguous() {
        let (_dir, path) = write_marks(&[
            ":1 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            ":2 bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            ":3 cccccccccccccccccccccccccccccccccccccccc",
        ]);
        assert_eq!(last_valid_mark(&path).unwrap(), 3);
    }

    #[test]
    fn test_last_valid_mark_stops_at_gap() {
        let (_dir, path) = write_marks(&[
            ":1 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            ":2 bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            ":5 cccccccccccccccccccccccccccccccccccccccc",
        ]);
        assert_eq!(last_valid_mark(&path).unwrap(), 2);
    }

    #[test]
    fn test_last_valid_mark_stops_at_duplicate() {
        let (_dir, path) = write_marks(&[
            ":1 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            ":1 bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            ":2 cccccccccccccccccccccccccccccccccccccccc",
        ]);
        assert_eq!(last_valid_mark(&path).unwrap(), 1);
    }

    #[test]
    fn test_last_valid_mark_corrupt_line() {
        let (_dir, path) = write_marks(&["not a marks line"]);
        assert!(matches!(
            last_valid_mark(&path),
            Err(MarksError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn test_last_valid_mark_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(last_valid_mark(&dir.path().join("absent")).unwrap(), 0);
    }
}
