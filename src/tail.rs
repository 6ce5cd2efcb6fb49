//! Incremental log reading with per-file cursors.
//!
//! A cursor is the byte offset just past the last complete line delivered.
//! A trailing line without `\n` is left unread until its newline arrives,
//! so partial writes are never delivered twice or split in half.
//!
//! Cursors belong to the file, not its name: they are keyed by device and
//! inode, so a file renamed by log rotation keeps its position.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Bytes inspected when deciding whether a new file is binary.
const BINARY_SNIFF_LEN: usize = 8000;

/// Lines read by one call to [`Cursors::read_new`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    pub lines: Vec<String>,
    /// The file shrank below the stored cursor and was re-read from 0.
    pub truncated: bool,
    /// First read of a file that had no cursor.
    pub first_read: bool,
    /// Name the file had when it was last read, if it has been renamed since.
    pub renamed_from: Option<PathBuf>,
    /// NUL bytes near the start of the file (e.g. a compressed rotation).
    /// The content is skipped and the cursor parked at the end.
    pub binary: bool,
    /// Cursor after this read.
    pub offset: u64,
}

/// Device and inode: stays the same across renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

#[derive(Debug)]
struct Cursor {
    /// Last name the file was read under.
    path: PathBuf,
    offset: u64,
}

fn read_to_end_from(file: &mut File, offset: u64) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Split `buf` (read from `offset`) into complete lines.
///
/// Returns the lines and the new line-boundary offset. Invalid UTF-8 is
/// replaced rather than rejected.
fn split_lines(buf: &[u8], offset: u64) -> (Vec<String>, u64) {
    let consumed = match buf.iter().rposition(|b| *b == b'\n') {
        Some(last_newline) => last_newline + 1,
        None => return (Vec::new(), offset),
    };

    let lines = buf[..consumed - 1]
        .split(|b| *b == b'\n')
        .map(|l| {
            let l = l.strip_suffix(b"\r").unwrap_or(l);
            String::from_utf8_lossy(l).into_owned()
        })
        .collect();

    (lines, offset + consumed as u64)
}

fn looks_binary(buf: &[u8]) -> bool {
    buf[..buf.len().min(BINARY_SNIFF_LEN)].contains(&0)
}

/// Offset just past the last `\n` in the file, scanning backwards from the end.
fn last_line_boundary(file: &mut File, len: u64) -> std::io::Result<u64> {
    const BLOCK: u64 = 8 * 1024;
    let mut end = len;
    let mut buf = vec![0u8; BLOCK as usize];

    while end > 0 {
        let start = end.saturating_sub(BLOCK);
        let block = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(block)?;
        if let Some(pos) = block.iter().rposition(|b| *b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Per-file read cursors.
#[derive(Debug, Default)]
pub struct Cursors {
    entries: HashMap<FileId, Cursor>,
}

impl Cursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `path` from its current end, so only content appended
    /// later is delivered. The cursor is placed on a line boundary and
    /// returned.
    pub fn track_from_end(&mut self, path: &Path) -> std::io::Result<u64> {
        let mut file = File::open(path)?;
        let meta = file.metadata()?;
        let end = last_line_boundary(&mut file, meta.len())?;
        self.entries.insert(
            FileId::of(&meta),
            Cursor {
                path: path.to_path_buf(),
                offset: end,
            },
        );
        Ok(end)
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Drop the cursor for a file that was deleted under `path`.
    pub fn forget(&mut self, path: &Path) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, cursor| cursor.path != path);
        self.entries.len() < before
    }

    /// Keep only cursors for files still present under one of `live`.
    /// Returns how many were dropped.
    pub fn retain_live(&mut self, live: &[PathBuf]) -> usize {
        let ids: HashSet<FileId> = live
            .iter()
            .filter_map(|path| std::fs::metadata(path).ok())
            .map(|meta| FileId::of(&meta))
            .collect();
        let before = self.entries.len();
        self.entries.retain(|id, _| ids.contains(id));
        before - self.entries.len()
    }

    /// Read lines appended since the last call. Files without a cursor
    /// start at 0.
    pub fn read_new(&mut self, path: &Path) -> std::io::Result<Chunk> {
        let mut file = File::open(path)?;
        let meta = file.metadata()?;
        let id = FileId::of(&meta);
        let len = meta.len();

        let mut chunk = Chunk::default();
        let mut offset = match self.entries.get_mut(&id) {
            Some(cursor) => {
                if cursor.path != path {
                    chunk.renamed_from = Some(std::mem::replace(
                        &mut cursor.path,
                        path.to_path_buf(),
                    ));
                }
                cursor.offset
            }
            None => {
                chunk.first_read = true;
                0
            }
        };

        if len < offset {
            tracing::warn!(
                path = %path.display(),
                cursor = offset,
                size = len,
                "file shrank below cursor, reading from start"
            );
            chunk.truncated = true;
            offset = 0;
        }

        let buf = read_to_end_from(&mut file, offset)?;
        if offset == 0 && looks_binary(&buf) {
            chunk.binary = true;
            offset += buf.len() as u64;
        } else {
            let (lines, new_offset) = split_lines(&buf, offset);
            chunk.lines = lines;
            offset = new_offset;
        }

        self.entries.insert(
            id,
            Cursor {
                path: path.to_path_buf(),
                offset,
            },
        );
        chunk.offset = offset;
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn read_from(path: &Path, offset: u64) -> (Vec<String>, u64) {
        let mut file = File::open(path).unwrap();
        let buf = read_to_end_from(&mut file, offset).unwrap();
        split_lines(&buf, offset)
    }

    #[test]
    fn test_read_from_returns_complete_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "one\ntwo\n").unwrap();

        let (lines, offset) = read_from(&path, 0);
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(offset, 8);
    }

    #[test]
    fn test_partial_trailing_line_left_unread() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "done\nhalf").unwrap();

        let (lines, offset) = read_from(&path, 0);
        assert_eq!(lines, vec!["done"]);
        assert_eq!(offset, 5);

        // No newline yet: nothing new, cursor unchanged
        let (lines, again) = read_from(&path, offset);
        assert!(lines.is_empty());
        assert_eq!(again, 5);

        append(&path, " more\n");
        let (lines, _) = read_from(&path, offset);
        assert_eq!(lines, vec!["half more"]);
    }

    #[test]
    fn test_crlf_is_stripped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("win.log");
        std::fs::write(&path, "ERROR x\r\n").unwrap();
        let (lines, _) = read_from(&path, 0);
        assert_eq!(lines, vec!["ERROR x"]);
    }

    #[test]
    fn test_cursor_yields_only_appended_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old 1\nold 2\n").unwrap();

        let mut cursors = Cursors::new();
        assert_eq!(cursors.track_from_end(&path).unwrap(), 12);

        append(&path, "new 1\n");
        let chunk = cursors.read_new(&path).unwrap();
        assert_eq!(chunk.lines, vec!["new 1"]);
        assert!(!chunk.truncated);
        assert!(!chunk.first_read);

        // Re-reading at the same offset delivers nothing
        let chunk = cursors.read_new(&path).unwrap();
        assert!(chunk.lines.is_empty());

        append(&path, "new 2\nnew 3\n");
        let chunk = cursors.read_new(&path).unwrap();
        assert_eq!(chunk.lines, vec!["new 2", "new 3"]);
    }

    #[test]
    fn test_untracked_file_reads_from_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.log");
        std::fs::write(&path, "first\n").unwrap();

        let mut cursors = Cursors::new();
        let chunk = cursors.read_new(&path).unwrap();
        assert!(chunk.first_read);
        assert_eq!(chunk.lines, vec!["first"]);
        assert_eq!(cursors.tracked_count(), 1);
        assert!(!cursors.read_new(&path).unwrap().first_read);
    }

    #[test]
    fn test_truncation_resets_cursor_to_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rotated.log");
        std::fs::write(&path, "a long line before rotation\n").unwrap();

        let mut cursors = Cursors::new();
        cursors.track_from_end(&path).unwrap();

        std::fs::write(&path, "short\n").unwrap();
        let chunk = cursors.read_new(&path).unwrap();
        assert!(chunk.truncated);
        assert_eq!(chunk.lines, vec!["short"]);
        assert_eq!(chunk.offset, 6);
    }

    #[test]
    fn test_track_from_end_stops_at_line_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.log");
        std::fs::write(&path, "whole\npart").unwrap();

        let mut cursors = Cursors::new();
        assert_eq!(cursors.track_from_end(&path).unwrap(), 6);

        append(&path, "ial\n");
        let chunk = cursors.read_new(&path).unwrap();
        assert_eq!(chunk.lines, vec!["partial"]);
    }

    #[test]
    fn test_renamed_file_keeps_its_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        let rotated = dir.path().join("app.log.1");
        std::fs::write(&path, "").unwrap();

        let mut cursors = Cursors::new();
        cursors.track_from_end(&path).unwrap();
        append(&path, "ERROR one\n");
        assert_eq!(cursors.read_new(&path).unwrap().lines, vec!["ERROR one"]);

        std::fs::rename(&path, &rotated).unwrap();
        append(&rotated, "late write\n");
        let chunk = cursors.read_new(&rotated).unwrap();
        assert_eq!(chunk.lines, vec!["late write"]);
        assert!(!chunk.first_read);
        assert_eq!(chunk.renamed_from.as_deref(), Some(path.as_path()));

        // The replacement under the old name is a different file
        std::fs::write(&path, "fresh\n").unwrap();
        let chunk = cursors.read_new(&path).unwrap();
        assert!(chunk.first_read);
        assert_eq!(chunk.lines, vec!["fresh"]);
        assert_eq!(cursors.tracked_count(), 2);
    }

    #[test]
    fn test_new_binary_file_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log.2.gz");
        std::fs::write(&path, "").unwrap();

        // Seen while still empty, then written in one go
        let mut cursors = Cursors::new();
        assert!(!cursors.read_new(&path).unwrap().binary);
        std::fs::write(&path, b"\x1f\x8b\x08\x00ERROR\n\x00\x00").unwrap();
        let chunk = cursors.read_new(&path).unwrap();
        assert!(chunk.binary);
        assert!(chunk.lines.is_empty());
        assert_eq!(chunk.offset, 12);
    }

    #[test]
    fn test_forgotten_file_rereads_from_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.log");
        std::fs::write(&path, "before\n").unwrap();

        let mut cursors = Cursors::new();
        cursors.track_from_end(&path).unwrap();
        assert!(cursors.forget(&path));
        assert!(!cursors.forget(&path));
        assert_eq!(cursors.tracked_count(), 0);

        std::fs::write(&path, "after\n").unwrap();
        assert_eq!(cursors.read_new(&path).unwrap().lines, vec!["after"]);
    }

    #[test]
    fn test_retain_live_drops_vanished_files() {
        let dir = tempdir().unwrap();
        let kept = dir.path().join("kept.log");
        let gone = dir.path().join("app.log.2024-01-01");
        std::fs::write(&kept, "a\n").unwrap();
        std::fs::write(&gone, "b\n").unwrap();

        let mut cursors = Cursors::new();
        cursors.track_from_end(&kept).unwrap();
        cursors.track_from_end(&gone).unwrap();
        std::fs::remove_file(&gone).unwrap();

        assert_eq!(cursors.retain_live(&[kept.clone()]), 1);
        assert_eq!(cursors.tracked_count(), 1);
        assert_eq!(cursors.retain_live(&[kept]), 0);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let mut cursors = Cursors::new();
        assert!(cursors.read_new(&dir.path().join("gone.log")).is_err());
    }
}
