//! Incremental reader for a log file that another process appends to.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

/// Tracks how far into a growing file we have read.
///
/// Only complete lines advance the offset; a line still being written is read again
/// on the next poll. The offset never moves backwards, so a file that shrinks or is
/// replaced yields nothing until it grows past the old end.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
}

impl LogTailer {
    /// Start tailing `path` from the beginning. The file does not need to exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Complete lines appended since the previous poll.
    pub fn poll_new_lines(&mut self) -> Vec<String> {
        self.read_new(false)
    }

    /// Like [`poll_new_lines`](Self::poll_new_lines), but also returns an unterminated
    /// last line. Used once the writer is known to be gone.
    pub fn drain(&mut self) -> Vec<String> {
        self.read_new(true)
    }

    fn read_new(&mut self, include_partial: bool) -> Vec<String> {
        let bytes = match self.read_from_offset() {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(path = %self.path.display(), "log read failed: {e}");
                }
                return Vec::new();
            }
        };

        let consumed = if include_partial {
            bytes.len()
        } else {
            bytes
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(0, |last| last + 1)
        };
        if consumed == 0 {
            return Vec::new();
        }

        let mut chunk = &bytes[..consumed];
        if chunk.last() == Some(&b'\n') {
            chunk = &chunk[..chunk.len() - 1];
        }
        self.offset += consumed as u64;

        chunk
            .split(|&b| b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    fn read_from_offset(&self) -> io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len <= self.offset {
            return Ok(Vec::new());
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}
