//! Incremental line reads from a file that is being appended to.

use std::io::SeekFrom;
use std::path::PathBuf;

use tokio::io::{self, AsyncReadExt, AsyncSeekExt};

/// Result of one incremental read.
#[derive(Debug, PartialEq, Eq)]
pub enum TailRead {
    /// Complete lines appended since the last read. May be empty.
    Lines(Vec<String>),
    /// The file shrank below the read position. The position has been reset
    /// to the start of the file and nothing was read.
    Truncated,
}

/// Tracks a byte offset into a file so successive reads return only the
/// lines appended in between. An unterminated trailing line is left in
/// place until its newline arrives.
#[derive(Debug)]
pub struct LineTail {
    path: PathBuf,
    position: u64,
}

impl LineTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            position: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub async fn read_new_lines(&mut self) -> io::Result<TailRead> {
        let bytes = match self.read_from_position().await? {
            Some(bytes) => bytes,
            None => {
                self.position = 0;
                return Ok(TailRead::Truncated);
            }
        };

        let Some(last_newline) = bytes.iter().rposition(|&b| b == b'\n') else {
            return Ok(TailRead::Lines(Vec::new()));
        };
        let complete = &bytes[..=last_newline];
        self.position += complete.len() as u64;

        let lines = complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect();
        Ok(TailRead::Lines(lines))
    }

    /// Consume whatever follows the last complete line, even without a
    /// terminating newline. Used once when tailing stops so a final record
    /// that was never terminated is not lost.
    pub async fn read_remainder(&mut self) -> io::Result<Option<String>> {
        let Some(bytes) = self.read_from_position().await? else {
            self.position = 0;
            return Ok(None);
        };
        self.position += bytes.len() as u64;

        let text = String::from_utf8_lossy(&bytes);
        let text = text.trim();
        if text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(text.to_string()))
        }
    }

    /// Bytes from the current position to EOF, or `None` if the file is now
    /// shorter than the position.
    async fn read_from_position(&self) -> io::Result<Option<Vec<u8>>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let len = file.metadata().await?.len();

        if len < self.position {
            return Ok(None);
        }
        if len == self.position {
            return Ok(Some(Vec::new()));
        }

        file.seek(SeekFrom::Start(self.position)).await?;
        let mut buf = Vec::with_capacity((len - self.position) as usize);
        file.read_to_end(&mut buf).await?;
        Ok(Some(buf))
    }
}
