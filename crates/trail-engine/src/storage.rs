//! Durable, append-only trace storage partitioned by UTC calendar day.
//!
//! Every write opens the partition in append mode, writes one complete line
//! and closes the file again. No handle is held between calls, so several
//! processes can append to the same day's file and rely on the OS to keep
//! whole lines intact.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use trail_types::live::LiveStats;
use trail_types::trace::TraceEvent;

use crate::config::Layout;
use crate::error::StorageError;

/// Append `value` as one JSON line to `path`, creating parent directories.
pub(crate) fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    // One write call per record keeps concurrent appenders from interleaving.
    file.write_all(&line).map_err(|source| StorageError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Read every decodable JSON line of `path`. A missing file reads as empty;
/// undecodable lines are skipped.
pub(crate) fn read_json_lines<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Vec<T>, StorageError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StorageError::Open {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for chunk in BufReader::new(file).split(b'\n') {
        let chunk = chunk.map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let text = String::from_utf8_lossy(&chunk);
        if text.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&text) {
            Ok(record) => records.push(record),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "Skipped undecodable lines");
    }
    Ok(records)
}

/// Outcome of writing a batch of events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub written: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct TraceWriter {
    layout: Layout,
}

impl TraceWriter {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn dir(&self) -> &Path {
        self.layout.traces_dir()
    }

    /// Partition file an event belongs to, chosen by its UTC timestamp.
    pub fn partition_for(&self, event: &TraceEvent) -> PathBuf {
        self.layout.partition_path(event.timestamp.date_naive())
    }

    /// Append one event to its day's partition.
    pub fn write(&self, event: &TraceEvent) -> Result<PathBuf, StorageError> {
        let path = self.partition_for(event);
        append_json_line(&path, event)?;
        Ok(path)
    }

    /// Write events in order. A failed write is logged and skipped so the
    /// remaining events are still captured.
    pub fn write_all(&self, events: &[TraceEvent]) -> WriteReport {
        let mut report = WriteReport::default();
        for event in events {
            match self.write(event) {
                Ok(_) => report.written += 1,
                Err(e) => {
                    warn!(
                        session_id = %event.session_id,
                        span_id = %event.span_id,
                        error = %e,
                        "Failed to write trace event"
                    );
                    report.failed += 1;
                }
            }
        }
        debug!(written = report.written, failed = report.failed, "Trace batch written");
        report
    }

    /// All partition dates present on disk, oldest first.
    pub fn partitions(&self) -> Result<Vec<NaiveDate>, StorageError> {
        let dir = self.dir();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::Read {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut dates: Vec<NaiveDate> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let date = name.strip_prefix("traces-")?.strip_suffix(".jsonl")?;
                NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
            })
            .collect();
        dates.sort();
        Ok(dates)
    }

    pub fn read_partition(&self, date: NaiveDate) -> Result<Vec<TraceEvent>, StorageError> {
        read_json_lines(&self.layout.partition_path(date))
    }

    /// Every stored event of one session across all partitions, in storage order.
    pub fn read_session(&self, session_id: &str) -> Result<Vec<TraceEvent>, StorageError> {
        let mut events = Vec::new();
        for date in self.partitions()? {
            events.extend(
                self.read_partition(date)?
                    .into_iter()
                    .filter(|e| e.session_id == session_id),
            );
        }
        Ok(events)
    }
}

/// Replace the live stats snapshot at `path` atomically: the JSON goes to a
/// sibling temp file which is then renamed over the target, so readers never
/// observe a half-written snapshot.
pub async fn write_live_stats(path: &Path, stats: &LiveStats) -> Result<(), StorageError> {
    let json = serde_json::to_vec_pretty(stats)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let tmp = temp_sibling(path);
    tokio::fs::write(&tmp, &json)
        .await
        .map_err(|source| StorageError::Write {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| StorageError::Rename {
            path: path.to_path_buf(),
            source,
        })
}

/// Current live snapshot, or `None` when no watcher has written one.
pub fn read_live_stats(path: &Path) -> Result<Option<LiveStats>, StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StorageError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Delete a live snapshot. Already gone is fine.
pub fn remove_live_stats(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StorageError::Write {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
