// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk files of the queue.
//!
//! A queue directory holds JSON-lines segments named
//! `segment-<first id, 20 digits>.log` and a single `journal.log` recording
//! acknowledgements and retry counts.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::document::LogDocument;
use crate::error::QueueError;

pub(crate) const JOURNAL_FILE_NAME: &str = "journal.log";
const JOURNAL_TMP_FILE_NAME: &str = "journal.log.tmp";
const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";

/// Entry as written to a segment. Retry counts live in the journal.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedEntry {
    pub id: u64,
    pub enqueued_at: i64,
    pub document: LogDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum JournalRecord {
    Ack(u64),
    Retried { id: u64, retries: u32 },
}

pub(crate) fn segment_file_name(id: u64) -> String {
    format!("{SEGMENT_PREFIX}{id:020}{SEGMENT_SUFFIX}")
}

pub(crate) fn parse_segment_id(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Segments of `dir` sorted by id.
pub(crate) fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_segment_id) {
            segments.push((id, entry.path()));
        }
    }
    segments.sort_unstable_by_key(|(id, _)| *id);
    Ok(segments)
}

pub(crate) fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

pub(crate) struct Record<T> {
    pub offset: u64,
    /// Length without the trailing newline.
    pub len: u64,
    pub value: T,
}

/// Records recovered from a file plus everything that had to be skipped.
pub(crate) struct Scan<T> {
    pub records: Vec<Record<T>>,
    pub problems: Vec<QueueError>,
}

impl<T> Default for Scan<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            problems: Vec::new(),
        }
    }
}

/// Reads every record of a JSON-lines file.
///
/// A terminated record that does not parse is skipped. An unterminated
/// trailing record is the remainder of an interrupted write and is truncated
/// away so later appends start on a clean line.
pub(crate) fn read_records<T: DeserializeOwned>(path: &Path) -> io::Result<Scan<T>> {
    let bytes = fs::read(path)?;
    let mut scan = Scan::default();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let Some(rel) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            scan.problems.push(QueueError::Corruption {
                file: path.to_path_buf(),
                offset: offset as u64,
                reason: "unterminated record, truncated".to_string(),
            });
            OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(offset as u64)?;
            break;
        };

        let line = &bytes[offset..offset + rel];
        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<T>(line) {
                Ok(value) => scan.records.push(Record {
                    offset: offset as u64,
                    len: rel as u64,
                    value,
                }),
                Err(e) => scan.problems.push(QueueError::Corruption {
                    file: path.to_path_buf(),
                    offset: offset as u64,
                    reason: format!("unparsable record skipped: {e}"),
                }),
            }
        }
        offset += rel + 1;
    }

    Ok(scan)
}

/// Reads `len` bytes at `offset`.
pub(crate) fn read_at(file: &mut File, offset: u64, len: u64) -> io::Result<Vec<u8>> {
    let len = usize::try_from(len).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut buf = vec![0; len];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Append handle of the active segment.
#[derive(Debug)]
pub(crate) struct SegmentWriter {
    id: u64,
    path: PathBuf,
    file: File,
    len: u64,
}

impl SegmentWriter {
    pub fn open(dir: &Path, id: u64) -> io::Result<Self> {
        let path = dir.join(segment_file_name(id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self { id, path, file, len })
    }

    /// Appends one encoded line and returns its offset.
    pub fn append(&mut self, line: &[u8], sync: bool) -> io::Result<u64> {
        let offset = self.len;
        let written = self.file.write_all(line).and_then(|()| {
            if sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        match written {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(offset)
            }
            Err(e) => {
                self.truncate_to(offset);
                Err(e)
            }
        }
    }

    /// Cuts a partially written record so the next append starts on a record
    /// boundary.
    fn truncate_to(&mut self, offset: u64) {
        self.len = match self.file.set_len(offset) {
            Ok(()) => offset,
            Err(e) => {
                warn!(
                    "LOGS | Failed to truncate {} after a failed write: {e}",
                    self.path.display()
                );
                self.file.metadata().map_or(self.len, |m| m.len())
            }
        };
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append-only log of acknowledgements and retry counts.
#[derive(Debug)]
pub(crate) struct Journal {
    dir: PathBuf,
    file: File,
    len: u64,
    records: u64,
}

impl Journal {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(JOURNAL_FILE_NAME)
    }

    pub fn read(dir: &Path) -> io::Result<Scan<JournalRecord>> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(Scan::default());
        }
        read_records(&path)
    }

    pub fn open(dir: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::path(dir))?;
        let len = file.metadata()?.len();
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            len,
            records: 0,
        })
    }

    pub fn append(&mut self, records: &[JournalRecord], sync: bool) -> Result<(), QueueError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(records.len() * 32);
        for record in records {
            buf.extend_from_slice(&encode_line(record)?);
        }
        let written = self.file.write_all(&buf).and_then(|()| {
            if sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            // A torn record would swallow the next one on recovery
            if let Err(truncate) = self.file.set_len(self.len) {
                warn!("LOGS | Failed to truncate the buffer journal after a failed write: {truncate}");
            }
            return Err(e.into());
        }
        self.len += buf.len() as u64;
        self.records += records.len() as u64;
        Ok(())
    }

    /// Replaces the journal with `records`, atomically.
    pub fn rewrite(
        &mut self,
        records: impl IntoIterator<Item = JournalRecord>,
    ) -> Result<(), QueueError> {
        let tmp = self.dir.join(JOURNAL_TMP_FILE_NAME);
        let mut buf = Vec::new();
        let mut count = 0;
        for record in records {
            buf.extend_from_slice(&encode_line(&record)?);
            count += 1;
        }

        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, Self::path(&self.dir))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::path(&self.dir))?;
        self.len = buf.len() as u64;
        self.records = count;
        Ok(())
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Records appended since the last open or rewrite.
    pub fn records(&self) -> u64 {
        self.records
    }
}
