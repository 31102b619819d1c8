// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable, crash-recoverable FIFO of encoded documents.
//!
//! Entries are appended to the active segment before `enqueue` returns, so a
//! process crash loses nothing that was accepted. Delivery state is kept in a
//! journal next to the segments:
//!
//! - **ack**: the entry was delivered or dropped and must not be replayed
//! - **retried**: the entry failed delivery, with its new retry count
//!
//! Only an index of the entries is held in memory; documents are read back
//! from their segment when a batch is leased.

mod lock;
mod segment;
pub mod statfs;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::config::SenderConfig;
use crate::constants::{DEFAULT_SEGMENT_MAX_BYTES, FS_THRESHOLD_DISABLED};
use crate::document::LogDocument;
use crate::error::QueueError;
use crate::status::Status;
use lock::DirLock;
use segment::{
    encode_line, list_segments, read_at, read_records, Journal, JournalRecord, PersistedEntry,
    SegmentWriter,
};
pub use statfs::{DiskUsageProbe, StatfsProbe};

/// A document waiting for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Strictly increasing sequence number
    pub id: u64,
    /// Unix timestamp in milliseconds
    pub enqueued_at: i64,
    /// Failed delivery attempts so far
    pub retries: u32,
    pub document: LogDocument,
    /// Encoded size of the document in bytes
    pub size: usize,
}

/// Snapshot of the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferState {
    pub pending_entries: usize,
    /// Entries leased by a batch and not yet acknowledged or requeued
    pub in_flight_entries: usize,
    /// Encoded bytes of pending and in-flight entries
    pub live_bytes: usize,
    /// Size of the segment files
    pub disk_bytes: u64,
    pub segment_count: usize,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub segment_max_bytes: u64,
    pub sync_writes: bool,
    /// Disk usage percent at which enqueues are rejected, -1 disables the check
    pub fs_full_percent_threshold: i32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            sync_writes: false,
            fs_full_percent_threshold: FS_THRESHOLD_DISABLED,
        }
    }
}

impl From<&SenderConfig> for QueueOptions {
    fn from(config: &SenderConfig) -> Self {
        Self {
            segment_max_bytes: config.segment_max_bytes,
            sync_writes: config.sync_writes,
            fs_full_percent_threshold: config.file_system_full_percent_threshold,
        }
    }
}

/// In-memory index of one entry.
#[derive(Debug, Clone, Copy)]
struct Slot {
    id: u64,
    enqueued_at: i64,
    retries: u32,
    size: usize,
    segment: u64,
    offset: u64,
    len: u64,
}

#[derive(Debug, Default)]
struct SegmentInfo {
    path: PathBuf,
    bytes: u64,
    /// Entries not yet acknowledged
    live: usize,
    /// Acknowledged ids, rewritten into the journal on compaction
    acked: Vec<u64>,
}

#[derive(Debug)]
struct Inner {
    pending: VecDeque<Slot>,
    in_flight: HashMap<u64, Slot>,
    segments: BTreeMap<u64, SegmentInfo>,
    readers: HashMap<u64, File>,
    writer: Option<SegmentWriter>,
    journal: Option<Journal>,
    /// Released last, after the files are synced
    lock: Option<DirLock>,
    next_id: u64,
    live_bytes: usize,
}

impl Inner {
    fn writer(&mut self) -> Result<&mut SegmentWriter, QueueError> {
        self.writer.as_mut().ok_or(QueueError::Closed)
    }

    fn journal(&mut self) -> Result<&mut Journal, QueueError> {
        self.journal.as_mut().ok_or(QueueError::Closed)
    }

    fn reader(&mut self, segment: u64) -> io::Result<&mut File> {
        if !self.readers.contains_key(&segment) {
            let path = self
                .segments
                .get(&segment)
                .map(|info| info.path.clone())
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "segment was removed"))?;
            self.readers.insert(segment, File::open(path)?);
        }
        self.readers
            .get_mut(&segment)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "segment was removed"))
    }

    fn load(&mut self, slot: &Slot) -> Result<QueueEntry, QueueError> {
        let bytes = read_at(self.reader(slot.segment)?, slot.offset, slot.len)?;
        let persisted: PersistedEntry = serde_json::from_slice(&bytes)?;
        Ok(QueueEntry {
            id: slot.id,
            enqueued_at: slot.enqueued_at,
            retries: slot.retries,
            document: persisted.document,
            size: slot.size,
        })
    }

    /// Marks slots as gone for good and journals it.
    fn remove(&mut self, slots: &[Slot], sync: bool) -> Result<(), QueueError> {
        let records: Vec<JournalRecord> = slots.iter().map(|s| JournalRecord::Ack(s.id)).collect();
        self.journal()?.append(&records, sync)?;
        for slot in slots {
            if let Some(info) = self.segments.get_mut(&slot.segment) {
                info.live = info.live.saturating_sub(1);
                info.acked.push(slot.id);
            }
            self.live_bytes = self.live_bytes.saturating_sub(slot.size);
        }
        Ok(())
    }

    fn take_leased(&mut self, ids: &[u64]) -> Vec<Slot> {
        ids.iter().filter_map(|id| self.in_flight.remove(id)).collect()
    }

    fn rotate(&mut self) -> Result<(), QueueError> {
        let Some(writer) = self.writer.as_ref() else {
            return Err(QueueError::Closed);
        };
        writer.sync()?;
        let dir = writer
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let next = SegmentWriter::open(&dir, self.next_id)?;
        self.segments.entry(next.id()).or_insert_with(|| SegmentInfo {
            path: next.path().to_path_buf(),
            bytes: next.len(),
            ..Default::default()
        });
        self.writer = Some(next);
        Ok(())
    }
}

/// On-disk FIFO shared by the sink (producer) and the drain worker (consumer).
pub struct DurableQueue {
    dir: PathBuf,
    options: QueueOptions,
    probe: Arc<dyn DiskUsageProbe>,
    status: Status,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("dir", &self.dir)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl DurableQueue {
    /// Opens the queue in `dir`, recovering whatever a previous run left.
    ///
    /// The directory is locked until [`DurableQueue::close`] or drop; opening
    /// a directory owned by another queue fails with [`QueueError::Locked`].
    /// Damaged records are reported as warnings and skipped, only I/O
    /// failures on the directory itself are fatal.
    pub fn open(
        dir: impl Into<PathBuf>,
        options: QueueOptions,
        probe: Arc<dyn DiskUsageProbe>,
        status: Status,
    ) -> Result<Self, QueueError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let lock = DirLock::acquire(&dir)?;

        let mut slots: Vec<Slot> = Vec::new();
        let mut segments = BTreeMap::new();
        let mut next_id = 1;

        for (segment_id, path) in list_segments(&dir)? {
            let scan = read_records::<PersistedEntry>(&path)?;
            for problem in &scan.problems {
                status.warning_with_cause("Recovered a damaged buffer file", problem);
            }
            let bytes = fs::metadata(&path)?.len();
            for record in scan.records {
                let entry = record.value;
                next_id = next_id.max(entry.id + 1);
                slots.push(Slot {
                    id: entry.id,
                    enqueued_at: entry.enqueued_at,
                    retries: 0,
                    size: entry.document.encoded_len(),
                    segment: segment_id,
                    offset: record.offset,
                    len: record.len,
                });
            }
            next_id = next_id.max(segment_id);
            segments.insert(
                segment_id,
                SegmentInfo {
                    path,
                    bytes,
                    ..Default::default()
                },
            );
        }

        let journal_scan = Journal::read(&dir)?;
        for problem in &journal_scan.problems {
            status.warning_with_cause("Recovered a damaged buffer journal", problem);
        }
        let mut acked = std::collections::HashSet::new();
        let mut retries: HashMap<u64, u32> = HashMap::new();
        for record in journal_scan.records {
            match record.value {
                JournalRecord::Ack(id) => {
                    acked.insert(id);
                }
                JournalRecord::Retried { id, retries: count } => {
                    let current = retries.entry(id).or_default();
                    *current = (*current).max(count);
                }
            }
        }

        let mut pending = VecDeque::with_capacity(slots.len());
        let mut live_bytes = 0;
        for mut slot in slots {
            let Some(info) = segments.get_mut(&slot.segment) else {
                continue;
            };
            if acked.contains(&slot.id) {
                info.acked.push(slot.id);
                continue;
            }
            slot.retries = retries.get(&slot.id).copied().unwrap_or(0);
            info.live += 1;
            live_bytes += slot.size;
            pending.push_back(slot);
        }

        let writer = SegmentWriter::open(&dir, next_id)?;
        segments.entry(writer.id()).or_insert_with(|| SegmentInfo {
            path: writer.path().to_path_buf(),
            bytes: writer.len(),
            ..Default::default()
        });

        let mut journal = Journal::open(&dir)?;
        journal.rewrite(compacted_journal(&segments, &pending, None))?;

        if !pending.is_empty() {
            debug!(
                "LOGS | Recovered {} buffered entries from {}",
                pending.len(),
                dir.display()
            );
        }

        Ok(Self {
            dir,
            options,
            probe,
            status,
            inner: Mutex::new(Inner {
                pending,
                in_flight: HashMap::new(),
                segments,
                readers: HashMap::new(),
                writer: Some(writer),
                journal: Some(journal),
                lock: Some(lock),
                next_id,
                live_bytes,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a document, rejecting it when the disk is too full.
    ///
    /// The entry is on disk when this returns `Ok`.
    pub fn enqueue(&self, document: LogDocument) -> Result<(), QueueError> {
        let threshold = self.options.fs_full_percent_threshold;
        if threshold != FS_THRESHOLD_DISABLED {
            match self.probe.usage_fraction(&self.dir) {
                Ok(fraction) => {
                    let usage_percent = fraction * 100.0;
                    if usage_percent >= f64::from(threshold) {
                        return Err(QueueError::Full {
                            usage_percent,
                            threshold,
                        });
                    }
                }
                Err(e) => self.status.warning_with_cause(
                    "Failed to check disk usage of the buffer, accepting the log",
                    &e,
                ),
            }
        }

        let size = document.encoded_len();
        let mut inner = self.lock();
        let id = inner.next_id;
        let enqueued_at = chrono::Utc::now().timestamp_millis();
        let persisted = PersistedEntry {
            id,
            enqueued_at,
            document,
        };
        let line = encode_line(&persisted)?;

        let active_len = inner.writer()?.len();
        if active_len > 0 && active_len + line.len() as u64 > self.options.segment_max_bytes {
            inner.rotate()?;
        }

        let writer = inner.writer()?;
        let segment = writer.id();
        let offset = writer.append(&line, self.options.sync_writes)?;
        let segment_bytes = writer.len();

        inner.next_id += 1;
        inner.live_bytes += size;
        if let Some(info) = inner.segments.get_mut(&segment) {
            info.live += 1;
            info.bytes = segment_bytes;
        }
        inner.pending.push_back(Slot {
            id,
            enqueued_at,
            retries: 0,
            size,
            segment,
            offset,
            len: line.len() as u64 - 1,
        });
        Ok(())
    }

    /// Leases the oldest entries, at most `max_count` and `max_bytes` of
    /// documents, but always at least one entry when the queue is not empty.
    ///
    /// Leased entries stay on disk until acknowledged, discarded or requeued.
    pub fn peek_batch(
        &self,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let mut inner = self.lock();
        if inner.writer.is_none() {
            return Err(QueueError::Closed);
        }

        let mut batch = Vec::new();
        let mut bytes = 0;
        let mut unreadable = Vec::new();
        while batch.len() < max_count {
            let Some(slot) = inner.pending.front().copied() else {
                break;
            };
            if !batch.is_empty() && bytes + slot.size > max_bytes {
                break;
            }
            inner.pending.pop_front();
            match inner.load(&slot) {
                Ok(entry) => {
                    bytes += slot.size;
                    inner.in_flight.insert(slot.id, slot);
                    batch.push(entry);
                }
                Err(e) => {
                    self.status.warning_with_cause(
                        &format!("Buffered entry {} could not be read back, dropping it", slot.id),
                        &e,
                    );
                    unreadable.push(slot);
                }
            }
        }

        if !unreadable.is_empty() {
            inner.remove(&unreadable, self.options.sync_writes)?;
        }
        Ok(batch)
    }

    /// Removes delivered (or terminally rejected) entries.
    ///
    /// On error the entries stay leased.
    pub fn acknowledge(&self, ids: &[u64]) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let slots = inner.take_leased(ids);
        if let Err(e) = inner.remove(&slots, self.options.sync_writes) {
            for slot in slots {
                inner.in_flight.insert(slot.id, slot);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Removes entries dropped by policy, such as exhausted retries.
    pub fn discard(&self, ids: &[u64]) -> Result<(), QueueError> {
        self.acknowledge(ids)
    }

    /// Returns leased entries to the front of the queue with one more retry.
    ///
    /// Requeued entries keep their relative order and are delivered before
    /// anything enqueued after them.
    pub fn requeue(&self, ids: &[u64]) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let mut slots = inner.take_leased(ids);
        if slots.is_empty() {
            return Ok(());
        }
        slots.sort_unstable_by_key(|s| s.id);
        for slot in &mut slots {
            slot.retries = slot.retries.saturating_add(1);
        }

        let records: Vec<JournalRecord> = slots
            .iter()
            .map(|s| JournalRecord::Retried {
                id: s.id,
                retries: s.retries,
            })
            .collect();
        let journaled = inner.journal()?.append(&records, self.options.sync_writes);

        for slot in slots.into_iter().rev() {
            inner.pending.push_front(slot);
        }
        journaled
    }

    /// Discards pending entries enqueued more than `max_age` ago and returns
    /// how many were dropped.
    pub fn drop_expired(&self, max_age: Duration) -> Result<usize, QueueError> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = chrono::Utc::now().timestamp_millis().saturating_sub(max_age_ms);

        let mut inner = self.lock();
        let (expired, kept): (Vec<Slot>, Vec<Slot>) =
            inner.pending.drain(..).partition(|s| s.enqueued_at < cutoff);
        inner.pending = kept.into();
        if !expired.is_empty() {
            inner.remove(&expired, self.options.sync_writes)?;
        }
        Ok(expired.len())
    }

    /// Used fraction of the filesystem holding the buffer.
    pub fn current_disk_usage_fraction(&self) -> Result<f64, QueueError> {
        Ok(self.probe.usage_fraction(&self.dir)?)
    }

    pub fn state(&self) -> BufferState {
        let inner = self.lock();
        BufferState {
            pending_entries: inner.pending.len(),
            in_flight_entries: inner.in_flight.len(),
            live_bytes: inner.live_bytes,
            disk_bytes: inner.segments.values().map(|s| s.bytes).sum(),
            segment_count: inner.segments.len(),
        }
    }

    /// Encoded bytes of everything not yet acknowledged.
    pub fn pending_bytes(&self) -> usize {
        self.lock().live_bytes
    }

    /// Entries waiting to be leased.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.pending.is_empty() && inner.in_flight.is_empty()
    }

    /// Deletes segments whose entries are all acknowledged and compacts the
    /// journal. Returns the number of deleted segments.
    pub fn collect_garbage(&self) -> Result<usize, QueueError> {
        let mut inner = self.lock();
        let active = inner.writer()?.id();
        let active_done = inner
            .segments
            .get(&active)
            .is_some_and(|info| info.live == 0 && info.bytes > 0);
        if active_done {
            inner.rotate()?;
        }
        let active = inner.writer()?.id();

        let done: Vec<u64> = inner
            .segments
            .iter()
            .filter(|(id, info)| **id != active && info.live == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut deleted = 0;
        for id in done {
            inner.readers.remove(&id);
            let Some(info) = inner.segments.remove(&id) else {
                continue;
            };
            match fs::remove_file(&info.path) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => deleted += 1,
                Err(e) => {
                    self.status.warning_with_cause(
                        &format!("Failed to delete buffer segment {}", info.path.display()),
                        &e,
                    );
                    inner.segments.insert(id, info);
                }
            }
        }

        if deleted > 0 || inner.journal()?.records() > 0 {
            let records = compacted_journal(&inner.segments, &inner.pending, Some(&inner.in_flight));
            inner.journal()?.rewrite(records)?;
        }

        if deleted > 0 {
            debug!("LOGS | Deleted {deleted} acknowledged buffer segments");
        }
        Ok(deleted)
    }

    /// Syncs and releases the files. Entries stay on disk for the next open.
    pub fn close(&self) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let writer = inner.writer.take();
        let journal = inner.journal.take();
        inner.readers.clear();
        inner.pending.clear();
        inner.in_flight.clear();
        inner.live_bytes = 0;

        let synced = writer
            .map_or(Ok(()), |w| w.sync())
            .and_then(|()| journal.map_or(Ok(()), |j| j.sync()));
        inner.lock.take();
        synced.map_err(QueueError::from)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().writer.is_none()
    }
}

/// Journal content that reproduces the current state on its own.
fn compacted_journal(
    segments: &BTreeMap<u64, SegmentInfo>,
    pending: &VecDeque<Slot>,
    in_flight: Option<&HashMap<u64, Slot>>,
) -> Vec<JournalRecord> {
    let mut records: Vec<JournalRecord> = segments
        .values()
        .flat_map(|info| info.acked.iter().map(|id| JournalRecord::Ack(*id)))
        .collect();
    let leased = in_flight.into_iter().flat_map(HashMap::values);
    records.extend(
        pending
            .iter()
            .chain(leased)
            .filter(|s| s.retries > 0)
            .map(|s| JournalRecord::Retried {
                id: s.id,
                retries: s.retries,
            }),
    );
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::test_document;
    use crate::status::{MemoryStatusReporter, StatusLevel};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Probe returning a settable usage percentage.
    #[derive(Default)]
    struct FakeProbe {
        percent: AtomicU64,
        failing: bool,
    }

    impl DiskUsageProbe for FakeProbe {
        fn usage_fraction(&self, _path: &Path) -> io::Result<f64> {
            if self.failing {
                return Err(io::Error::new(io::ErrorKind::Other, "statfs failed"));
            }
            #[allow(clippy::cast_precision_loss)]
            Ok(self.percent.load(Ordering::Relaxed) as f64 / 100.0)
        }
    }

    fn open_queue(dir: &Path) -> DurableQueue {
        DurableQueue::open(
            dir,
            QueueOptions::default(),
            Arc::new(FakeProbe::default()),
            Status::default(),
        )
        .unwrap()
    }

    fn messages(entries: &[QueueEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.document.get_str("message").unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_fifo_order_and_acknowledge() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());
        for message in ["a", "b", "c"] {
            queue.enqueue(test_document(message)).unwrap();
        }
        assert_eq!(queue.len(), 3);

        let batch = queue.peek_batch(2, usize::MAX).unwrap();
        assert_eq!(messages(&batch), vec!["a", "b"]);
        assert_eq!(queue.state().in_flight_entries, 2);

        let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
        queue.acknowledge(&ids).unwrap();

        let rest = queue.peek_batch(10, usize::MAX).unwrap();
        assert_eq!(messages(&rest), vec!["c"]);
    }

    #[test]
    fn test_peek_batch_respects_bytes_but_returns_at_least_one() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());
        queue.enqueue(test_document("first")).unwrap();
        queue.enqueue(test_document("second")).unwrap();

        let batch = queue.peek_batch(10, 1).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(messages(&batch), vec!["first"]);
    }

    #[test]
    fn test_requeue_goes_to_front_in_original_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());
        queue.enqueue(test_document("a")).unwrap();
        queue.enqueue(test_document("b")).unwrap();
        let batch = queue.peek_batch(10, usize::MAX).unwrap();
        queue.enqueue(test_document("c")).unwrap();

        let mut ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
        ids.reverse();
        queue.requeue(&ids).unwrap();

        let batch = queue.peek_batch(10, usize::MAX).unwrap();
        assert_eq!(messages(&batch), vec!["a", "b", "c"]);
        assert_eq!(batch[0].retries, 1);
        assert_eq!(batch[1].retries, 1);
        assert_eq!(batch[2].retries, 0);
    }

    #[test]
    fn test_recovery_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = open_queue(dir.path());
            for message in ["a", "b", "c"] {
                queue.enqueue(test_document(message)).unwrap();
            }
            let batch = queue.peek_batch(1, usize::MAX).unwrap();
            queue.acknowledge(&[batch[0].id]).unwrap();
            let batch = queue.peek_batch(1, usize::MAX).unwrap();
            queue.requeue(&[batch[0].id]).unwrap();
            // dropped without close, as on a crash
        }

        let queue = open_queue(dir.path());
        let batch = queue.peek_batch(10, usize::MAX).unwrap();
        assert_eq!(messages(&batch), vec!["b", "c"]);
        assert_eq!(batch[0].retries, 1);
        assert_eq!(batch[1].retries, 0);

        // New entries continue the sequence
        queue.enqueue(test_document("d")).unwrap();
        let next = queue.peek_batch(10, usize::MAX).unwrap();
        assert!(next[0].id > batch[1].id);
    }

    #[test]
    fn test_leased_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = open_queue(dir.path());
            queue.enqueue(test_document("a")).unwrap();
            let batch = queue.peek_batch(10, usize::MAX).unwrap();
            assert_eq!(batch.len(), 1);
            queue.close().unwrap();
        }
        let queue = open_queue(dir.path());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_recovery_truncates_torn_write() {
        let dir = tempfile::tempdir().unwrap();
        let segment_path = {
            let queue = open_queue(dir.path());
            queue.enqueue(test_document("whole")).unwrap();
            queue.close().unwrap();
            list_segments(dir.path()).unwrap()[0].1.clone()
        };

        let mut content = fs::read(&segment_path).unwrap();
        let intact = content.len();
        content.extend_from_slice(br#"{"id":2,"enqueued_at":0,"docu"#);
        fs::write(&segment_path, &content).unwrap();

        let reporter = Arc::new(MemoryStatusReporter::new());
        let queue = DurableQueue::open(
            dir.path(),
            QueueOptions::default(),
            Arc::new(FakeProbe::default()),
            Status::new(reporter.clone()),
        )
        .unwrap();

        assert_eq!(queue.len(), 1);
        assert!(reporter.contains(StatusLevel::Warning, "damaged"));
        assert_eq!(fs::metadata(&segment_path).unwrap().len(), intact as u64);

        queue.enqueue(test_document("after")).unwrap();
        let batch = queue.peek_batch(10, usize::MAX).unwrap();
        assert_eq!(messages(&batch), vec!["whole", "after"]);
    }

    #[test]
    fn test_backpressure_rejects_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FakeProbe::default());
        probe.percent.store(99, Ordering::Relaxed);
        let queue = DurableQueue::open(
            dir.path(),
            QueueOptions {
                fs_full_percent_threshold: 98,
                ..Default::default()
            },
            probe.clone(),
            Status::default(),
        )
        .unwrap();

        let result = queue.enqueue(test_document("dropped"));
        assert!(matches!(result, Err(QueueError::Full { threshold: 98, .. })));
        assert!(queue.is_empty());

        probe.percent.store(50, Ordering::Relaxed);
        queue.enqueue(test_document("accepted")).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_disabled_threshold_skips_check() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FakeProbe::default());
        probe.percent.store(100, Ordering::Relaxed);
        let queue = DurableQueue::open(
            dir.path(),
            QueueOptions {
                fs_full_percent_threshold: -1,
                ..Default::default()
            },
            probe,
            Status::default(),
        )
        .unwrap();

        queue.enqueue(test_document("accepted")).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_failing_probe_warns_and_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Arc::new(MemoryStatusReporter::new());
        let queue = DurableQueue::open(
            dir.path(),
            QueueOptions {
                fs_full_percent_threshold: 98,
                ..Default::default()
            },
            Arc::new(FakeProbe {
                failing: true,
                ..Default::default()
            }),
            Status::new(reporter.clone()),
        )
        .unwrap();

        queue.enqueue(test_document("accepted")).unwrap();
        assert_eq!(queue.len(), 1);
        assert!(reporter.contains(StatusLevel::Warning, "disk usage"));
    }

    #[test]
    fn test_segments_rotate_and_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::open(
            dir.path(),
            QueueOptions {
                segment_max_bytes: 256,
                ..Default::default()
            },
            Arc::new(FakeProbe::default()),
            Status::default(),
        )
        .unwrap();

        for i in 0..10 {
            queue.enqueue(test_document(&format!("message {i}"))).unwrap();
        }
        assert!(queue.state().segment_count > 1);

        let batch = queue.peek_batch(100, usize::MAX).unwrap();
        assert_eq!(batch.len(), 10);
        let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
        queue.acknowledge(&ids).unwrap();

        let deleted = queue.collect_garbage().unwrap();
        assert!(deleted > 0);
        let state = queue.state();
        assert_eq!(state.segment_count, 1);
        assert_eq!(state.disk_bytes, 0);
        assert_eq!(list_segments(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_collection_keeps_unacknowledged_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = DurableQueue::open(
                dir.path(),
                QueueOptions {
                    segment_max_bytes: 256,
                    ..Default::default()
                },
                Arc::new(FakeProbe::default()),
                Status::default(),
            )
            .unwrap();
            for i in 0..6 {
                queue.enqueue(test_document(&format!("message {i}"))).unwrap();
            }
            let batch = queue.peek_batch(3, usize::MAX).unwrap();
            let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
            queue.acknowledge(&ids).unwrap();
            queue.collect_garbage().unwrap();
            queue.close().unwrap();
        }

        let queue = open_queue(dir.path());
        let batch = queue.peek_batch(100, usize::MAX).unwrap();
        assert_eq!(
            messages(&batch),
            vec!["message 3", "message 4", "message 5"]
        );
    }

    #[test]
    fn test_drop_expired() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());
        queue.enqueue(test_document("old")).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(queue.drop_expired(Duration::from_millis(5)).unwrap(), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.drop_expired(Duration::from_secs(60)).unwrap(), 0);
    }

    #[test]
    fn test_closed_queue_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());
        queue.close().unwrap();
        queue.close().unwrap();
        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(test_document("late")),
            Err(QueueError::Closed)
        ));
        assert!(matches!(queue.peek_batch(1, 1), Err(QueueError::Closed)));
    }

    #[test]
    fn test_directory_is_owned_by_one_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());
        queue.enqueue(test_document("a")).unwrap();

        let second = DurableQueue::open(
            dir.path(),
            QueueOptions::default(),
            Arc::new(FakeProbe::default()),
            Status::default(),
        );
        assert!(matches!(second, Err(QueueError::Locked(_))));

        queue.close().unwrap();
        let reopened = open_queue(dir.path());
        assert_eq!(reopened.len(), 1);
        drop(reopened);

        assert_eq!(open_queue(dir.path()).len(), 1);
    }

    #[test]
    fn test_failed_acknowledge_keeps_entries_leased() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());
        queue.enqueue(test_document("a")).unwrap();
        let batch = queue.peek_batch(10, usize::MAX).unwrap();
        let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();

        let journal = queue.lock().journal.take();
        assert!(queue.acknowledge(&ids).is_err());
        assert_eq!(queue.state().in_flight_entries, 1);

        queue.lock().journal = journal;
        queue.requeue(&ids).unwrap();
        let retried = queue.peek_batch(10, usize::MAX).unwrap();
        assert_eq!(messages(&retried), vec!["a"]);
        assert_eq!(retried[0].retries, 1);
    }
}
