// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drain scheduling.
//!
//! Two background roles:
//!
//! - **Periodic timer**: triggers a drain every `drain_interval` and collects
//!   queue garbage every `gc_persisted_queue_files_interval`. Stopped by
//!   cancelling its token.
//! - **Drain worker**: waits for triggers and runs one drain cycle at a time.
//!
//! Interval and size triggers that arrive while a cycle is running are
//! ignored; the next cycle picks up whatever was enqueued meanwhile. An
//! explicit flush always gets a cycle that starts after it was requested.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SenderConfig;
use crate::constants::MAX_BATCH_ENTRIES;
use crate::flusher::{BulkSender, DeliveryResult, ExponentialBackoff};
use crate::queue::{DurableQueue, QueueEntry};
use crate::status::Status;

/// Why a drain cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    Interval,
    /// Live queue bytes crossed the batch size threshold
    Size,
    Explicit,
}

#[derive(Debug, Clone)]
pub struct DrainOptions {
    pub drain_interval: Duration,
    pub gc_interval: Duration,
    pub batch_size_threshold_bytes: usize,
    pub max_entry_retries: Option<u32>,
    pub max_entry_age: Option<Duration>,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub debug: bool,
}

impl From<&SenderConfig> for DrainOptions {
    fn from(config: &SenderConfig) -> Self {
        Self {
            drain_interval: config.drain_interval,
            gc_interval: config.gc_persisted_queue_files_interval,
            batch_size_threshold_bytes: config.batch_size_threshold_bytes,
            max_entry_retries: config.max_entry_retries,
            max_entry_age: config.max_entry_age,
            retry_initial_backoff: config.retry_initial_backoff,
            retry_max_backoff: config.retry_max_backoff,
            debug: config.debug,
        }
    }
}

#[derive(Debug)]
struct RetryState {
    backoff: ExponentialBackoff,
    retry_at: Option<Instant>,
}

struct Shared {
    queue: Arc<DurableQueue>,
    sender: BulkSender,
    options: DrainOptions,
    status: Status,
    notify: Notify,
    in_flight: AtomicBool,
    stopped: AtomicBool,
    /// Generation of the latest explicit flush request
    requested: AtomicU64,
    /// Latest explicit generation served by a completed cycle
    served: watch::Sender<u64>,
    completed_cycles: AtomicU64,
    retry: Mutex<RetryState>,
}

impl Shared {
    fn trigger(&self, trigger: DrainTrigger) {
        if self.in_flight.load(Ordering::SeqCst) {
            debug!("LOGS | Drain cycle in flight, ignoring {trigger:?} trigger");
            return;
        }
        self.notify.notify_one();
    }

    fn retry_state(&self) -> std::sync::MutexGuard<'_, RetryState> {
        self.retry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Segment deletion and journal compaction run on the blocking pool.
    async fn collect_garbage(&self) {
        let queue = Arc::clone(&self.queue);
        match tokio::task::spawn_blocking(move || queue.collect_garbage()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => self
                .status
                .warning_with_cause("Failed to clean up delivered buffer files", &e),
            Err(e) => self
                .status
                .warning_with_cause("Buffer cleanup task failed", &e),
        }
    }

    async fn run_worker(self: Arc<Self>) {
        debug!("LOGS | Drain worker started");
        loop {
            self.notify.notified().await;
            let target = self.requested.load(Ordering::SeqCst);
            let explicit = target > *self.served.borrow();

            self.in_flight.store(true, Ordering::SeqCst);
            self.drain_cycle(explicit).await;
            self.in_flight.store(false, Ordering::SeqCst);

            self.completed_cycles.fetch_add(1, Ordering::SeqCst);
            self.served.send_replace(target);
        }
    }

    async fn run_timer(self: Arc<Self>, cancel: CancellationToken) {
        let start = Instant::now();
        let mut drain = tokio::time::interval_at(
            start + self.options.drain_interval,
            self.options.drain_interval,
        );
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gc =
            tokio::time::interval_at(start + self.options.gc_interval, self.options.gc_interval);
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("LOGS | Drain timer cancelled");
                    break;
                }
                _ = drain.tick() => self.trigger(DrainTrigger::Interval),
                _ = gc.tick() => self.collect_garbage().await,
            }
        }
    }

    /// Drains batches until the queue is empty or a delivery fails.
    async fn drain_cycle(&self, explicit: bool) {
        if !explicit {
            let retry_at = self.retry_state().retry_at;
            if retry_at.is_some_and(|at| Instant::now() < at) {
                debug!("LOGS | Backing off, skipping drain cycle");
                return;
            }
        }

        if let Some(max_age) = self.options.max_entry_age {
            match self.queue.drop_expired(max_age) {
                Ok(0) => {}
                Ok(dropped) => self.status.error(&format!(
                    "Dropped {dropped} logs that stayed in the buffer longer than {max_age:?}"
                )),
                Err(e) => self
                    .status
                    .error_with_cause("Failed to drop expired logs from the buffer", &e),
            }
        }

        loop {
            let batch = match self
                .queue
                .peek_batch(MAX_BATCH_ENTRIES, self.options.batch_size_threshold_bytes)
            {
                Ok(batch) => batch,
                Err(e) => {
                    self.status
                        .error_with_cause("Failed to read logs from the buffer", &e);
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }

            if !self.deliver(batch).await {
                return;
            }
        }
    }

    /// Returns a lease that could not be settled to the pending entries.
    fn release(&self, ids: &[u64]) {
        if let Err(e) = self.queue.requeue(ids) {
            self.status
                .error_with_cause("Failed to return unsettled logs to the buffer", &e);
        }
    }

    /// Sends one batch and settles it in the queue. Returns false when the
    /// cycle should stop.
    async fn deliver(&self, batch: Vec<QueueEntry>) -> bool {
        let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();

        match self.sender.send_batch(&batch).await {
            DeliveryResult::Delivered { count } => {
                if let Err(e) = self.queue.acknowledge(&ids) {
                    self.status.error_with_cause(
                        "Failed to acknowledge delivered logs, they may be sent again",
                        &e,
                    );
                    self.release(&ids);
                    return false;
                }
                let mut retry = self.retry_state();
                retry.backoff.reset();
                retry.retry_at = None;
                drop(retry);
                if self.options.debug {
                    self.status
                        .info(&format!("Successfully sent bulk to logz.io, size: {count}"));
                }
                true
            }
            DeliveryResult::Rejected { status, body } => {
                self.status.error(&format!(
                    "Logz.io rejected a bulk of {} logs with status {status}, dropping it: {body}",
                    ids.len()
                ));
                if let Err(e) = self.queue.acknowledge(&ids) {
                    self.status
                        .error_with_cause("Failed to drop rejected logs", &e);
                    self.release(&ids);
                    return false;
                }
                true
            }
            DeliveryResult::Failed(error) => {
                let (exhausted, retriable): (Vec<&QueueEntry>, Vec<&QueueEntry>) =
                    batch.iter().partition(|e| {
                        self.options
                            .max_entry_retries
                            .is_some_and(|max| e.retries.saturating_add(1) > max)
                    });

                if !exhausted.is_empty() {
                    let exhausted: Vec<u64> = exhausted.iter().map(|e| e.id).collect();
                    self.status.error(&format!(
                        "Dropping {} logs that failed delivery too many times",
                        exhausted.len()
                    ));
                    if let Err(e) = self.queue.discard(&exhausted) {
                        self.status
                            .error_with_cause("Failed to discard exhausted logs", &e);
                    }
                }

                let retriable: Vec<u64> = retriable.iter().map(|e| e.id).collect();
                if let Err(e) = self.queue.requeue(&retriable) {
                    self.status
                        .error_with_cause("Failed to requeue undelivered logs", &e);
                }

                let delay = {
                    let mut retry = self.retry_state();
                    let delay = retry.backoff.record_failure();
                    retry.retry_at = Some(Instant::now() + delay);
                    delay
                };
                self.status.warning_with_cause(
                    &format!(
                        "Failed to send a bulk of {} logs, will retry in {delay:?}",
                        ids.len()
                    ),
                    &error,
                );
                false
            }
        }
    }
}

/// Handle owning the timer and worker tasks.
pub struct DrainScheduler {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DrainScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainScheduler")
            .field("options", &self.shared.options)
            .field("in_flight", &self.is_cycle_in_flight())
            .finish_non_exhaustive()
    }
}

impl DrainScheduler {
    /// Spawns the timer and the worker on the current tokio runtime.
    #[must_use]
    pub fn start(
        queue: Arc<DurableQueue>,
        sender: BulkSender,
        options: DrainOptions,
        status: Status,
    ) -> Self {
        let (served, _) = watch::channel(0);
        let backoff = ExponentialBackoff::new(options.retry_initial_backoff, options.retry_max_backoff);
        let shared = Arc::new(Shared {
            queue,
            sender,
            options,
            status,
            notify: Notify::new(),
            in_flight: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            requested: AtomicU64::new(0),
            served,
            completed_cycles: AtomicU64::new(0),
            retry: Mutex::new(RetryState {
                backoff,
                retry_at: None,
            }),
        });

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&shared).run_worker());
        let timer = tokio::spawn(Arc::clone(&shared).run_timer(cancel.clone()));

        Self {
            shared,
            cancel,
            timer: Mutex::new(Some(timer)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Requests a drain cycle unless one is already running.
    pub fn trigger(&self, trigger: DrainTrigger) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.shared.trigger(trigger);
    }

    /// Size trigger, checked after every enqueue.
    pub fn notify_enqueued(&self) {
        if self.shared.queue.pending_bytes() >= self.shared.options.batch_size_threshold_bytes {
            self.trigger(DrainTrigger::Size);
        }
    }

    /// Waits for a drain cycle that starts after this call, or for `timeout`.
    ///
    /// Returns false on timeout; undelivered entries stay queued.
    pub async fn flush(&self, timeout: Duration) -> bool {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let mut served = self.shared.served.subscribe();
        let target = self.shared.requested.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.notify.notify_one();

        // Map before matching so no watch::Ref outlives `served`
        let waited = tokio::time::timeout(timeout, served.wait_for(|s| *s >= target))
            .await
            .map(|result| result.is_ok());
        match waited {
            Ok(done) => done,
            Err(_) => {
                debug!("LOGS | Flush did not complete within {timeout:?}");
                false
            }
        }
    }

    /// Stops the periodic timer. No interval or GC cycles start afterwards.
    pub fn stop_timer(&self) {
        self.cancel.cancel();
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }

    /// Terminates the worker, interrupting any delivery in flight.
    pub fn abort_worker(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.abort();
        }
    }

    /// Timer first, then a final flush bounded by `timeout`, then the worker.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop_timer();
        let flushed = self.flush(timeout).await;
        self.abort_worker();
        flushed
    }

    pub fn is_cycle_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_timer_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn completed_cycles(&self) -> u64 {
        self.shared.completed_cycles.load(Ordering::SeqCst)
    }

    /// Consecutive failed cycles since the last successful delivery.
    pub fn consecutive_failures(&self) -> u32 {
        self.shared.retry_state().backoff.failures()
    }
}

impl Drop for DrainScheduler {
    fn drop(&mut self) {
        self.stop_timer();
        self.abort_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::test_document;
    use crate::queue::{DiskUsageProbe, QueueOptions};
    use mockito::Matcher;
    use std::io;
    use std::path::Path;

    struct EmptyDisk;

    impl DiskUsageProbe for EmptyDisk {
        fn usage_fraction(&self, _path: &Path) -> io::Result<f64> {
            Ok(0.0)
        }
    }

    fn options() -> DrainOptions {
        DrainOptions {
            drain_interval: Duration::from_secs(3_600),
            gc_interval: Duration::from_secs(3_600),
            batch_size_threshold_bytes: 1_024 * 1_024,
            max_entry_retries: None,
            max_entry_age: None,
            retry_initial_backoff: Duration::from_secs(60),
            retry_max_backoff: Duration::from_secs(60),
            debug: true,
        }
    }

    fn queue(dir: &Path) -> Arc<DurableQueue> {
        Arc::new(
            DurableQueue::open(
                dir,
                QueueOptions::default(),
                Arc::new(EmptyDisk),
                Status::default(),
            )
            .unwrap(),
        )
    }

    fn sender(url: String) -> BulkSender {
        let config = SenderConfig {
            socket_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
            ..SenderConfig::new(url, "token")
        };
        BulkSender::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_explicit_flush_delivers_everything() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path());
        queue.enqueue(test_document("a")).unwrap();
        queue.enqueue(test_document("b")).unwrap();

        let scheduler = DrainScheduler::start(
            queue.clone(),
            sender(server.url()),
            options(),
            Status::default(),
        );
        assert!(scheduler.flush(Duration::from_secs(5)).await);
        assert!(queue.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_timer_collects_delivered_segments() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(
            DurableQueue::open(
                dir.path(),
                QueueOptions {
                    segment_max_bytes: 256,
                    ..Default::default()
                },
                Arc::new(EmptyDisk),
                Status::default(),
            )
            .unwrap(),
        );
        for i in 0..10 {
            queue.enqueue(test_document(&format!("message {i}"))).unwrap();
        }
        assert!(queue.state().segment_count > 1);

        let scheduler = DrainScheduler::start(
            queue.clone(),
            sender(server.url()),
            DrainOptions {
                gc_interval: Duration::from_millis(50),
                ..options()
            },
            Status::default(),
        );
        assert!(scheduler.flush(Duration::from_secs(5)).await);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.state().segment_count > 1 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(queue.state().segment_count, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_cycle_requeues_and_explicit_flush_bypasses_backoff() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(500)
            .expect(1)
            .create_async()
            .await;
        let succeeding = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path());
        queue.enqueue(test_document("a")).unwrap();

        let scheduler = DrainScheduler::start(
            queue.clone(),
            sender(server.url()),
            options(),
            Status::default(),
        );
        assert!(scheduler.flush(Duration::from_secs(5)).await);
        assert_eq!(queue.len(), 1);
        assert_eq!(scheduler.consecutive_failures(), 1);

        // Backoff of 60s is in force, but an explicit flush still drains
        assert!(scheduler.flush(Duration::from_secs(5)).await);
        assert!(queue.is_empty());
        assert_eq!(scheduler.consecutive_failures(), 0);

        failing.assert_async().await;
        succeeding.assert_async().await;
    }

    #[tokio::test]
    async fn test_interval_trigger_honors_backoff() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path());
        queue.enqueue(test_document("a")).unwrap();

        let scheduler = DrainScheduler::start(
            queue.clone(),
            sender(server.url()),
            options(),
            Status::default(),
        );
        assert!(scheduler.flush(Duration::from_secs(5)).await);
        let cycles = scheduler.completed_cycles();

        scheduler.trigger(DrainTrigger::Interval);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The gated cycle ran without sending anything
        assert_eq!(scheduler.completed_cycles(), cycles + 1);
        assert_eq!(queue.len(), 1);
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_batch_is_dropped() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(400)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path());
        queue.enqueue(test_document("bad")).unwrap();

        let scheduler = DrainScheduler::start(
            queue.clone(),
            sender(server.url()),
            options(),
            Status::default(),
        );
        assert!(scheduler.flush(Duration::from_secs(5)).await);
        assert!(queue.is_empty());
        assert_eq!(scheduler.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_entries_are_discarded() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path());
        queue.enqueue(test_document("doomed")).unwrap();

        let scheduler = DrainScheduler::start(
            queue.clone(),
            sender(server.url()),
            DrainOptions {
                max_entry_retries: Some(1),
                ..options()
            },
            Status::default(),
        );
        assert!(scheduler.flush(Duration::from_secs(5)).await);
        assert_eq!(queue.len(), 1);
        assert!(scheduler.flush(Duration::from_secs(5)).await);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_is_bounded_by_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _accept = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path());
        queue.enqueue(test_document("stuck")).unwrap();

        let config = SenderConfig {
            socket_timeout: Duration::from_secs(30),
            ..SenderConfig::new(format!("http://{addr}"), "token")
        };
        let scheduler = DrainScheduler::start(
            queue.clone(),
            BulkSender::new(&config).unwrap(),
            options(),
            Status::default(),
        );

        let started = std::time::Instant::now();
        assert!(!scheduler.flush(Duration::from_millis(300)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(scheduler.is_cycle_in_flight());

        scheduler.abort_worker();
        drop(scheduler);
        queue.close().unwrap();

        // The leased entry is still on disk
        let reopened = DurableQueue::open(
            dir.path(),
            QueueOptions::default(),
            Arc::new(EmptyDisk),
            Status::default(),
        )
        .unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_timer_and_rejects_later_flushes() {
        let server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let scheduler = DrainScheduler::start(
            queue(dir.path()),
            sender(server.url()),
            options(),
            Status::default(),
        );
        assert!(scheduler.is_timer_running());

        assert!(scheduler.shutdown(Duration::from_secs(5)).await);
        assert!(!scheduler.is_timer_running());
        assert!(!scheduler.flush(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_size_trigger_drains_without_flush() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path());
        let scheduler = DrainScheduler::start(
            queue.clone(),
            sender(server.url()),
            DrainOptions {
                batch_size_threshold_bytes: 1,
                ..options()
            },
            Status::default(),
        );

        queue.enqueue(test_document("big enough")).unwrap();
        scheduler.notify_enqueued();

        for _ in 0..50 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(queue.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_periodic_timer_drains() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path());
        queue.enqueue(test_document("tick")).unwrap();
        let _scheduler = DrainScheduler::start(
            queue.clone(),
            sender(server.url()),
            DrainOptions {
                drain_interval: Duration::from_millis(50),
                ..options()
            },
            Status::default(),
        );

        for _ in 0..50 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(queue.is_empty());
        mock.assert_async().await;
    }
}
