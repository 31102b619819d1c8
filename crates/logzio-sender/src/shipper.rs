// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of the shipping pipeline.
//!
//! ```text
//! Stopped -> Starting -> Running -> Draining -> Stopped
//! ```
//!
//! A failed start goes back to `Stopped`. Entries not delivered at stop stay
//! in the buffer and are shipped by the next start.
//!
//! Shippers of one process that point at the same buffer directory share a
//! single queue and drain worker. The last one to stop tears it down.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock as StdRwLock, Weak};
use tokio::sync::{broadcast, Mutex as TokioMutex, RwLock};
use tracing::{debug, Level};

use crate::config::SenderConfig;
use crate::document::{DocumentEncoder, LogDocument, LogEnhancer, LogEvent};
use crate::error::{QueueError, ShipperError};
use crate::flusher::BulkSender;
use crate::hostname::{system_resolver, HostnameResolver, HOSTNAME_FIELD};
use crate::queue::{BufferState, DiskUsageProbe, DurableQueue, QueueOptions, StatfsProbe};
use crate::scheduler::{DrainOptions, DrainScheduler, DrainTrigger};
use crate::sink::{LogFilter, LogzioSink};
use crate::status::{Status, StatusReporter, TracingStatusReporter};

const WRITE_PROBE_FILE_NAME: &str = ".write-probe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipperStatus {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// Collaborators injected before the shipper is built.
pub struct LogShipperBuilder {
    config: SenderConfig,
    reporter: Arc<dyn StatusReporter>,
    enhancer: Option<Arc<dyn LogEnhancer>>,
    filter: Option<Arc<dyn LogFilter>>,
    hostname_resolver: HostnameResolver,
    probe: Arc<dyn DiskUsageProbe>,
}

impl std::fmt::Debug for LogShipperBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogShipperBuilder")
            .field("url", &self.config.url)
            .field("log_type", &self.config.log_type)
            .field("enhancer", &self.enhancer.is_some())
            .field("filter", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

impl LogShipperBuilder {
    #[must_use]
    pub fn with_status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn with_enhancer(mut self, enhancer: Arc<dyn LogEnhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn LogFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_hostname_resolver(mut self, resolver: HostnameResolver) -> Self {
        self.hostname_resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_disk_usage_probe(mut self, probe: Arc<dyn DiskUsageProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Resolves the configuration and builds a stopped shipper.
    #[must_use]
    pub fn build(self) -> LogShipper {
        let status = Status::new(self.reporter);
        let config = self.config.resolved(&status);
        let (status_tx, _) = broadcast::channel(16);

        LogShipper {
            inner: Arc::new(Inner {
                config,
                status,
                enhancer: self.enhancer,
                filter: self.filter,
                hostname_resolver: self.hostname_resolver,
                probe: self.probe,
                state: RwLock::new(ShipperStatus::Stopped),
                status_tx,
                pipeline: StdRwLock::new(None),
                lifecycle: TokioMutex::new(()),
                queue_full: AtomicBool::new(false),
            }),
        }
    }
}

/// Running deliveries by canonical buffer directory.
type Registry = TokioMutex<HashMap<PathBuf, Weak<Delivery>>>;

fn registry() -> &'static Registry {
    static DELIVERIES: OnceLock<Registry> = OnceLock::new();
    DELIVERIES.get_or_init(|| TokioMutex::new(HashMap::new()))
}

/// Queue and drain worker of one buffer directory.
struct Delivery {
    key: PathBuf,
    queue: Arc<DurableQueue>,
    scheduler: DrainScheduler,
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.scheduler.stop_timer();
        self.scheduler.abort_worker();
        let _ = self.queue.close();
    }
}

/// Everything that only exists while running.
struct Pipeline {
    delivery: Arc<Delivery>,
    encoder: DocumentEncoder,
}

struct Inner {
    config: SenderConfig,
    status: Status,
    enhancer: Option<Arc<dyn LogEnhancer>>,
    filter: Option<Arc<dyn LogFilter>>,
    hostname_resolver: HostnameResolver,
    probe: Arc<dyn DiskUsageProbe>,
    state: RwLock<ShipperStatus>,
    status_tx: broadcast::Sender<ShipperStatus>,
    pipeline: StdRwLock<Option<Arc<Pipeline>>>,
    /// Serializes start and stop
    lifecycle: TokioMutex<()>,
    /// Set while enqueues are rejected for disk usage
    queue_full: AtomicBool,
}

/// Durable log shipper. Cheap to clone, all clones share one pipeline.
#[derive(Clone)]
pub struct LogShipper {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LogShipper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogShipper")
            .field("url", &self.inner.config.url)
            .field("log_type", &self.inner.config.log_type)
            .field("running", &self.pipeline().is_some())
            .finish_non_exhaustive()
    }
}

impl LogShipper {
    #[must_use]
    pub fn builder(config: SenderConfig) -> LogShipperBuilder {
        LogShipperBuilder {
            config,
            reporter: Arc::new(TracingStatusReporter),
            enhancer: None,
            filter: None,
            hostname_resolver: system_resolver(),
            probe: Arc::new(StatfsProbe),
        }
    }

    #[must_use]
    pub fn new(config: SenderConfig) -> Self {
        Self::builder(config).build()
    }

    /// Shipper configured from `LOGZIO_*` environment variables.
    pub fn from_env() -> Result<Self, ShipperError> {
        Ok(Self::new(SenderConfig::from_env()?))
    }

    /// The resolved configuration snapshot.
    pub fn config(&self) -> &SenderConfig {
        &self.inner.config
    }

    pub fn level(&self) -> Level {
        self.inner.config.level
    }

    pub fn filter(&self) -> Option<&Arc<dyn LogFilter>> {
        self.inner.filter.as_ref()
    }

    pub async fn status(&self) -> ShipperStatus {
        *self.inner.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.inner.state.read().await, ShipperStatus::Running)
    }

    pub fn status_receiver(&self) -> broadcast::Receiver<ShipperStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Snapshot of the buffer, `None` while stopped.
    pub fn buffer_state(&self) -> Option<BufferState> {
        self.pipeline().map(|p| p.delivery.queue.state())
    }

    /// Sink adapter for host logging frameworks.
    #[must_use]
    pub fn sink(&self) -> LogzioSink {
        LogzioSink::new(self.clone())
    }

    fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.inner
            .pipeline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn set_status(&self, status: ShipperStatus) {
        *self.inner.state.write().await = status;
        let _ = self.inner.status_tx.send(status);
    }

    /// Validates the configuration, recovers the buffer and starts draining.
    ///
    /// On failure the shipper stays `Stopped`.
    pub async fn start(&self) -> Result<(), ShipperError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let mut state = self.inner.state.write().await;
            if *state != ShipperStatus::Stopped {
                return Err(ShipperError::AlreadyStarted);
            }
            *state = ShipperStatus::Starting;
        }
        let _ = self.inner.status_tx.send(ShipperStatus::Starting);

        match self.launch().await {
            Ok(pipeline) => {
                *self
                    .inner
                    .pipeline
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(pipeline));
                self.inner.queue_full.store(false, Ordering::SeqCst);
                self.set_status(ShipperStatus::Running).await;
                self.inner.status.info(&format!(
                    "Log shipper started, sending logs of type '{}' to {}",
                    self.inner.config.log_type, self.inner.config.url
                ));
                Ok(())
            }
            Err(e) => {
                self.inner
                    .status
                    .error_with_cause("Failed to start the log shipper", &e);
                self.set_status(ShipperStatus::Stopped).await;
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Pipeline, ShipperError> {
        let config = &self.inner.config;
        let status = &self.inner.status;
        config.validate()?;

        let queue_dir = config.queue_dir();
        prepare_buffer_dir(&queue_dir)?;

        let mut fields = config.additional_fields.clone();
        if config.add_hostname {
            match (self.inner.hostname_resolver)() {
                Ok(hostname) => fields.push((HOSTNAME_FIELD.to_string(), hostname)),
                Err(e) => status.warning_with_cause(
                    "Failed to resolve hostname, logs will be sent without a hostname field",
                    &e,
                ),
            }
        }

        Ok(Pipeline {
            delivery: self.delivery(queue_dir).await?,
            encoder: DocumentEncoder::new(fields, self.inner.enhancer.clone(), status.clone()),
        })
    }

    /// Joins the running delivery of `queue_dir`, or recovers the buffer and
    /// starts a new one.
    async fn delivery(&self, queue_dir: PathBuf) -> Result<Arc<Delivery>, ShipperError> {
        let config = &self.inner.config;
        let status = &self.inner.status;
        let key = fs::canonicalize(&queue_dir).unwrap_or_else(|_| queue_dir.clone());

        let mut deliveries = registry().lock().await;
        deliveries.retain(|_, delivery| delivery.strong_count() > 0);
        if let Some(delivery) = deliveries
            .get(&key)
            .and_then(Weak::upgrade)
            .filter(|delivery| !delivery.queue.is_closed())
        {
            status.info(&format!(
                "Sharing the buffer of type '{}' with a running shipper",
                config.log_type
            ));
            return Ok(delivery);
        }

        let options = QueueOptions::from(config);
        let probe = Arc::clone(&self.inner.probe);
        let queue_status = status.clone();
        let opened = tokio::task::spawn_blocking(move || {
            DurableQueue::open(queue_dir, options, probe, queue_status)
        })
        .await
        .map_err(|e| ShipperError::Runtime(format!("Buffer recovery task failed: {e}")))?;
        let queue = Arc::new(opened.map_err(|e| match e {
            QueueError::Locked(dir) => ShipperError::Config(format!(
                "Buffer directory {} is already used by another shipper",
                dir.display()
            )),
            e => ShipperError::Queue(e),
        })?);

        let sender = BulkSender::new(config)?;
        let scheduler = DrainScheduler::start(
            Arc::clone(&queue),
            sender,
            DrainOptions::from(config),
            status.clone(),
        );
        if !queue.is_empty() {
            debug!("LOGS | Draining {} entries left by a previous run", queue.len());
            scheduler.trigger(DrainTrigger::Interval);
        }

        let delivery = Arc::new(Delivery {
            key: key.clone(),
            queue,
            scheduler,
        });
        deliveries.insert(key, Arc::downgrade(&delivery));
        Ok(delivery)
    }

    /// Waits for a drain cycle, bounded by `drain_timeout`.
    ///
    /// Returns `Ok(false)` on timeout; undelivered logs stay buffered.
    pub async fn flush(&self) -> Result<bool, ShipperError> {
        let pipeline = self.pipeline().ok_or(ShipperError::NotRunning)?;
        Ok(pipeline
            .delivery
            .scheduler
            .flush(self.inner.config.drain_timeout)
            .await)
    }

    /// Final flush bounded by `drain_timeout`, then teardown. Idempotent.
    ///
    /// A buffer shared with other running shippers is only flushed, the last
    /// shipper to stop closes it.
    pub async fn stop(&self) -> Result<(), ShipperError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if *self.inner.state.read().await == ShipperStatus::Stopped {
            return Ok(());
        }
        self.set_status(ShipperStatus::Draining).await;

        if let Some(pipeline) = self.pipeline() {
            let timeout = self.inner.config.drain_timeout;
            let delivery = &pipeline.delivery;
            let mut deliveries = registry().lock().await;
            let flushed = if Arc::strong_count(delivery) == 1 {
                deliveries.remove(&delivery.key);
                let flushed = delivery.scheduler.shutdown(timeout).await;
                if let Err(e) = delivery.queue.close() {
                    self.inner
                        .status
                        .error_with_cause("Failed to close the buffer", &e);
                }
                flushed
            } else {
                drop(deliveries);
                delivery.scheduler.flush(timeout).await
            };
            if !flushed {
                self.inner.status.warning(&format!(
                    "Final flush did not complete within {timeout:?}, undelivered logs stay in the buffer"
                ));
            }
            self.inner
                .pipeline
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }

        self.set_status(ShipperStatus::Stopped).await;
        self.inner.status.info("Log shipper stopped");
        Ok(())
    }

    /// Same as [`LogShipper::stop`].
    pub async fn close(&self) -> Result<(), ShipperError> {
        self.stop().await
    }

    /// Encodes and buffers an event. Used by [`LogzioSink`] after filtering.
    pub(crate) fn accept_event(&self, event: &LogEvent) {
        let Some(pipeline) = self.pipeline() else {
            debug!("LOGS | Shipper not running, dropping log");
            return;
        };
        let document = pipeline.encoder.encode(event);
        self.buffer(&pipeline, document);
    }

    /// Buffers a pre-built document.
    pub fn enqueue_document(&self, document: LogDocument) -> Result<(), ShipperError> {
        let pipeline = self.pipeline().ok_or(ShipperError::NotRunning)?;
        pipeline.delivery.queue.enqueue(document)?;
        pipeline.delivery.scheduler.notify_enqueued();
        Ok(())
    }

    fn buffer(&self, pipeline: &Pipeline, document: LogDocument) {
        match pipeline.delivery.queue.enqueue(document) {
            Ok(()) => {
                if self.inner.queue_full.swap(false, Ordering::SeqCst) {
                    self.inner
                        .status
                        .info("Disk usage is back under the threshold, accepting logs again");
                }
                pipeline.delivery.scheduler.notify_enqueued();
            }
            Err(e @ QueueError::Full { .. }) => {
                if !self.inner.queue_full.swap(true, Ordering::SeqCst) {
                    self.inner.status.warning_with_cause(
                        "Buffer disk is full, dropping logs until usage goes down",
                        &e,
                    );
                }
            }
            Err(e) => self
                .inner
                .status
                .error_with_cause("Failed to buffer log, dropping it", &e),
        }
    }
}

/// Creates the buffer directory and checks that it is writable.
fn prepare_buffer_dir(dir: &Path) -> Result<(), ShipperError> {
    let not_writable = |e: std::io::Error| {
        ShipperError::Config(format!(
            "Buffer directory {} is not writable: {e}",
            dir.display()
        ))
    };
    fs::create_dir_all(dir).map_err(not_writable)?;
    let probe = dir.join(WRITE_PROBE_FILE_NAME);
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&probe)
        .map_err(not_writable)?;
    fs::remove_file(&probe).map_err(not_writable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{MemoryStatusReporter, StatusLevel};
    use std::path::PathBuf;

    fn config(buffer_dir: PathBuf) -> SenderConfig {
        SenderConfig {
            buffer_dir: Some(buffer_dir),
            file_system_full_percent_threshold: -1,
            drain_timeout: std::time::Duration::from_secs(1),
            ..SenderConfig::new("http://127.0.0.1:9", "token")
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let shipper = LogShipper::new(config(dir.path().to_path_buf()));
        let mut rx = shipper.status_receiver();
        assert_eq!(shipper.status().await, ShipperStatus::Stopped);

        shipper.start().await.unwrap();
        assert!(shipper.is_running().await);
        assert_eq!(rx.recv().await.unwrap(), ShipperStatus::Starting);
        assert_eq!(rx.recv().await.unwrap(), ShipperStatus::Running);
        assert!(shipper.buffer_state().is_some());

        shipper.stop().await.unwrap();
        assert_eq!(shipper.status().await, ShipperStatus::Stopped);
        assert_eq!(rx.recv().await.unwrap(), ShipperStatus::Draining);
        assert_eq!(rx.recv().await.unwrap(), ShipperStatus::Stopped);
        assert!(shipper.buffer_state().is_none());
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let shipper = LogShipper::new(config(dir.path().to_path_buf()));
        shipper.start().await.unwrap();
        assert!(matches!(
            shipper.start().await,
            Err(ShipperError::AlreadyStarted)
        ));
        shipper.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let shipper = LogShipper::new(config(dir.path().to_path_buf()));
        shipper.stop().await.unwrap();

        shipper.start().await.unwrap();
        shipper.stop().await.unwrap();
        shipper.stop().await.unwrap();
        assert_eq!(shipper.status().await, ShipperStatus::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_threshold_keeps_shipper_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Arc::new(MemoryStatusReporter::new());
        let shipper = LogShipper::builder(SenderConfig {
            file_system_full_percent_threshold: 150,
            ..config(dir.path().to_path_buf())
        })
        .with_status_reporter(reporter.clone())
        .build();

        let result = shipper.start().await;
        assert!(matches!(result, Err(ShipperError::Config(_))));
        assert_eq!(shipper.status().await, ShipperStatus::Stopped);
        assert!(reporter.contains(StatusLevel::Error, "Failed to start"));

        // A failed start can be retried
        assert!(matches!(
            shipper.start().await,
            Err(ShipperError::Config(_))
        ));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_unwritable_buffer_dir_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"").unwrap();

        let shipper = LogShipper::new(config(file));
        assert!(matches!(
            shipper.start().await,
            Err(ShipperError::Config(_))
        ));
        assert_eq!(shipper.status().await, ShipperStatus::Stopped);
    }

    #[tokio::test]
    async fn test_operations_require_running_shipper() {
        let dir = tempfile::tempdir().unwrap();
        let shipper = LogShipper::new(config(dir.path().to_path_buf()));
        assert!(matches!(shipper.flush().await, Err(ShipperError::NotRunning)));
        assert!(matches!(
            shipper.enqueue_document(crate::document::test_document("early")),
            Err(ShipperError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_buffer_dir_is_scoped_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let shipper = LogShipper::new(SenderConfig {
            log_type: "billing".to_string(),
            ..config(dir.path().to_path_buf())
        });
        shipper.start().await.unwrap();
        assert!(dir.path().join("billing").is_dir());
        assert!(!dir.path().join("billing").join(WRITE_PROBE_FILE_NAME).exists());
        shipper.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shippers_of_one_type_share_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let first = LogShipper::new(config(dir.path().to_path_buf()));
        let second = LogShipper::new(config(dir.path().to_path_buf()));
        first.start().await.unwrap();
        second.start().await.unwrap();

        first
            .enqueue_document(crate::document::test_document("from first"))
            .unwrap();
        second
            .enqueue_document(crate::document::test_document("from second"))
            .unwrap();
        for shipper in [&first, &second] {
            let state = shipper.buffer_state().unwrap();
            assert_eq!(state.pending_entries + state.in_flight_entries, 2);
        }

        // The remaining shipper keeps the buffer open
        first.stop().await.unwrap();
        assert!(second.is_running().await);
        second
            .enqueue_document(crate::document::test_document("after first stopped"))
            .unwrap();

        second.stop().await.unwrap();
        let queue = DurableQueue::open(
            config(dir.path().to_path_buf()).queue_dir(),
            QueueOptions::default(),
            Arc::new(StatfsProbe),
            Status::default(),
        )
        .unwrap();
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_buffer_owned_elsewhere_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path().to_path_buf());
        let queue = DurableQueue::open(
            config.queue_dir(),
            QueueOptions::default(),
            Arc::new(StatfsProbe),
            Status::default(),
        )
        .unwrap();

        let shipper = LogShipper::new(config);
        assert!(matches!(
            shipper.start().await,
            Err(ShipperError::Config(_))
        ));
        assert_eq!(shipper.status().await, ShipperStatus::Stopped);

        queue.close().unwrap();
        shipper.start().await.unwrap();
        shipper.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_shipper_releases_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let shipper = LogShipper::new(config(dir.path().to_path_buf()));
        shipper.start().await.unwrap();
        drop(shipper);

        let restarted = LogShipper::new(config(dir.path().to_path_buf()));
        restarted.start().await.unwrap();
        restarted.stop().await.unwrap();
    }
}
