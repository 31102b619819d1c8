// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Internal diagnostic channel.
//!
//! Every pipeline component reports its operational state through a
//! [`StatusReporter`] injected by the host, so the host decides where the
//! shipper's own diagnostics surface. Reporters are always invoked through
//! [`Status`], which swallows panics and turns a broken reporter into a
//! silent no-op.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Tracing target used by [`TracingStatusReporter`].
pub const STATUS_TARGET: &str = "logzio_sender::status";

/// Three-level diagnostic sink.
pub trait StatusReporter: Send + Sync {
    fn error(&self, msg: &str);
    fn error_with_cause(&self, msg: &str, cause: &dyn Error);
    fn warning(&self, msg: &str);
    fn warning_with_cause(&self, msg: &str, cause: &dyn Error);
    fn info(&self, msg: &str);
    fn info_with_cause(&self, msg: &str, cause: &dyn Error);
}

/// Default reporter, forwards everything to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatusReporter;

impl StatusReporter for TracingStatusReporter {
    fn error(&self, msg: &str) {
        tracing::error!(target: STATUS_TARGET, "{msg}");
    }

    fn error_with_cause(&self, msg: &str, cause: &dyn Error) {
        tracing::error!(target: STATUS_TARGET, "{msg}: {cause}");
    }

    fn warning(&self, msg: &str) {
        tracing::warn!(target: STATUS_TARGET, "{msg}");
    }

    fn warning_with_cause(&self, msg: &str, cause: &dyn Error) {
        tracing::warn!(target: STATUS_TARGET, "{msg}: {cause}");
    }

    fn info(&self, msg: &str) {
        tracing::info!(target: STATUS_TARGET, "{msg}");
    }

    fn info_with_cause(&self, msg: &str, cause: &dyn Error) {
        tracing::info!(target: STATUS_TARGET, "{msg}: {cause}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub level: StatusLevel,
    pub message: String,
    /// Rendered cause, when one was supplied.
    pub cause: Option<String>,
}

/// Reporter that keeps the most recent messages in memory.
///
/// Useful for hosts that poll diagnostics instead of logging them, and for
/// asserting on diagnostics in tests. Once `capacity` messages are held the
/// oldest one is dropped for each new one.
#[derive(Debug)]
pub struct MemoryStatusReporter {
    capacity: usize,
    messages: Mutex<VecDeque<StatusMessage>>,
}

impl Default for MemoryStatusReporter {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl MemoryStatusReporter {
    pub const DEFAULT_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            messages: Mutex::new(VecDeque::new()),
        }
    }

    /// Held messages, oldest first.
    pub fn messages(&self) -> Vec<StatusMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn messages_at(&self, level: StatusLevel) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.level == level)
            .map(|m| m.message)
            .collect()
    }

    /// Returns true if any message at `level` contains `needle`.
    pub fn contains(&self, level: StatusLevel, needle: &str) -> bool {
        self.messages_at(level).iter().any(|m| m.contains(needle))
    }

    pub fn clear(&self) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push(&self, level: StatusLevel, msg: &str, cause: Option<&dyn Error>) {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        if messages.len() >= self.capacity {
            messages.pop_front();
        }
        messages.push_back(StatusMessage {
            level,
            message: msg.to_string(),
            cause: cause.map(ToString::to_string),
        });
    }
}

impl StatusReporter for MemoryStatusReporter {
    fn error(&self, msg: &str) {
        self.push(StatusLevel::Error, msg, None);
    }

    fn error_with_cause(&self, msg: &str, cause: &dyn Error) {
        self.push(StatusLevel::Error, msg, Some(cause));
    }

    fn warning(&self, msg: &str) {
        self.push(StatusLevel::Warning, msg, None);
    }

    fn warning_with_cause(&self, msg: &str, cause: &dyn Error) {
        self.push(StatusLevel::Warning, msg, Some(cause));
    }

    fn info(&self, msg: &str) {
        self.push(StatusLevel::Info, msg, None);
    }

    fn info_with_cause(&self, msg: &str, cause: &dyn Error) {
        self.push(StatusLevel::Info, msg, Some(cause));
    }
}

/// Panic-proof handle to the injected reporter, shared by all components.
#[derive(Clone)]
pub struct Status {
    reporter: Arc<dyn StatusReporter>,
    broken: Arc<AtomicBool>,
}

impl Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status")
            .field("broken", &self.broken.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new(Arc::new(TracingStatusReporter))
    }
}

impl Status {
    pub fn new(reporter: Arc<dyn StatusReporter>) -> Self {
        Self {
            reporter,
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True once the reporter panicked and was disabled.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }

    fn call(&self, f: impl FnOnce(&dyn StatusReporter)) {
        if self.broken.load(Ordering::Relaxed) {
            return;
        }
        let reporter = self.reporter.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(reporter))).is_err() {
            self.broken.store(true, Ordering::Relaxed);
        }
    }

    pub fn error(&self, msg: &str) {
        self.call(|r| r.error(msg));
    }

    pub fn error_with_cause(&self, msg: &str, cause: &dyn Error) {
        self.call(|r| r.error_with_cause(msg, cause));
    }

    pub fn warning(&self, msg: &str) {
        self.call(|r| r.warning(msg));
    }

    pub fn warning_with_cause(&self, msg: &str, cause: &dyn Error) {
        self.call(|r| r.warning_with_cause(msg, cause));
    }

    pub fn info(&self, msg: &str) {
        self.call(|r| r.info(msg));
    }

    pub fn info_with_cause(&self, msg: &str, cause: &dyn Error) {
        self.call(|r| r.info_with_cause(msg, cause));
    }
}
