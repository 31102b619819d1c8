// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Narrow ingestion boundary for host logging frameworks.

use tracing::Level;

use crate::constants::SELF_LOGGER_PREFIX;
use crate::document::LogEvent;
use crate::shipper::LogShipper;

/// Accepts events from a host logging framework.
///
/// `accept` never blocks on the network and never fails; problems are
/// reported through the shipper's status reporter.
pub trait LogSink: Send + Sync {
    fn accept(&self, event: &LogEvent);
}

/// Decides whether an event is shipped at all.
pub trait LogFilter: Send + Sync {
    fn is_loggable(&self, event: &LogEvent) -> bool;
}

impl<F> LogFilter for F
where
    F: Fn(&LogEvent) -> bool + Send + Sync,
{
    fn is_loggable(&self, event: &LogEvent) -> bool {
        self(event)
    }
}

/// True for events emitted by this crate, which are never shipped.
pub fn is_self_event(event: &LogEvent) -> bool {
    event.logger.starts_with(SELF_LOGGER_PREFIX)
}

/// Returns true if `event` is at least as severe as `threshold`.
pub fn is_enabled(threshold: Level, event: &LogEvent) -> bool {
    // tracing orders more verbose levels as greater
    event.level <= threshold
}

/// [`LogSink`] feeding a [`LogShipper`].
#[derive(Debug, Clone)]
pub struct LogzioSink {
    shipper: LogShipper,
}

impl LogzioSink {
    pub(crate) fn new(shipper: LogShipper) -> Self {
        Self { shipper }
    }

    pub fn shipper(&self) -> &LogShipper {
        &self.shipper
    }
}

impl LogSink for LogzioSink {
    fn accept(&self, event: &LogEvent) {
        if is_self_event(event) || !is_enabled(self.shipper.level(), event) {
            return;
        }
        if let Some(filter) = self.shipper.filter() {
            if !filter.is_loggable(event) {
                return;
            }
        }
        self.shipper.accept_event(event);
    }
}
