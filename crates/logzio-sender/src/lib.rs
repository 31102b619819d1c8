// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Logz.io Sender
//!
//! Durable log shipping pipeline: structured events are encoded into JSON
//! documents, written to a disk-backed queue and delivered in bulk to a
//! logz.io listener over HTTP.
//!
//! ## Architecture
//!
//! - [`document`]: event to JSON document encoding with reserved-field protection
//! - [`queue`]: crash-recoverable on-disk FIFO with disk-usage backpressure
//! - [`scheduler`]: interval, size and explicit drain triggers
//! - [`flusher`]: bulk HTTP delivery and retry classification
//! - [`status`]: injectable diagnostics that can never break the pipeline
//! - [`shipper`]: start, flush and stop lifecycle
//! - [`sink`]: ingestion boundary for host logging frameworks
//!
//! ## Example
//!
//! ```rust,ignore
//! use logzio_sender::{LogEvent, LogShipper, LogSink, SenderConfig};
//! use tracing::Level;
//!
//! let shipper = LogShipper::new(SenderConfig::new(
//!     "https://listener.logz.io:8071",
//!     "$LOGZIO_TOKEN",
//! ));
//! shipper.start().await?;
//!
//! let sink = shipper.sink();
//! sink.accept(&LogEvent::new(Level::INFO, "my_app::orders", "order placed"));
//!
//! shipper.stop().await?;
//! ```

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod document;
pub mod error;
pub mod flusher;
pub mod hostname;
pub mod http;
pub mod queue;
pub mod scheduler;
pub mod shipper;
pub mod sink;
pub mod status;

pub use config::SenderConfig;
pub use document::{DocumentEncoder, FieldValue, LogDocument, LogEnhancer, LogEvent};
pub use error::{DeliveryError, QueueError, ShipperError};
pub use flusher::{BulkSender, DeliveryResult};
pub use queue::{BufferState, DurableQueue, QueueEntry};
pub use shipper::{LogShipper, LogShipperBuilder, ShipperStatus};
pub use sink::{LogFilter, LogSink, LogzioSink};
pub use status::{MemoryStatusReporter, Status, StatusReporter, TracingStatusReporter};
