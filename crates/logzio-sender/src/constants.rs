// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits and defaults of the log listener and the local buffer.
//!
//! # Listener Constraints
//!
//! - **Line size**: a single document larger than 500KB is rejected
//! - **Bulk size**: bulk requests are kept around 3MB uncompressed
//! - **Field count**: documents carry at most 1,000 fields

/// Maximum encoded size of a single document in bytes.
///
/// Documents above this size have their `message` (then `exception`)
/// truncated by the encoder.
///
/// # Value: 500KB (512,000 bytes)
pub const MAX_DOCUMENT_SIZE_BYTES: usize = 500 * 1_024;

/// Maximum number of fields in a single document, reserved fields included.
pub const MAX_DOCUMENT_FIELDS: usize = 1_000;

/// Maximum number of documents sent in one bulk request.
pub const MAX_BATCH_ENTRIES: usize = 1_000;

/// Default uncompressed bulk size, also the queue size that triggers a drain.
///
/// # Value: 3MB (3,145,728 bytes)
pub const DEFAULT_BATCH_SIZE_THRESHOLD_BYTES: usize = 3 * 1_024 * 1_024;

/// Size at which the active queue segment is rotated.
///
/// # Value: 8MB (8,388,608 bytes)
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 8 * 1_024 * 1_024;

pub const DEFAULT_URL: &str = "https://listener.logz.io:8071";
pub const DEFAULT_LOG_TYPE: &str = "rust";
pub const DEFAULT_BUFFER_DIR_NAME: &str = "logzio-rust-buffer";
pub const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_FS_FULL_PERCENT_THRESHOLD: i32 = 98;
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 60_000;

/// Threshold value that disables the disk usage check.
pub const FS_THRESHOLD_DISABLED: i32 = -1;

/// Loggers under this prefix are the shipper's own diagnostics and are never
/// shipped.
pub const SELF_LOGGER_PREFIX: &str = "logzio_sender";
