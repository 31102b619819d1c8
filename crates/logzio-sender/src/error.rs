// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors surfaced by the shipper's public API.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Shipper already started")]
    AlreadyStarted,

    #[error("Shipper not running")]
    NotRunning,

    #[error("The field name '{0}' is reserved and can't be overridden")]
    ReservedField(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Errors raised by the durable queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Disk usage {usage_percent:.1}% reached the {threshold}% threshold, log dropped")]
    Full { usage_percent: f64, threshold: i32 },

    #[error("Corrupted record in {} at offset {offset}: {reason}", file.display())]
    Corruption {
        file: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("Queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue is closed")]
    Closed,

    #[error("Buffer directory {} is already in use by another queue", .0.display())]
    Locked(PathBuf),
}

/// Retriable delivery failures. Terminal rejections are reported through
/// [`crate::flusher::DeliveryResult::Rejected`] instead.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Listener responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to prepare payload: {0}")]
    Payload(String),
}
