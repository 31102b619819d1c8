// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bulk delivery of queued documents to the listener.
//!
//! A batch is sent as one POST whose body holds one JSON document per line.
//! The response is classified as:
//!
//! - **Delivered**: 2xx, the batch is acknowledged
//! - **Rejected**: 4xx other than 408 and 429, the batch is dropped
//! - **Failed**: transport errors, timeouts, 5xx, 408 and 429, the batch is
//!   requeued and retried after a backoff

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::SenderConfig;
use crate::error::{DeliveryError, ShipperError};
use crate::http::get_client;
use crate::queue::QueueEntry;

/// Outcome of one bulk request.
#[derive(Debug)]
pub enum DeliveryResult {
    Delivered { count: usize },
    /// Terminal rejection, retrying would fail the same way.
    Rejected { status: u16, body: String },
    /// Retriable failure.
    Failed(DeliveryError),
}

impl DeliveryResult {
    pub fn is_retriable(&self) -> bool {
        matches!(self, DeliveryResult::Failed(_))
    }
}

/// True for response codes worth retrying.
#[must_use]
pub fn is_retriable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[derive(Debug, Clone)]
pub struct BulkSender {
    client: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    compress: bool,
}

impl BulkSender {
    /// Builds the sender for a resolved configuration.
    pub fn new(config: &SenderConfig) -> Result<Self, ShipperError> {
        let mut endpoint = Url::parse(&config.url)
            .map_err(|e| ShipperError::Config(format!("Invalid url '{}': {e}", config.url)))?;
        endpoint
            .query_pairs_mut()
            .append_pair("token", &config.token)
            .append_pair("type", &config.log_type);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if config.compress_requests {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        Ok(Self {
            client: get_client(config),
            endpoint,
            headers,
            compress: config.compress_requests,
        })
    }

    /// Sends `entries` as a single bulk request.
    pub async fn send_batch(&self, entries: &[QueueEntry]) -> DeliveryResult {
        if entries.is_empty() {
            return DeliveryResult::Delivered { count: 0 };
        }

        let body = match self.payload(entries) {
            Ok(body) => body,
            Err(e) => return DeliveryResult::Failed(e),
        };

        let time = Instant::now();
        let resp = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await;
        let elapsed = time.elapsed();

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                debug!(
                    "LOGS | Bulk request of {} documents failed after {} ms: {e}",
                    entries.len(),
                    elapsed.as_millis()
                );
                return DeliveryResult::Failed(DeliveryError::Transport(e));
            }
        };

        let status = resp.status();
        if status.is_success() {
            debug!(
                "LOGS | Delivered {} documents in {} ms",
                entries.len(),
                elapsed.as_millis()
            );
            return DeliveryResult::Delivered {
                count: entries.len(),
            };
        }

        let body = resp.text().await.unwrap_or_default();
        if is_retriable_status(status) {
            DeliveryResult::Failed(DeliveryError::Status {
                status: status.as_u16(),
                body,
            })
        } else {
            DeliveryResult::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }

    fn payload(&self, entries: &[QueueEntry]) -> Result<Vec<u8>, DeliveryError> {
        let data = bulk_body(entries)?;
        if !self.compress {
            return Ok(data);
        }
        gzip(&data).map_err(|e| DeliveryError::Payload(format!("Failed to compress payload: {e}")))
    }
}

/// Newline-delimited documents, one per entry.
pub fn bulk_body(entries: &[QueueEntry]) -> Result<Vec<u8>, DeliveryError> {
    let mut body = Vec::with_capacity(entries.iter().map(|e| e.size + 1).sum());
    for entry in entries {
        serde_json::to_writer(&mut body, &entry.document)
            .map_err(|e| DeliveryError::Payload(format!("Failed to serialize document: {e}")))?;
        body.push(b'\n');
    }
    Ok(body)
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Delay between consecutive failed drain cycles.
///
/// Starts at `initial`, doubles after every failure up to `max` and resets on
/// success.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: 0,
        }
    }

    /// Records a failure and returns the delay before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.current()
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Delay for the current failure streak, zero when there is none.
    #[must_use]
    pub fn current(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (self.failures - 1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
