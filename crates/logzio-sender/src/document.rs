// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log event to JSON document encoding.
//!
//! # Document Layout
//!
//! ```json
//! {
//!   "@timestamp": "2025-01-01T12:00:00.000Z",
//!   "loglevel": "INFO",
//!   "message": "request served",
//!   "logger": "my_app::http",
//!   "thread": "tokio-runtime-worker",
//!   "exception": "connection reset\nCaused by: broken pipe",
//!   "env": "prod"
//! }
//! ```
//!
//! The six reserved fields are always assigned by the encoder. Additional
//! fields and enhancer fields follow in insertion order and can never
//! overwrite a reserved field.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::sync::Arc;
use tracing::Level;

use crate::constants::{MAX_DOCUMENT_FIELDS, MAX_DOCUMENT_SIZE_BYTES};
use crate::error::ShipperError;
use crate::status::Status;

pub const TIMESTAMP: &str = "@timestamp";
pub const LOGLEVEL: &str = "loglevel";
pub const MESSAGE: &str = "message";
pub const LOGGER: &str = "logger";
pub const THREAD: &str = "thread";
pub const EXCEPTION: &str = "exception";

pub const RESERVED_FIELDS: [&str; 6] = [TIMESTAMP, LOGLEVEL, MESSAGE, LOGGER, THREAD, EXCEPTION];

#[must_use]
pub fn is_reserved_field(name: &str) -> bool {
    RESERVED_FIELDS.contains(&name)
}

/// Scalar value of a document field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl From<FieldValue> for Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::String(s) => Value::String(s),
            FieldValue::Integer(i) => Value::from(i),
            FieldValue::Float(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
            FieldValue::Bool(b) => Value::Bool(b),
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A structured log event handed to the pipeline by the host.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message: String,
    pub logger: String,
    pub thread: String,
    /// Full error trace, rendered as text.
    pub exception: Option<String>,
}

impl LogEvent {
    /// Creates an event stamped with the current time and thread.
    pub fn new(level: Level, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            logger: logger.into(),
            thread: current_thread_name(),
            exception: None,
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = thread.into();
        self
    }

    #[must_use]
    pub fn with_exception(mut self, trace: impl Into<String>) -> Self {
        self.exception = Some(trace.into());
        self
    }

    /// Attaches `error` and its whole `source()` chain as the exception text.
    #[must_use]
    pub fn with_error(self, error: &dyn Error) -> Self {
        let trace = render_error_chain(error);
        self.with_exception(trace)
    }
}

fn current_thread_name() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}

/// Renders an error and its causes, one per line.
#[must_use]
pub fn render_error_chain(error: &dyn Error) -> String {
    let mut trace = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        trace.push_str("\nCaused by: ");
        trace.push_str(&cause.to_string());
        source = cause.source();
    }
    trace
}

/// Immutable JSON document produced by the encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogDocument(Map<String, Value>);

impl LogDocument {
    pub(crate) fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Field names in document order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    pub fn encoded_len(&self) -> usize {
        encoded_len(&self.0)
    }
}

fn encoded_len(map: &Map<String, Value>) -> usize {
    serde_json::to_vec(map).map_or(0, |v| v.len())
}

/// Hook that contributes extra fields to every document.
///
/// Passed explicitly at construction. Fields it returns go through the same
/// reserved-name check as configured additional fields.
pub trait LogEnhancer: Send + Sync {
    fn enhance(&self, event: &LogEvent) -> Vec<(String, FieldValue)>;
}

impl<F> LogEnhancer for F
where
    F: Fn(&LogEvent) -> Vec<(String, FieldValue)> + Send + Sync,
{
    fn enhance(&self, event: &LogEvent) -> Vec<(String, FieldValue)> {
        self(event)
    }
}

/// Encodes `event` into a document.
///
/// Reserved keys found in `additional_fields` or in the enhancer output are
/// dropped and reported as warnings.
pub fn encode(
    event: &LogEvent,
    additional_fields: &[(String, String)],
    enhancer: Option<&dyn LogEnhancer>,
    status: &Status,
) -> LogDocument {
    let mut map = Map::new();
    map.insert(
        TIMESTAMP.to_string(),
        Value::String(event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    map.insert(LOGLEVEL.to_string(), Value::String(event.level.to_string()));
    map.insert(MESSAGE.to_string(), Value::String(event.message.clone()));
    map.insert(LOGGER.to_string(), Value::String(event.logger.clone()));
    map.insert(THREAD.to_string(), Value::String(event.thread.clone()));
    if let Some(exception) = &event.exception {
        map.insert(EXCEPTION.to_string(), Value::String(exception.clone()));
    }

    let mut dropped_over_limit = 0usize;
    for (key, value) in additional_fields {
        merge_field(
            &mut map,
            key,
            Value::String(value.clone()),
            "additional fields",
            &mut dropped_over_limit,
            status,
        );
    }

    if let Some(enhancer) = enhancer {
        for (key, value) in enhancer.enhance(event) {
            merge_field(
                &mut map,
                &key,
                value.into(),
                "enhancer",
                &mut dropped_over_limit,
                status,
            );
        }
    }

    if dropped_over_limit > 0 {
        status.warning(&format!(
            "Document reached the limit of {MAX_DOCUMENT_FIELDS} fields, {dropped_over_limit} fields were dropped"
        ));
    }

    bound_size(&mut map, status);
    LogDocument::from_map(map)
}

fn merge_field(
    map: &mut Map<String, Value>,
    key: &str,
    value: Value,
    origin: &str,
    dropped_over_limit: &mut usize,
    status: &Status,
) {
    if is_reserved_field(key) {
        status.warning_with_cause(
            &format!("Dropping field from {origin}, it will not be added to the outgoing log"),
            &ShipperError::ReservedField(key.to_string()),
        );
        return;
    }
    if !map.contains_key(key) && map.len() >= MAX_DOCUMENT_FIELDS {
        *dropped_over_limit += 1;
        return;
    }
    map.insert(key.to_string(), value);
}

/// Truncates `message`, then `exception`, until the document fits.
fn bound_size(map: &mut Map<String, Value>, status: &Status) {
    let original = encoded_len(map);
    if original <= MAX_DOCUMENT_SIZE_BYTES {
        return;
    }

    let mut size = original;
    for field in [MESSAGE, EXCEPTION] {
        while size > MAX_DOCUMENT_SIZE_BYTES {
            let Some(Value::String(text)) = map.get_mut(field) else {
                break;
            };
            if text.is_empty() {
                break;
            }
            let excess = size - MAX_DOCUMENT_SIZE_BYTES;
            truncate_on_char_boundary(text, text.len().saturating_sub(excess));
            size = encoded_len(map);
        }
    }

    status.warning(&format!(
        "Log document of {original} bytes exceeded {MAX_DOCUMENT_SIZE_BYTES} bytes and was truncated to {size} bytes"
    ));
}

fn truncate_on_char_boundary(text: &mut String, max_len: usize) {
    if text.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

/// Encoder bound to the shipper's resolved additional fields and enhancer.
#[derive(Clone)]
pub struct DocumentEncoder {
    additional_fields: Vec<(String, String)>,
    enhancer: Option<Arc<dyn LogEnhancer>>,
    status: Status,
}

impl std::fmt::Debug for DocumentEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentEncoder")
            .field("additional_fields", &self.additional_fields)
            .field("enhancer", &self.enhancer.is_some())
            .finish()
    }
}

impl DocumentEncoder {
    pub fn new(
        additional_fields: Vec<(String, String)>,
        enhancer: Option<Arc<dyn LogEnhancer>>,
        status: Status,
    ) -> Self {
        Self {
            additional_fields,
            enhancer,
            status,
        }
    }

    pub fn additional_fields(&self) -> &[(String, String)] {
        &self.additional_fields
    }

    pub fn encode(&self, event: &LogEvent) -> LogDocument {
        encode(
            event,
            &self.additional_fields,
            self.enhancer.as_deref(),
            &self.status,
        )
    }
}

#[cfg(test)]
pub(crate) fn test_document(message: &str) -> LogDocument {
    let event = LogEvent::new(Level::INFO, "test", message).with_thread("main");
    encode(&event, &[], None, &Status::default())
}
