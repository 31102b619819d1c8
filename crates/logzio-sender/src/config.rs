// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

use crate::constants::{
    DEFAULT_BATCH_SIZE_THRESHOLD_BYTES, DEFAULT_BUFFER_DIR_NAME, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_DRAIN_INTERVAL_SECS, DEFAULT_DRAIN_TIMEOUT_SECS, DEFAULT_FS_FULL_PERCENT_THRESHOLD,
    DEFAULT_GC_INTERVAL_SECS, DEFAULT_LOG_TYPE, DEFAULT_RETRY_INITIAL_BACKOFF_MS,
    DEFAULT_RETRY_MAX_BACKOFF_MS, DEFAULT_SEGMENT_MAX_BYTES, DEFAULT_SOCKET_TIMEOUT_MS,
    DEFAULT_URL, FS_THRESHOLD_DISABLED,
};
use crate::document::is_reserved_field;
use crate::error::ShipperError;
use crate::status::Status;

/// Configuration of the log shipping pipeline.
///
/// `url`, `token` and additional field values may be written as `$NAME`, in
/// which case [`SenderConfig::resolved`] replaces them with the value of the
/// environment variable `NAME`. Resolution happens once, when the shipper is
/// constructed.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Listener URL, bulk requests are POSTed here
    pub url: String,
    /// Account token sent with every bulk request
    pub token: String,
    /// Type tag of the shipped logs, also names the buffer subdirectory
    pub log_type: String,
    /// Interval of the periodic drain
    pub drain_interval: Duration,
    /// Upper bound of an explicit flush, including the final one at shutdown
    pub drain_timeout: Duration,
    /// Disk usage percent (1-100) at which enqueues are rejected, -1 disables the check
    pub file_system_full_percent_threshold: i32,
    /// Buffer root, defaults to a directory under the platform temp dir
    pub buffer_dir: Option<PathBuf>,
    pub socket_timeout: Duration,
    pub connect_timeout: Duration,
    /// Reports per-batch delivery outcomes at info level
    pub debug: bool,
    /// Adds a `hostname` field resolved once at start
    pub add_hostname: bool,
    /// Static fields added to every document
    pub additional_fields: Vec<(String, String)>,
    /// Interval of the garbage collection of acknowledged queue segments
    pub gc_persisted_queue_files_interval: Duration,
    /// Minimum level of events accepted by the sink
    pub level: Level,
    /// Gzip bulk request bodies
    pub compress_requests: bool,
    /// Queue size that triggers a drain, also the maximum bulk size
    pub batch_size_threshold_bytes: usize,
    pub segment_max_bytes: u64,
    /// fdatasync every enqueue
    pub sync_writes: bool,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    /// Entries failing more deliveries than this are dropped
    pub max_entry_retries: Option<u32>,
    /// Entries older than this are dropped before delivery
    pub max_entry_age: Option<Duration>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            token: String::new(),
            log_type: DEFAULT_LOG_TYPE.to_string(),
            drain_interval: Duration::from_secs(DEFAULT_DRAIN_INTERVAL_SECS),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            file_system_full_percent_threshold: DEFAULT_FS_FULL_PERCENT_THRESHOLD,
            buffer_dir: None,
            socket_timeout: Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            debug: false,
            add_hostname: false,
            additional_fields: Vec::new(),
            gc_persisted_queue_files_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
            level: Level::INFO,
            compress_requests: false,
            batch_size_threshold_bytes: DEFAULT_BATCH_SIZE_THRESHOLD_BYTES,
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            sync_writes: false,
            retry_initial_backoff: Duration::from_millis(DEFAULT_RETRY_INITIAL_BACKOFF_MS),
            retry_max_backoff: Duration::from_millis(DEFAULT_RETRY_MAX_BACKOFF_MS),
            max_entry_retries: None,
            max_entry_age: None,
        }
    }
}

impl SenderConfig {
    /// Convenience constructor for the common case.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            ..Default::default()
        }
    }

    /// Create configuration from `LOGZIO_*` environment variables
    pub fn from_env() -> Result<Self, ShipperError> {
        let defaults = Self::default();

        let additional_fields = match env::var("LOGZIO_ADDITIONAL_FIELDS") {
            Ok(raw) => parse_additional_fields(&raw)?,
            Err(_) => Vec::new(),
        };

        let config = Self {
            url: env::var("LOGZIO_URL").unwrap_or(defaults.url),
            token: env::var("LOGZIO_TOKEN").unwrap_or(defaults.token),
            log_type: env::var("LOGZIO_TYPE").unwrap_or(defaults.log_type),
            drain_interval: env_parse::<u64>("LOGZIO_DRAIN_INTERVAL_SEC")?
                .map_or(defaults.drain_interval, Duration::from_secs),
            drain_timeout: env_parse::<u64>("LOGZIO_DRAIN_TIMEOUT_SEC")?
                .map_or(defaults.drain_timeout, Duration::from_secs),
            file_system_full_percent_threshold: env_parse("LOGZIO_FS_FULL_PERCENT_THRESHOLD")?
                .unwrap_or(defaults.file_system_full_percent_threshold),
            buffer_dir: env::var("LOGZIO_BUFFER_DIR").ok().map(PathBuf::from),
            socket_timeout: env_parse::<u64>("LOGZIO_SOCKET_TIMEOUT_MS")?
                .map_or(defaults.socket_timeout, Duration::from_millis),
            connect_timeout: env_parse::<u64>("LOGZIO_CONNECT_TIMEOUT_MS")?
                .map_or(defaults.connect_timeout, Duration::from_millis),
            debug: env_parse("LOGZIO_DEBUG")?.unwrap_or(defaults.debug),
            add_hostname: env_parse("LOGZIO_ADD_HOSTNAME")?.unwrap_or(defaults.add_hostname),
            additional_fields,
            gc_persisted_queue_files_interval: env_parse::<u64>("LOGZIO_GC_INTERVAL_SEC")?
                .map_or(defaults.gc_persisted_queue_files_interval, Duration::from_secs),
            level: env_parse("LOGZIO_LEVEL")?.unwrap_or(defaults.level),
            compress_requests: env_parse("LOGZIO_COMPRESS_REQUESTS")?
                .unwrap_or(defaults.compress_requests),
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Replaces the additional fields with those parsed from `key=value;key2=value2`.
    pub fn with_additional_fields(mut self, raw: &str) -> Result<Self, ShipperError> {
        self.additional_fields = parse_additional_fields(raw)?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ShipperError> {
        let threshold = self.file_system_full_percent_threshold;
        if !(1..=100).contains(&threshold) && threshold != FS_THRESHOLD_DISABLED {
            return Err(ShipperError::Config(format!(
                "file_system_full_percent_threshold should be a number between 1 and 100, or -1, got {threshold}"
            )));
        }

        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| ShipperError::Config(format!("Invalid url '{}': {e}", self.url)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ShipperError::Config(format!(
                "Unsupported url scheme '{}', expected http or https",
                url.scheme()
            )));
        }

        if self.token.trim().is_empty() {
            return Err(ShipperError::Config("token cannot be empty".to_string()));
        }

        if self.log_type.trim().is_empty()
            || self.log_type.contains(['/', '\\'])
            || self.log_type == "."
            || self.log_type == ".."
        {
            return Err(ShipperError::Config(format!(
                "Invalid log type '{}', it must be a non-empty name without path separators",
                self.log_type
            )));
        }

        let durations = [
            ("drain_interval", self.drain_interval),
            ("drain_timeout", self.drain_timeout),
            ("socket_timeout", self.socket_timeout),
            ("connect_timeout", self.connect_timeout),
            (
                "gc_persisted_queue_files_interval",
                self.gc_persisted_queue_files_interval,
            ),
            ("retry_initial_backoff", self.retry_initial_backoff),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ShipperError::Config(format!("{name} must be greater than 0")));
            }
        }

        if self.retry_initial_backoff > self.retry_max_backoff {
            return Err(ShipperError::Config(
                "retry_initial_backoff cannot be greater than retry_max_backoff".to_string(),
            ));
        }

        if self.batch_size_threshold_bytes == 0 || self.segment_max_bytes == 0 {
            return Err(ShipperError::Config(
                "batch_size_threshold_bytes and segment_max_bytes must be greater than 0"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Root of the buffer, before the type subdirectory.
    pub fn buffer_root(&self) -> PathBuf {
        self.buffer_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join(DEFAULT_BUFFER_DIR_NAME))
    }

    /// Directory holding the queue of this log type.
    pub fn queue_dir(&self) -> PathBuf {
        self.buffer_root().join(&self.log_type)
    }

    /// Returns the immutable snapshot used by the running pipeline.
    ///
    /// `$NAME` references in `url`, `token` and additional field values are
    /// resolved against the environment, reserved additional field names are
    /// dropped.
    #[must_use]
    pub fn resolved(&self, status: &Status) -> Self {
        let mut additional_fields = Vec::with_capacity(self.additional_fields.len());
        for (key, value) in &self.additional_fields {
            if is_reserved_field(key) {
                status.warning(&format!(
                    "The field name '{key}' defined in additional fields can't be used since it's a reserved field name. This field will not be added to the outgoing log messages"
                ));
                continue;
            }
            match resolve_env_reference(value) {
                Some(resolved) => additional_fields.push((key.clone(), resolved)),
                None => status.warning(&format!(
                    "The environment variable referenced by additional field '{key}' is not set, the field will not be added"
                )),
            }
        }
        if !self.additional_fields.is_empty() {
            status.info(&format!(
                "The additional fields that would be added: {additional_fields:?}"
            ));
        }

        Self {
            url: resolve_env_reference(&self.url).unwrap_or_default(),
            token: resolve_env_reference(&self.token).unwrap_or_default(),
            additional_fields,
            ..self.clone()
        }
    }
}

/// Resolves a `$NAME` reference against the process environment.
///
/// Values without the `$` prefix are returned unchanged; a reference to an
/// unset variable resolves to `None`.
#[must_use]
pub fn resolve_env_reference(value: &str) -> Option<String> {
    match value.strip_prefix('$') {
        Some(name) => env::var(name).ok(),
        None => Some(value.to_string()),
    }
}

/// Parses `key=value` pairs separated by `;`. Empty segments are ignored and
/// values may contain `=`.
pub fn parse_additional_fields(raw: &str) -> Result<Vec<(String, String)>, ShipperError> {
    let mut fields = Vec::new();
    for pair in raw.split(';').filter(|p| !p.trim().is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ShipperError::Config(format!(
                "Additional field '{pair}' is not in key=value format"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ShipperError::Config(format!(
                "Additional field '{pair}' has an empty name"
            )));
        }
        fields.push((key.to_string(), value.to_string()));
    }
    Ok(fields)
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ShipperError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ShipperError::Config(format!("Invalid value '{raw}' for {name}"))),
        Err(_) => Ok(None),
    }
}
