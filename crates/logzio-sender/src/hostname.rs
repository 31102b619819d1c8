// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname detection for the `hostname` document field.

use std::io;
use std::sync::Arc;

/// Field added to every document when `add_hostname` is enabled.
pub const HOSTNAME_FIELD: &str = "hostname";

/// Resolves the local host name. Swappable so hosts and tests can provide
/// their own lookup.
pub type HostnameResolver = Arc<dyn Fn() -> io::Result<String> + Send + Sync>;

/// System hostname via `gethostname(2)`.
#[cfg(unix)]
pub fn resolve_hostname() -> io::Result<String> {
    let hostname = nix::unistd::gethostname().map_err(io::Error::from)?;
    match hostname.to_str() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        Some(_) => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "hostname is empty",
        )),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "hostname is not valid UTF-8",
        )),
    }
}

#[cfg(not(unix))]
pub fn resolve_hostname() -> io::Result<String> {
    match std::env::var("COMPUTERNAME") {
        Ok(name) if !name.is_empty() => Ok(name),
        _ => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "Could not determine hostname",
        )),
    }
}

pub fn system_resolver() -> HostnameResolver {
    Arc::new(resolve_hostname)
}
