// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filesystem usage of the buffer directory.
//!
//! - **Unix/Linux/macOS**: `nix::sys::statfs`
//! - **Windows**: not supported, the probe returns an error and the queue
//!   treats the check as inconclusive

#![allow(clippy::module_name_repetitions)]

use std::io;
use std::path::Path;

/// Reports how full the filesystem holding a path is.
pub trait DiskUsageProbe: Send + Sync {
    /// Used fraction of the filesystem in `[0.0, 1.0]`.
    fn usage_fraction(&self, path: &Path) -> io::Result<f64>;
}

/// Probe backed by the `statfs(2)` system call.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatfsProbe;

impl DiskUsageProbe for StatfsProbe {
    fn usage_fraction(&self, path: &Path) -> io::Result<f64> {
        let (_, blocks, bavail) = statfs_info(path)?;
        if blocks <= 0.0 {
            return Ok(0.0);
        }
        Ok(((blocks - bavail) / blocks).clamp(0.0, 1.0))
    }
}

/// Returns block size, total blocks and blocks available to unprivileged users.
#[cfg(not(target_os = "windows"))]
#[allow(clippy::cast_lossless, clippy::cast_precision_loss)]
fn statfs_info(path: &Path) -> io::Result<(f64, f64, f64)> {
    let stat = nix::sys::statfs::statfs(path).map_err(io::Error::from)?;
    Ok((
        stat.block_size() as f64,
        stat.blocks() as f64,
        stat.blocks_available() as f64,
    ))
}

#[cfg(target_os = "windows")]
fn statfs_info(_path: &Path) -> io::Result<(f64, f64, f64)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Cannot get filesystem usage on Windows",
    ))
}
