// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exclusive ownership of a queue directory.
//!
//! An advisory `flock(2)` on `<dir>/.lock`, held for as long as the queue is
//! open. It excludes other processes and other queues of this process alike,
//! since each open gets its own file description.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::error::QueueError;

pub(crate) const LOCK_FILE_NAME: &str = ".lock";

pub(crate) struct DirLock {
    path: PathBuf,
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<std::fs::File>,
}

impl std::fmt::Debug for DirLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirLock").field("path", &self.path).finish()
    }
}

impl DirLock {
    /// Locks `dir`, failing with [`QueueError::Locked`] if it is owned
    /// elsewhere.
    #[cfg(unix)]
    pub fn acquire(dir: &Path) -> Result<Self, QueueError> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Self {
                path,
                _flock: flock,
            }),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                Err(QueueError::Locked(dir.to_path_buf()))
            }
            Err((_, errno)) => Err(QueueError::Io(std::io::Error::from(errno))),
        }
    }

    #[cfg(not(unix))]
    pub fn acquire(dir: &Path) -> Result<Self, QueueError> {
        let path = dir.join(LOCK_FILE_NAME);
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        Ok(Self { path })
    }
}
