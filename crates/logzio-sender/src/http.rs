// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client used by the bulk sender.
//!
//! - **Timeouts**: connect timeout and whole-request (socket) timeout from config
//! - **Connection pooling**: idle timeout and TCP keep-alive
//! - **Proxy**: `HTTPS_PROXY` is honored by reqwest's system proxy detection

use core::time::Duration;
use tracing::error;

use crate::config::SenderConfig;

/// Creates the client, falling back to reqwest defaults if the configured
/// builder cannot be constructed.
#[must_use]
pub fn get_client(config: &SenderConfig) -> reqwest::Client {
    match build_client(config) {
        Ok(client) => client,
        Err(e) => {
            error!("LOGS | Failed to build HTTP client: {e}, using reqwest defaults");
            reqwest::Client::new()
        }
    }
}

fn build_client(config: &SenderConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.socket_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)))
        .build()
}
