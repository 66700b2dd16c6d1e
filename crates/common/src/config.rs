use std::env;

use serde::{Deserialize, Serialize};

/// Transport settings used when the relay opens channels to foremen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Connect timeout for a new foreman channel.
    pub connect_timeout_ms: u64,
    /// TCP keepalive for foreman channels. `0` disables it.
    pub tcp_keepalive_ms: u64,
    /// HTTP/2 keepalive ping interval. `0` disables pings.
    pub http2_keepalive_interval_ms: u64,
    /// How long to wait for a keepalive ping response.
    pub keepalive_timeout_ms: u64,
    /// Max concurrent requests per channel. `0` means unlimited.
    pub concurrency_limit_per_channel: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            tcp_keepalive_ms: 60_000,
            http2_keepalive_interval_ms: 30_000,
            keepalive_timeout_ms: 20_000,
            concurrency_limit_per_channel: 0,
        }
    }
}

impl RelayConfig {
    /// Build config from `FQR_*` environment variables, falling back to
    /// defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout_ms: env_u64_or_default(
                "FQR_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout_ms,
            ),
            tcp_keepalive_ms: env_u64_or_default("FQR_TCP_KEEPALIVE_MS", defaults.tcp_keepalive_ms),
            http2_keepalive_interval_ms: env_u64_or_default(
                "FQR_HTTP2_KEEPALIVE_INTERVAL_MS",
                defaults.http2_keepalive_interval_ms,
            ),
            keepalive_timeout_ms: env_u64_or_default(
                "FQR_KEEPALIVE_TIMEOUT_MS",
                defaults.keepalive_timeout_ms,
            ),
            concurrency_limit_per_channel: env_usize_or_default(
                "FQR_CONCURRENCY_LIMIT_PER_CHANNEL",
                defaults.concurrency_limit_per_channel,
            ),
        }
    }
}

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
