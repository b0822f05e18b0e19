//! Environment-variable configuration, read once at `initialize()`.

use std::env;
use std::time::Duration;

/// Sunshine's default base TCP port; every other service port is an offset
/// from it (see `net`).
pub const DEFAULT_SUNSHINE_PORT: u16 = 47989;

const DEFAULT_RECONNECT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct StarbeamConfig {
    /// Master switch; the agent refuses to start when unset.
    pub enabled: bool,
    /// Relay control-plane URL, `ws://` or `wss://`.
    pub server_url: String,
    /// Shared secret presented at registration.
    pub auth_key: String,
    /// Durable host id from a previous registration; empty on first run.
    pub host_id: String,
    /// Backoff between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Restores the legacy trust-anything TLS mode for development relays.
    pub tls_accept_invalid: bool,
    /// Base TCP port of the co-located Sunshine instance.
    pub sunshine_port: u16,
    /// Display hostname sent at registration; empty means the OS hostname.
    pub sunshine_name: String,
}

impl StarbeamConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("STARBEAM_ENABLED"),
            server_url: env_string("STARBEAM_SERVER_URL"),
            auth_key: env_string("STARBEAM_AUTH_KEY"),
            host_id: env_string("STARBEAM_HOST_ID"),
            reconnect_interval: Duration::from_secs(
                env_parse("STARBEAM_RECONNECT_INTERVAL").unwrap_or(DEFAULT_RECONNECT_SECS),
            ),
            tls_accept_invalid: env_flag("STARBEAM_TLS_ACCEPT_INVALID"),
            sunshine_port: env_parse("SUNSHINE_PORT").unwrap_or(DEFAULT_SUNSHINE_PORT),
            sunshine_name: env_string("SUNSHINE_NAME"),
        }
    }
}

fn env_string(key: &str) -> String {
    env::var(key).unwrap_or_default()
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}
