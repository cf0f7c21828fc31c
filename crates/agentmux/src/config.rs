//! Tunables for a multiplexing context.
//!
//! Deserializable so binaries can embed it as a `[forward]` section of their
//! TOML config; every field falls back to its default.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    /// Grace period `terminate()` gives connections to finish their close
    /// handshake before forcing them closed.
    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,
    /// Remote-initiated connections waiting to be picked up by the application.
    #[serde(default = "default_accept_queue_depth")]
    pub accept_queue_depth: usize,
    /// Inbound data chunks buffered per connection before the dispatch loop
    /// blocks.
    #[serde(default = "default_buffer_depth")]
    pub buffer_depth: usize,
    /// Read size used by [`relay`](crate::relay::relay).
    #[serde(default = "default_relay_chunk_size")]
    pub relay_chunk_size: usize,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            terminate_timeout_ms: default_terminate_timeout_ms(),
            accept_queue_depth: default_accept_queue_depth(),
            buffer_depth: default_buffer_depth(),
            relay_chunk_size: default_relay_chunk_size(),
        }
    }
}

impl ForwardConfig {
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

fn default_terminate_timeout_ms() -> u64 {
    5000
}
fn default_accept_queue_depth() -> usize {
    64
}
fn default_buffer_depth() -> usize {
    256
}
fn default_relay_chunk_size() -> usize {
    8192
}
