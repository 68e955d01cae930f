//! Registry configuration

use std::time::Duration;

/// Default total receive-buffer budget shared by all open sockets (8 MiB)
pub const DEFAULT_SOCKET_BUFFER_TOTAL: usize = 0x80_0000;

/// Default per-socket receive-buffer floor (128 KiB)
pub const DEFAULT_SOCKET_BUFFER_MINIMUM: usize = 0x2_0000;

/// Default reader-thread poll timeout
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Environment variable overriding the total receive-buffer budget
pub const SOCKET_BUFFER_TOTAL_ENV: &str = "SK_SOCKETBUFFER_TOTAL";

/// Environment variable overriding the per-socket floor
pub const SOCKET_BUFFER_MINIMUM_ENV: &str = "SK_SOCKETBUFFER_MINIMUM";

/// Configuration for a [`SourceRegistry`](super::SourceRegistry)
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Receive-buffer bytes divided among every open socket
    pub socket_buffer_total: usize,

    /// Smallest receive buffer any socket is given
    pub socket_buffer_minimum: usize,

    /// How long a reader thread waits for readiness before re-checking
    /// its stop flag
    pub poll_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            socket_buffer_total: DEFAULT_SOCKET_BUFFER_TOTAL,
            socket_buffer_minimum: DEFAULT_SOCKET_BUFFER_MINIMUM,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl RegistryConfig {
    /// Defaults, with socket-buffer values overridden from the environment
    pub fn from_env() -> Self {
        Self::default().apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(total) = lookup(SOCKET_BUFFER_TOTAL_ENV).and_then(|v| parse_c_integer(&v)) {
            self.socket_buffer_total = total;
        }
        if let Some(min) = lookup(SOCKET_BUFFER_MINIMUM_ENV).and_then(|v| parse_c_integer(&v)) {
            self.socket_buffer_minimum = min;
        }
        self
    }

    /// Set the total receive-buffer budget
    pub fn socket_buffer_total(mut self, bytes: usize) -> Self {
        self.socket_buffer_total = bytes;
        self
    }

    /// Set the per-socket receive-buffer floor
    pub fn socket_buffer_minimum(mut self, bytes: usize) -> Self {
        self.socket_buffer_minimum = bytes;
        self
    }

    /// Set the reader poll timeout
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Receive-buffer size for each socket when `open_sockets` are open
    pub fn socket_buffer_size(&self, open_sockets: usize) -> usize {
        if open_sockets == 0 {
            return self.socket_buffer_total;
        }
        (self.socket_buffer_total / open_sockets).max(self.socket_buffer_minimum)
    }
}

/// Parse an integer the way `strtol(s, &end, 0)` does when the whole
/// string must be consumed: decimal, `0x` hex, or leading-zero octal
///
/// Negative values are rejected; values above `i32::MAX` are clamped.
fn parse_c_integer(value: &str) -> Option<usize> {
    let value = value.trim_start();
    let value = value.strip_prefix('+').unwrap_or(value);

    let parsed = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16)
    } else if value.len() > 1 && value.starts_with('0') {
        u64::from_str_radix(&value[1..], 8)
    } else {
        value.parse::<u64>()
    };

    match parsed {
        Ok(v) => Some(v.min(i32::MAX as u64) as usize),
        Err(e) if *e.kind() == std::num::IntErrorKind::PosOverflow => Some(i32::MAX as usize),
        Err(_) => None,
    }
}
