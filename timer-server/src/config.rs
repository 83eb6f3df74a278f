//! Tunables for the listener and for each session.
//!
//! The binary fills these from command-line flags; tests build them directly.

use std::net::SocketAddr;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_COOKIE_SIZE;

/// Default cap on concurrently open connections.
pub const MAX_CONNECTIONS: usize = 10;

/// Default cap on concurrently pending requests per connection.
pub const MAX_TIMERS: usize = 5;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8088;

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Requests beyond this many pending ones are rejected.
    pub max_timers: usize,
    /// Largest cookie accepted; a bigger declared size closes the connection.
    pub max_cookie_size: u32,
    /// Once the first byte of a frame arrives, the rest must follow within
    /// this long.  This budgets the whole frame rather than the gap between
    /// reads: a cookie still trickling in when it runs out is cut off.
    /// Idle time between frames is not limited.
    pub frame_timeout: Duration,
    /// Longest single sleep of a timer before it re-reads the wall clock.
    pub recheck_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_timers: MAX_TIMERS,
            max_cookie_size: DEFAULT_MAX_COOKIE_SIZE,
            frame_timeout: Duration::from_secs(30),
            recheck_interval: Duration::from_secs(60),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub max_connections: usize,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: MAX_CONNECTIONS,
            session: SessionConfig::default(),
        }
    }
}
