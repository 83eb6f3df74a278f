//! Error taxonomy.
//!
//! Errors are split by blast radius:
//! - [`ProtocolError`] and [`SessionError`] end one session and nothing else.
//! - [`Rejection`] drops a single request; the session keeps running.
//! - [`ServerError`] is fatal and only raised at startup.
//! - [`ClientError`] belongs to the client peer in [`crate::client`].

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// The byte stream violated the framing rules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared cookie length is above the configured safety ceiling.
    #[error("request {id}: cookie of {size} bytes exceeds the {max} byte limit")]
    CookieTooLarge { id: u32, size: u32, max: u32 },

    /// Fewer bytes than a complete frame requires.
    #[error("short read: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// A frame started arriving but did not complete in time.
    #[error("frame not completed within {waited:?}")]
    FrameTimeout { waited: Duration },
}

/// Why a single request was refused without closing its session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("request {id} is already pending on this connection")]
    DuplicateRequest { id: u32 },

    #[error("request {id} refused: {limit} requests already pending")]
    CapacityExceeded { id: u32, limit: usize },
}

/// Conditions that tear down a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Fatal listener errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Errors seen by the client peer.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}
