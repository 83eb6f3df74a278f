//! `timer-server`: a "wake me later" service over TCP.
//!
//! A client sends a request carrying a Unix due time and an opaque cookie;
//! the server holds it until the due time has passed and then writes the
//! cookie back on the same connection.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────┐  accept (≤ max_connections)  ┌─────────────────────────┐
//!  │  Server   │─────────────────────────────▶│  Session (one per conn) │
//!  └───────────┘   permit released on close   │  read → pending → write │
//!                                             └──────┬──────────▲───────┘
//!                                          schedule  │          │ Matured
//!                                             ┌──────▼──────────┴───────┐
//!                                             │  Scheduler / timer tasks │
//!                                             └──────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`codec`]:   wire format (serialise / deserialise)
//! - [`timer`]:   per-request timers with wall-clock re-checks
//! - [`session`]: per-connection state machine and single write path
//! - [`server`]:  listener and admission control
//! - [`client`]:  protocol peer used by the CLI and tests
//! - [`config`]:  tunables
//! - [`error`]:   error taxonomy

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod timer;

pub use client::Client;
pub use codec::{Request, RequestHeader, Response};
pub use config::{ServerConfig, SessionConfig};
pub use error::{ClientError, ProtocolError, Rejection, ServerError, SessionError};
pub use server::{AdmissionControl, Server};
pub use session::{Session, SessionReport, SessionStats};
pub use timer::{Clock, MonotonicClock, SystemClock};
