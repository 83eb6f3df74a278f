//! Per-connection session: read requests, hold them until due, write them back.
//!
//! # Architecture
//!
//! ```text
//!   socket read half                         socket write half
//!        │                                          ▲
//!        ▼                                          │ one frame in flight
//!   ReadState machine ──admit──▶ pending map ──▶ write queue (FIFO)
//!   (header → payload)               │                ▲
//!                                    ▼                │ Matured { id, token }
//!                               Scheduler ───── timer tasks (one per request)
//! ```
//!
//! A session is a single task.  Its `select!` loop multiplexes four event
//! sources: bytes arriving on the socket, timer maturity events, progress of
//! the one in-flight response write, and the frame-timeout deadline.  Both
//! socket operations used in the loop (`read_buf`, `write`) are cancel-safe,
//! so a branch losing the race never loses bytes.
//!
//! Reads never wait on timers: new requests are accepted while earlier ones
//! are still pending or being written.  Responses go out in maturity order,
//! one frame at a time, so frames from different timers never interleave.
//!
//! When the session ends (peer close, protocol or transport error) every
//! outstanding timer is cancelled and pending requests are dropped without a
//! response.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::codec::{RequestHeader, Response, HEADER_LEN};
use crate::config::SessionConfig;
use crate::error::{ProtocolError, Rejection, SessionError};
use crate::timer::{Clock, Matured, Scheduler, TimerSet};

/// Identifier used in logs to tell sessions apart.
pub type SessionId = u64;

/// Spare read capacity kept available in the inbound buffer.
const READ_CHUNK: usize = 4096;

// ---------------------------------------------------------------------------
// State types
// ---------------------------------------------------------------------------

/// Position of the read path within the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Waiting for the next 16-byte request header.
    AwaitingHeader,
    /// Header decoded; waiting for `header.cookie_size` payload bytes.
    ///
    /// `admitted` is `false` for a rejected request, whose payload is read
    /// and thrown away so the stream stays in sync.
    AwaitingPayload {
        header: RequestHeader,
        admitted: bool,
    },
}

/// Lifecycle of one request inside its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Header accepted, cookie still arriving.
    Receiving,
    /// Cookie complete, timer armed.
    Pending,
    /// Timer fired; queued for (or in the middle of) its write.
    Matured,
}

#[derive(Debug)]
struct Entry {
    due_time: u64,
    cookie: Bytes,
    phase: Phase,
}

/// Response frame currently being written.
#[derive(Debug)]
struct Outbound {
    id: u32,
    frame: Bytes,
    written: usize,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Requests admitted into the pending set.
    pub accepted: u64,
    /// Requests refused because their id was already pending.
    pub duplicates: u64,
    /// Requests refused because the pending set was full.
    pub over_capacity: u64,
    /// Responses fully written to the socket.
    pub written: u64,
    /// Timers cancelled at teardown.
    pub timers_cancelled: u64,
    /// Requests dropped at teardown without a response.
    pub discarded: u64,
}

/// Outcome of [`Session::run`].
#[derive(Debug)]
pub struct SessionReport {
    pub id: SessionId,
    pub stats: SessionStats,
    /// `None` when the peer closed the connection.
    pub error: Option<SessionError>,
}

// ---------------------------------------------------------------------------
// SessionState: everything except the socket
// ---------------------------------------------------------------------------

struct SessionState {
    id: SessionId,
    config: SessionConfig,
    read_state: ReadState,
    inbound: BytesMut,
    pending: HashMap<u32, Entry>,
    timers: TimerSet,
    scheduler: Scheduler,
    write_queue: VecDeque<u32>,
    in_flight: Option<Outbound>,
    stats: SessionStats,
}

impl SessionState {
    /// True while a frame has started arriving but is not complete.
    fn mid_frame(&self) -> bool {
        !(self.read_state == ReadState::AwaitingHeader && self.inbound.is_empty())
    }

    /// Consume every complete header and payload sitting in `inbound`.
    ///
    /// Returns the number of frames completed.
    fn drain_inbound(&mut self) -> Result<usize, ProtocolError> {
        let mut completed = 0;
        loop {
            match self.read_state {
                ReadState::AwaitingHeader => {
                    if self.inbound.len() < HEADER_LEN {
                        break;
                    }
                    let header = RequestHeader::decode(&self.inbound, self.config.max_cookie_size)?;
                    let _ = self.inbound.split_to(HEADER_LEN);
                    let admitted = match self.admit(&header) {
                        Ok(()) => true,
                        Err(rejection) => {
                            log::warn!("[session {}] {rejection}", self.id);
                            false
                        }
                    };
                    self.read_state = ReadState::AwaitingPayload { header, admitted };
                }
                ReadState::AwaitingPayload { header, admitted } => {
                    let size = header.cookie_size as usize;
                    if self.inbound.len() < size {
                        // Make room for the whole cookie in one go.
                        self.inbound.reserve(size - self.inbound.len());
                        break;
                    }
                    let cookie = self.inbound.split_to(size).freeze();
                    self.read_state = ReadState::AwaitingHeader;
                    completed += 1;
                    if admitted {
                        self.arm(header.id, cookie);
                    }
                }
            }
        }
        if self.inbound.capacity() - self.inbound.len() < READ_CHUNK {
            self.inbound.reserve(READ_CHUNK);
        }
        Ok(completed)
    }

    /// Register a freshly decoded header as a pending request.
    ///
    /// The first registration of an id wins; a duplicate is refused and the
    /// original stays pending.
    fn admit(&mut self, header: &RequestHeader) -> Result<(), Rejection> {
        if self.pending.contains_key(&header.id) {
            self.stats.duplicates += 1;
            return Err(Rejection::DuplicateRequest { id: header.id });
        }
        if self.pending.len() >= self.config.max_timers {
            self.stats.over_capacity += 1;
            return Err(Rejection::CapacityExceeded {
                id: header.id,
                limit: self.config.max_timers,
            });
        }
        self.pending.insert(
            header.id,
            Entry {
                due_time: header.due_time,
                cookie: Bytes::new(),
                phase: Phase::Receiving,
            },
        );
        self.stats.accepted += 1;
        log::debug!(
            "[session {}] request {} registered, due {} ({} byte cookie)",
            self.id,
            header.id,
            header.due_time,
            header.cookie_size
        );
        Ok(())
    }

    /// Attach the cookie and start the request's timer.
    fn arm(&mut self, id: u32, cookie: Bytes) {
        let Some(entry) = self.pending.get_mut(&id) else {
            return;
        };
        entry.cookie = cookie;
        entry.phase = Phase::Pending;
        let handle = self.scheduler.schedule(id, entry.due_time);
        self.timers.insert(handle);
    }

    /// A timer fired: queue its request for writing.
    fn on_matured(&mut self, event: Matured) {
        if !self.timers.complete(&event) {
            log::trace!("[session {}] ignoring stale timer for {}", self.id, event.id);
            return;
        }
        if let Some(entry) = self.pending.get_mut(&event.id) {
            entry.phase = Phase::Matured;
            self.write_queue.push_back(event.id);
            log::debug!("[session {}] request {} matured", self.id, event.id);
        }
        self.start_next_write();
    }

    /// Move the head of the write queue into the in-flight slot, if free.
    fn start_next_write(&mut self) {
        while self.in_flight.is_none() {
            let Some(id) = self.write_queue.pop_front() else {
                return;
            };
            if let Some(entry) = self.pending.get(&id).filter(|e| e.phase == Phase::Matured) {
                let frame = Response {
                    id,
                    cookie: entry.cookie.clone(),
                }
                .encode();
                self.in_flight = Some(Outbound {
                    id,
                    frame,
                    written: 0,
                });
            }
        }
    }

    /// Account for `n` bytes of the in-flight frame reaching the socket.
    fn on_written(&mut self, n: usize) {
        let Some(out) = self.in_flight.as_mut() else {
            return;
        };
        out.written += n;
        if out.written < out.frame.len() {
            return;
        }
        let id = out.id;
        self.in_flight = None;
        self.pending.remove(&id);
        self.stats.written += 1;
        log::debug!("[session {}] response {} written", self.id, id);
        self.start_next_write();
    }

    /// Cancel all timers and drop every request that never got a response.
    fn teardown(&mut self) {
        self.stats.timers_cancelled += self.timers.cancel_all() as u64;
        self.stats.discarded += self.pending.len() as u64;
        self.pending.clear();
        self.write_queue.clear();
        self.in_flight = None;
        self.inbound.clear();
        self.read_state = ReadState::AwaitingHeader;
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One accepted connection.
pub struct Session<S> {
    id: SessionId,
    stream: S,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(id: SessionId, stream: S, config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            id,
            stream,
            config,
            clock,
        }
    }

    /// Serve the connection until it closes or fails.
    ///
    /// Every timer owned by the session has been cancelled by the time this
    /// returns.
    pub async fn run(self) -> SessionReport {
        let Session {
            id,
            stream,
            config,
            clock,
        } = self;

        let frame_timeout = config.frame_timeout;
        let (scheduler, mut timer_rx) =
            Scheduler::new(clock, config.recheck_interval, config.max_timers);
        let mut state = SessionState {
            id,
            config,
            read_state: ReadState::AwaitingHeader,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            pending: HashMap::new(),
            timers: TimerSet::new(),
            scheduler,
            write_queue: VecDeque::new(),
            in_flight: None,
            stats: SessionStats::default(),
        };

        let (mut reader, mut writer) = tokio::io::split(stream);

        // Disarmed deadlines sit far in the future; `deadline_armed` guards
        // the branch so they never fire.
        let far_future = Duration::from_secs(365 * 24 * 3600);
        let deadline = tokio::time::sleep(far_future);
        tokio::pin!(deadline);
        let mut deadline_armed = false;

        let error: Option<SessionError> = loop {
            tokio::select! {
                // ── Branch 1: request bytes ──────────────────────────────────
                read = reader.read_buf(&mut state.inbound) => {
                    match read {
                        Ok(0) => {
                            log::debug!("[session {id}] peer closed");
                            break None;
                        }
                        Ok(_) => {
                            let completed = match state.drain_inbound() {
                                Ok(n) => n,
                                Err(e) => break Some(SessionError::from(e)),
                            };
                            if !state.mid_frame() {
                                deadline_armed = false;
                            } else if !deadline_armed || completed > 0 {
                                let now = Instant::now();
                                let at = now
                                    .checked_add(frame_timeout)
                                    .unwrap_or_else(|| now + far_future);
                                deadline.as_mut().reset(at);
                                deadline_armed = true;
                            }
                        }
                        Err(e) => break Some(SessionError::Transport(e)),
                    }
                }

                // ── Branch 2: a timer matured ────────────────────────────────
                Some(event) = timer_rx.recv() => {
                    state.on_matured(event);
                }

                // ── Branch 3: progress on the in-flight response ─────────────
                written = write_chunk(&mut writer, state.in_flight.as_ref()) => {
                    match written {
                        Ok(0) => {
                            break Some(SessionError::Transport(io::ErrorKind::WriteZero.into()));
                        }
                        Ok(n) => state.on_written(n),
                        Err(e) => break Some(SessionError::Transport(e)),
                    }
                }

                // ── Branch 4: a started frame stalled ────────────────────────
                _ = &mut deadline, if deadline_armed => {
                    break Some(ProtocolError::FrameTimeout { waited: frame_timeout }.into());
                }
            }
        };

        state.teardown();
        drop(timer_rx);

        match &error {
            None => log::info!("[session {id}] closed: {:?}", state.stats),
            Some(e) => log::warn!("[session {id}] closed on {e}: {:?}", state.stats),
        }

        SessionReport {
            id,
            stats: state.stats,
            error,
        }
    }
}

/// Write as much of the in-flight frame as the socket takes in one call.
///
/// With nothing in flight the future never completes, which keeps its
/// `select!` branch idle.
async fn write_chunk<W>(writer: &mut W, out: Option<&Outbound>) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    match out {
        Some(out) => writer.write(&out.frame[out.written..]).await,
        None => std::future::pending().await,
    }
}
