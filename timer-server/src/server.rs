//! TCP listener with admission control.
//!
//! [`Server`] owns the listening socket and the only piece of state shared
//! across connections: the [`AdmissionControl`] counting active sessions.
//! A [`Slot`] (semaphore permit) is reserved *before* each accept, so once
//! `max_connections` sessions are live no accept is outstanding and further
//! clients wait in the kernel backlog.  Each session task holds its slot
//! until its timers are cancelled; dropping it reopens the place.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::session::{Session, SessionId};
use crate::timer::{Clock, SystemClock};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// AdmissionControl
// ---------------------------------------------------------------------------

/// Caps the number of concurrently active sessions.
///
/// Cloning yields another handle to the same counter.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    limit: usize,
}

impl AdmissionControl {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            active: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Sessions currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// True when every slot is taken, counting the one reserved for an
    /// outstanding accept.
    pub fn is_full(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Wait for a free slot.  Returns `None` once admission has been closed.
    pub async fn admit(&self) -> Option<Slot> {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        Some(Slot {
            _permit: permit,
            active: Arc::clone(&self.active),
            occupied: false,
        })
    }

    /// Refuse all future admissions; sessions already admitted are unaffected.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// A reserved place under the connection cap.
///
/// Reserved before an accept is issued; counted as active once a session
/// occupies it.  Dropping it frees the place.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
    occupied: bool,
}

impl Slot {
    fn occupy(&mut self) {
        if !self.occupied {
            self.occupied = true;
            self.active.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.occupied {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The listening side of the service.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    admission: AdmissionControl,
    clock: Arc<dyn Clock>,
    next_session: SessionId,
}

impl Server {
    /// Bind the listening socket described by `config`.
    ///
    /// Passing port 0 lets the OS choose; see [`Server::local_addr`].
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: config.bind,
            source,
        })?;
        log::info!(
            "[server] listening on {local_addr} (max {} connections, {} timers each)",
            config.max_connections,
            config.session.max_timers
        );
        Ok(Self {
            listener,
            local_addr,
            admission: AdmissionControl::new(config.max_connections),
            config,
            clock: Arc::new(SystemClock),
            next_session: 1,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle onto the active-session counter, usable after `run` consumes
    /// the server.
    pub fn admission(&self) -> AdmissionControl {
        self.admission.clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.admission.active()
    }

    /// Accept connections forever.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.  Closing admission
    /// through another handle also stops the loop, at its next wait for a
    /// free slot.
    ///
    /// Admission is closed on return.  Sessions already running are left to
    /// finish on their own.
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let slot = tokio::select! {
                slot = self.admission.admit() => slot,
                _ = &mut shutdown => break,
            };
            let Some(slot) = slot else {
                log::info!("[server] admission closed");
                break;
            };

            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = &mut shutdown => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    self.spawn_session(stream, peer, slot);
                    if self.admission.is_full() {
                        log::info!(
                            "[server] {} sessions active; accepts paused",
                            self.admission.limit()
                        );
                    }
                }
                Err(e) => {
                    // The slot is released on drop.
                    log::error!("[server] accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        self.admission.close();
        log::info!("[server] no longer accepting on {}", self.local_addr);
    }

    fn spawn_session(&mut self, stream: TcpStream, peer: SocketAddr, mut slot: Slot) {
        let id = self.next_session;
        self.next_session += 1;

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[session {id}] cannot set TCP_NODELAY: {e}");
        }
        slot.occupy();
        log::info!(
            "[server] session {id} accepted from {peer} ({} active)",
            self.admission.active()
        );

        let session = Session::new(
            id,
            stream,
            self.config.session.clone(),
            Arc::clone(&self.clock),
        );
        let admission = self.admission.clone();
        tokio::spawn(async move {
            let report = session.run().await;
            // Timers are cancelled by now; only then free the slot.
            let was_full = admission.active() == admission.limit();
            drop(slot);
            if was_full {
                log::info!("[server] session {} ended; accepts resumed", report.id);
            }
        });
    }
}
