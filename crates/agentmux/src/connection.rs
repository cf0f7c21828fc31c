//! One logical connection carried over the shared transport.
//!
//! A [`Connection`] behaves like a private stream: `read` pulls bytes the
//! peer sent for this connection id, `write` pushes DATA packets. Its state
//! machine is driven by local calls (`accept`, `reject`, `close`,
//! `close_immediate`) and by the context's dispatch loop (SUCCESS, ERROR,
//! CLOSE_CONNECTION from the peer).
//!
//! ```text
//!            accept / SUCCESS            close
//! WaitInit ────────────────────▶ Started ──────▶ WaitClose
//!    │  │                           │                │
//!    │  └──────── close ────────────┼───────────────▶│
//!    │                              │                │ SUCCESS / ERROR /
//!    └── reject / ERROR / close_immediate ──────────▶ Closed
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use agentmux_core::{MuxError, MuxResult, NewConnectionPayload, Packet, PacketType};

use crate::context::Shared;

/// Invoked once when the connection reaches [`ConnectionState::Closed`].
///
/// Runs while the connection's state lock is held, so it must not call back
/// into the same connection.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Life-cycle state of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, waiting for the accepting side to answer.
    WaitInit,
    /// Data may flow in both directions.
    Started,
    /// Close requested locally, waiting for the peer to acknowledge.
    WaitClose,
    /// Terminal. Buffers are released and the id is gone from the table.
    Closed,
}

/// State guarded by the per-connection lock.
struct Inner {
    state: ConnectionState,
    /// Write end of the inbound buffer; `None` once the buffer is closed.
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    on_close: Option<CloseCallback>,
}

/// Read end of the inbound buffer, with leftovers from a partially consumed chunk.
struct InboundReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl InboundReader {
    async fn read(&mut self, buf: &mut [u8]) -> usize {
        // Drain leftover bytes from previous read
        if self.offset < self.pending.len() {
            let available = self.pending.len() - self.offset;
            let n = available.min(buf.len());
            buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
            self.offset += n;
            if self.offset >= self.pending.len() {
                self.pending.clear();
                self.offset = 0;
            }
            return n;
        }

        loop {
            match self.rx.recv().await {
                Some(data) if data.is_empty() => continue,
                Some(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.pending = data;
                        self.offset = n;
                    }
                    return n;
                }
                None => return 0, // Buffer closed = EOF
            }
        }
    }
}

/// A multiplexed logical connection.
pub struct Connection {
    id: u64,
    /// True when this side dialed the connection.
    initiator: bool,
    details: NewConnectionPayload,
    inner: Mutex<Inner>,
    /// Mirrors `inner.state`; every transition is published here so blocked
    /// writers and `wait_closed` wake up.
    state_tx: watch::Sender<ConnectionState>,
    reader: Mutex<InboundReader>,
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("initiator", &self.initiator)
            .field("state", &self.state())
            .field("details", &self.details)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        initiator: bool,
        details: NewConnectionPayload,
        on_close: Option<CloseCallback>,
        shared: Arc<Shared>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(shared.config.buffer_depth.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::WaitInit);
        Arc::new(Self {
            id,
            initiator,
            details,
            inner: Mutex::new(Inner {
                state: ConnectionState::WaitInit,
                inbound: Some(tx),
                on_close,
            }),
            state_tx,
            reader: Mutex::new(InboundReader {
                rx,
                pending: Vec::new(),
                offset: 0,
            }),
            shared,
        })
    }

    /// Connection id, unique within the session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this side created the connection.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Addresses and protocol the connection was opened with.
    pub fn details(&self) -> &NewConnectionPayload {
        &self.details
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Wait until the connection reaches [`ConnectionState::Closed`].
    pub async fn wait_closed(&self) {
        let mut watcher = self.state_tx.subscribe();
        // The sender lives in `self`, so the watch cannot be closed under us.
        let _ = watcher.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Read bytes the peer sent on this connection.
    ///
    /// Waits until data is available. Returns 0 once the connection's buffer
    /// has been closed and drained.
    pub async fn read(&self, buf: &mut [u8]) -> MuxResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        Ok(reader.read(buf).await)
    }

    /// Send bytes to the peer.
    ///
    /// Waits while the connection is still being set up. Fails with
    /// [`MuxError::ConnectionClosed`] once a close is under way.
    pub async fn write(&self, data: &[u8]) -> MuxResult<usize> {
        let mut watcher = self.state_tx.subscribe();
        loop {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnectionState::WaitInit => {
                    drop(inner);
                    let _ = watcher
                        .wait_for(|s| *s != ConnectionState::WaitInit)
                        .await;
                }
                ConnectionState::Started => {
                    let packet = Packet::with_payload(PacketType::Data, self.id, data.to_vec());
                    if let Err(e) = self.shared.send(&packet).await {
                        error!(connection_id = self.id, error = %e, "error writing data packet");
                        return Err(e);
                    }
                    return Ok(data.len());
                }
                ConnectionState::WaitClose | ConnectionState::Closed => {
                    inner.inbound = None;
                    return Err(MuxError::ConnectionClosed(self.id));
                }
            }
        }
    }

    /// Accept a connection the peer opened.
    pub async fn accept(&self) -> MuxResult<()> {
        let mut inner = self.inner.lock().await;
        self.check_answerable(&inner, "accept")?;
        self.set_state(&mut inner, ConnectionState::Started);
        // Still holding the lock: no local DATA may overtake the SUCCESS.
        self.shared
            .send(&Packet::new(PacketType::Success, self.id))
            .await
    }

    /// Refuse a connection the peer opened.
    pub async fn reject(&self) -> MuxResult<()> {
        let mut inner = self.inner.lock().await;
        self.check_answerable(&inner, "reject")?;
        self.finish(&mut inner).await;
        self.shared
            .send(&Packet::new(PacketType::Error, self.id))
            .await
    }

    /// Ask the peer to close the connection.
    ///
    /// The connection reaches [`ConnectionState::Closed`] once the peer
    /// acknowledges. Calling it again while closing, or after closing, is a
    /// no-op.
    pub async fn close(&self) -> MuxResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ConnectionState::WaitInit | ConnectionState::Started => {
                self.set_state(&mut inner, ConnectionState::WaitClose);
                drop(inner);
                self.shared
                    .send(&Packet::new(PacketType::CloseConnection, self.id))
                    .await
            }
            ConnectionState::WaitClose | ConnectionState::Closed => Ok(()),
        }
    }

    /// Force the connection into [`ConnectionState::Closed`] without talking
    /// to the peer.
    ///
    /// Runs the close callback, releases the buffers, and wakes everything
    /// waiting on this connection. Fails if the connection is already closed.
    pub async fn close_immediate(&self) -> MuxResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Closed {
            return Err(MuxError::InvalidState(format!(
                "connection {} is already closed",
                self.id
            )));
        }
        self.finish(&mut inner).await;
        Ok(())
    }

    // ── Dispatch-loop entry points ───────────────────────────────────

    /// Peer answered SUCCESS for this connection.
    pub(crate) async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ConnectionState::WaitInit => self.set_state(&mut inner, ConnectionState::Started),
            ConnectionState::WaitClose => self.finish(&mut inner).await,
            state => {
                warn!(connection_id = self.id, ?state, "received success packet for connection in non-wait state");
            }
        }
    }

    /// Peer answered ERROR for this connection.
    pub(crate) async fn on_remote_error(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Closed {
            self.finish(&mut inner).await;
        }
    }

    /// Queue a DATA payload for the local reader.
    ///
    /// Blocks while the buffer is full, unless the connection closes in the
    /// meantime.
    pub(crate) async fn push_data(&self, payload: Vec<u8>) {
        if payload.is_empty() {
            return;
        }
        let tx = {
            let inner = self.inner.lock().await;
            if inner.state != ConnectionState::Started {
                info!(connection_id = self.id, state = ?inner.state, "received data packet for a connection in a non-started state");
                return;
            }
            inner.inbound.clone()
        };
        let Some(tx) = tx else {
            warn!(connection_id = self.id, "inbound buffer closed, dropping data");
            return;
        };

        let len = payload.len();
        let mut watcher = self.state_tx.subscribe();
        let closed = async {
            let _ = watcher.wait_for(|s| *s == ConnectionState::Closed).await;
        };
        tokio::select! {
            result = tx.send(payload) => {
                if result.is_err() {
                    warn!(connection_id = self.id, len, "failed to write data packet to connection buffer");
                }
            }
            _ = closed => {
                debug!(connection_id = self.id, len, "connection closed while buffering data");
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    fn check_answerable(&self, inner: &Inner, op: &str) -> MuxResult<()> {
        if self.initiator {
            return Err(MuxError::InvalidState(format!(
                "cannot {op} connection {} that was initiated locally",
                self.id
            )));
        }
        if inner.state != ConnectionState::WaitInit {
            return Err(MuxError::InvalidState(format!(
                "cannot {op} connection {} in state {:?}",
                self.id, inner.state
            )));
        }
        Ok(())
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Transition into `Closed`. Caller has checked the state is not `Closed`.
    async fn finish(&self, inner: &mut Inner) {
        if let Some(callback) = inner.on_close.take() {
            callback();
        }
        inner.inbound = None;
        self.set_state(inner, ConnectionState::Closed);
        self.shared.release(self.id).await;
        debug!(connection_id = self.id, "connection closed");
    }
}
