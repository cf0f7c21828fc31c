//! The multiplexing context: one per pair of shared byte streams.
//!
//! `ForwardCtx` owns the single encode path to the peer, the table of live
//! logical connections, and the dispatch loop that decodes the peer's packets
//! strictly in order. One of the handshake entry points must be called
//! exactly once; it negotiates the session mode and then starts the dispatch
//! loop in a background task.
//!
//! Lock order is connection state → encode lock → connection table. The
//! dispatch loop never holds the table lock while touching a connection.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time;
use tracing::{debug, error, info, warn};

use agentmux_core::{
    decode_record, ConnectionType, MuxError, MuxResult, NewConnectionPayload,
    Packet, PacketReader, PacketType, PacketWriter, SetupPacket,
};

use crate::config::ForwardConfig;
use crate::connection::{CloseCallback, Connection};

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Connections the peer opened, in the order it opened them.
///
/// Yields `None` once the session stops accepting new connections or the
/// transport fails.
pub type AcceptQueue = mpsc::Receiver<Arc<Connection>>;

/// Live connections plus the session-wide id counter.
#[derive(Default)]
struct ConnectionTable {
    /// Highest id allocated locally or observed from the peer.
    last_id: u64,
    connections: HashMap<u64, Arc<Connection>>,
}

/// State shared by the context, its connections, and the dispatch loop.
pub(crate) struct Shared {
    writer: Mutex<PacketWriter<BoxedWriter>>,
    table: RwLock<ConnectionTable>,
    accept_tx: Mutex<Option<mpsc::Sender<Arc<Connection>>>>,
    stopped: AtomicBool,
    no_more_sent: AtomicBool,
    /// Connections that have not reached `Closed` yet.
    open: watch::Sender<usize>,
    /// First transport failure; once set every send fails with it.
    failure: OnceLock<String>,
    pub(crate) config: ForwardConfig,
}

impl Shared {
    /// Encode one packet to the peer.
    pub(crate) async fn send(&self, packet: &Packet) -> MuxResult<()> {
        let mut writer = self.writer.lock().await;
        self.send_locked(&mut writer, packet).await
    }

    async fn send_locked(
        &self,
        writer: &mut PacketWriter<BoxedWriter>,
        packet: &Packet,
    ) -> MuxResult<()> {
        self.check_transport()?;
        if let Err(e) = writer.write_packet(packet).await {
            self.fail(&e.to_string());
            return Err(e);
        }
        Ok(())
    }

    fn check_transport(&self) -> MuxResult<()> {
        match self.failure.get() {
            Some(reason) => Err(MuxError::Transport(reason.clone())),
            None => Ok(()),
        }
    }

    fn fail(&self, reason: &str) {
        if self.failure.set(reason.to_string()).is_ok() {
            warn!(reason, "shared transport failed");
        }
    }

    /// Drop a closed connection from the table and count it as finished.
    pub(crate) async fn release(&self, id: u64) {
        self.table.write().await.connections.remove(&id);
        self.open.send_modify(|n| *n = n.saturating_sub(1));
    }

    async fn lookup(&self, id: u64) -> Option<Arc<Connection>> {
        self.table.read().await.connections.get(&id).cloned()
    }

    async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.table.read().await.connections.values().cloned().collect()
    }

    async fn close_accept_queue(&self) {
        self.accept_tx.lock().await.take();
    }

    async fn wait_all_finished(&self) {
        let mut watcher = self.open.subscribe();
        let _ = watcher.wait_for(|n| *n == 0).await;
    }

    // ── Packet handlers ──────────────────────────────────────────────

    async fn handle_data(&self, packet: Packet) {
        let Some(conn) = self.lookup(packet.connection_id).await else {
            info!(connection_id = packet.connection_id, "received data packet with unknown connection id");
            return;
        };
        conn.push_data(packet.payload).await;
    }

    async fn handle_close(&self, id: u64) {
        let Some(conn) = self.lookup(id).await else {
            info!(connection_id = id, "received close packet with unknown connection id");
            return;
        };
        let reply = match conn.close_immediate().await {
            Ok(()) => PacketType::Success,
            Err(e) => {
                debug!(connection_id = id, error = %e, "close requested by peer failed");
                PacketType::Error
            }
        };
        if let Err(e) = self.send(&Packet::new(reply, id)).await {
            warn!(connection_id = id, error = %e, "failed to answer close request");
        }
    }

    async fn handle_success(&self, id: u64) {
        let Some(conn) = self.lookup(id).await else {
            info!(connection_id = id, "received success packet with unknown connection id");
            return;
        };
        conn.on_success().await;
    }

    async fn handle_error(&self, id: u64) {
        let Some(conn) = self.lookup(id).await else {
            info!(connection_id = id, "received error packet with unknown connection id");
            return;
        };
        info!(connection_id = id, "received error packet for connection from peer");
        conn.on_remote_error().await;
    }

    async fn handle_new_connection(self: &Arc<Self>, packet: Packet) {
        let id = packet.connection_id;
        let details: NewConnectionPayload = match decode_record(&packet.payload) {
            Ok(details) => details,
            Err(e) => {
                error!(connection_id = id, error = %e, "error decoding new connection payload");
                return;
            }
        };

        // Duplicate or non-increasing ids are dropped without a reply: any
        // answer would be read as belonging to the live connection with that id.
        let conn = {
            let mut table = self.table.write().await;
            if table.connections.contains_key(&id) {
                warn!(connection_id = id, "peer tried to open a connection with a re-used id");
                return;
            }
            if id <= table.last_id {
                warn!(connection_id = id, last_id = table.last_id, "suspicious connection id, not greater than previous");
                return;
            }
            if id != table.last_id + 1 {
                warn!(connection_id = id, last_id = table.last_id, "suspicious connection id, not previous + 1");
            }
            table.last_id = id;
            let conn = Connection::new(id, false, details, None, self.clone());
            table.connections.insert(id, conn.clone());
            self.open.send_modify(|n| *n += 1);
            conn
        };

        if self.stopped.load(Ordering::SeqCst) {
            warn!(connection_id = id, "peer opened a connection after no more connections");
            reject_quietly(&conn).await;
            return;
        }

        let tx = self.accept_tx.lock().await.clone();
        let Some(tx) = tx else {
            warn!(connection_id = id, "accept queue closed, rejecting connection");
            reject_quietly(&conn).await;
            return;
        };
        debug!(connection_id = id, protocol = %conn.details().protocol, "peer opened connection");
        if let Err(mpsc::error::SendError(conn)) = tx.send(conn).await {
            warn!(connection_id = id, "accept queue dropped, rejecting connection");
            reject_quietly(&conn).await;
        }
    }

    async fn handle_no_more_connections(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("peer will not accept new connections");
            self.close_accept_queue().await;
        }
    }
}

async fn reject_quietly(conn: &Connection) {
    if let Err(e) = conn.reject().await {
        warn!(connection_id = conn.id(), error = %e, "failed to reject connection");
    }
}

/// The single ordered consumer of the peer's packets.
async fn dispatch_loop(shared: Arc<Shared>, mut reader: PacketReader<BoxedReader>) {
    loop {
        let packet = match reader.read_packet().await {
            Ok(packet) => packet,
            Err(MuxError::Transport(reason)) => {
                info!(reason = %reason, "peer transport ended");
                shared.fail(&reason);
                break;
            }
            Err(e) => {
                error!(error = %e, "error decoding packet from peer");
                shared.fail(&e.to_string());
                break;
            }
        };

        match packet.packet_type {
            PacketType::Data => shared.handle_data(packet).await,
            PacketType::CloseConnection => shared.handle_close(packet.connection_id).await,
            PacketType::Success => shared.handle_success(packet.connection_id).await,
            PacketType::Error => shared.handle_error(packet.connection_id).await,
            PacketType::NewConnection => shared.handle_new_connection(packet).await,
            PacketType::NoMoreConnections => shared.handle_no_more_connections().await,
            other => {
                warn!(packet_type = ?other, "received unexpected packet type from peer");
            }
        }
    }

    // Nobody will deliver new connections any more.
    shared.close_accept_queue().await;
    debug!("dispatch loop ended");
}

/// Halves of the context handed over to the dispatch loop by the handshake.
struct Startup {
    reader: PacketReader<BoxedReader>,
    accept_rx: AcceptQueue,
}

/// Multiplexing context over one pair of byte streams.
pub struct ForwardCtx {
    shared: Arc<Shared>,
    startup: Mutex<Option<Startup>>,
}

impl ForwardCtx {
    /// Create a context reading the peer's packets from `from_peer` and
    /// writing ours to `to_peer`, with default tunables.
    pub fn new<R, W>(from_peer: R, to_peer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::with_config(from_peer, to_peer, ForwardConfig::default())
    }

    /// Like [`ForwardCtx::new`], with explicit tunables for the accept queue,
    /// per-connection buffers and the `terminate` grace period.
    pub fn with_config<R, W>(from_peer: R, to_peer: W, config: ForwardConfig) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let reader: BoxedReader = Box::pin(from_peer);
        let writer: BoxedWriter = Box::pin(to_peer);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue_depth.max(1));
        let (open, _) = watch::channel(0usize);

        let shared = Arc::new(Shared {
            writer: Mutex::new(PacketWriter::new(writer)),
            table: RwLock::new(ConnectionTable::default()),
            accept_tx: Mutex::new(Some(accept_tx)),
            stopped: AtomicBool::new(false),
            no_more_sent: AtomicBool::new(false),
            open,
            failure: OnceLock::new(),
            config,
        });

        Self {
            shared,
            startup: Mutex::new(Some(Startup {
                reader: PacketReader::new(reader),
                accept_rx,
            })),
        }
    }

    // ── Handshakes ───────────────────────────────────────────────────

    /// Agent side: wait for the peer's SETUP packet, acknowledge it, and start
    /// dispatching.
    ///
    /// Returns the negotiated connection type, the full setup packet, and the
    /// queue of connections the peer opens.
    pub async fn become_client(&self) -> MuxResult<(ConnectionType, SetupPacket, AcceptQueue)> {
        let Startup {
            mut reader,
            accept_rx,
        } = self.take_startup().await?;

        let packet = match reader.read_packet().await {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "failed to decode setup packet");
                return Err(self.abort(e));
            }
        };
        if packet.packet_type != PacketType::Setup {
            warn!(packet_type = ?packet.packet_type, "received unexpected packet when expecting setup");
            return Err(self.abort(MuxError::Protocol(format!(
                "expected SETUP, received {:?}",
                packet.packet_type
            ))));
        }
        let setup: SetupPacket = match decode_record(&packet.payload) {
            Ok(setup) => setup,
            Err(e) => {
                error!(error = %e, "error decoding setup packet");
                return Err(self.abort(e));
            }
        };

        if let Err(e) = self.shared.send(&Packet::new(PacketType::Success, 0)).await {
            error!(error = %e, "error writing setup success packet");
            return Err(e);
        }

        info!(
            connection_type = ?setup.connection_type,
            bind_host = %setup.bind_host,
            bind_port = setup.bind_port,
            protocol = %setup.protocol,
            "setup negotiated"
        );
        self.spawn_dispatch(reader);
        Ok((setup.connection_type, setup, accept_rx))
    }

    /// Gateway side of a local port forward: ask the agent to dial
    /// connections on our behalf.
    pub async fn start_port_forward_server(&self) -> MuxResult<AcceptQueue> {
        self.start_with_setup(SetupPacket::port_dial()).await
    }

    /// Ask the agent to listen on `bind_host:bind_port` and forward inbound
    /// TCP connections back to us.
    pub async fn start_reverse_forward(
        &self,
        bind_host: &str,
        bind_port: u32,
        single_connection: bool,
    ) -> MuxResult<AcceptQueue> {
        self.start_with_setup(SetupPacket::reverse_tcp(bind_host, bind_port, single_connection))
            .await
    }

    /// Ask the agent to listen on the Unix socket at `path`.
    pub async fn start_reverse_forward_unix(
        &self,
        path: &str,
        single_connection: bool,
    ) -> MuxResult<AcceptQueue> {
        self.start_with_setup(SetupPacket::reverse_unix(path, single_connection))
            .await
    }

    /// Ask the agent to accept X11 clients and forward them back to us.
    pub async fn start_x11_forward(
        &self,
        single_connection: bool,
        screen: &str,
        auth_protocol: &str,
        auth_cookie: &str,
    ) -> MuxResult<AcceptQueue> {
        self.start_with_setup(SetupPacket::x11(
            single_connection,
            screen,
            auth_protocol,
            auth_cookie,
        ))
        .await
    }

    /// Send `setup`, wait for exactly one reply, and start dispatching if the
    /// peer answered SUCCESS.
    pub async fn start_with_setup(&self, setup: SetupPacket) -> MuxResult<AcceptQueue> {
        let Startup {
            mut reader,
            accept_rx,
        } = self.take_startup().await?;

        let packet = Packet::setup(&setup)?;
        self.shared.send(&packet).await?;

        let reply = reader.read_packet().await.map_err(|e| self.abort(e))?;
        match reply.packet_type {
            PacketType::Success => {}
            PacketType::Error => {
                warn!(connection_type = ?setup.connection_type, "peer rejected setup");
                return Err(self.abort(MuxError::SetupRejected));
            }
            other => {
                return Err(self.abort(MuxError::Protocol(format!(
                    "expected SUCCESS or ERROR in reply to SETUP, received {other:?}"
                ))));
            }
        }

        info!(connection_type = ?setup.connection_type, "setup accepted by peer");
        self.spawn_dispatch(reader);
        Ok(accept_rx)
    }

    // ── Dialing ──────────────────────────────────────────────────────

    /// Open a logical TCP connection to the peer.
    ///
    /// The returned connection is in `WaitInit`; writes wait until the peer
    /// accepts it and fail if the peer rejects it.
    ///
    /// # Arguments
    ///
    /// * `connected_address` / `connected_port` - Destination the peer should
    ///   reach (or the address the client connected to, for reverse forwards).
    /// * `originator_address` / `originator_port` - Where the connection came
    ///   from.
    /// * `on_close` - Invoked once when the connection reaches `Closed`.
    pub async fn open_tcp(
        &self,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        on_close: Option<CloseCallback>,
    ) -> MuxResult<Arc<Connection>> {
        let details = NewConnectionPayload::tcp(
            connected_address,
            connected_port,
            originator_address,
            originator_port,
        );
        self.open(details, on_close).await
    }

    /// Open a logical Unix-socket connection to `path` on the peer.
    pub async fn open_unix(
        &self,
        path: &str,
        on_close: Option<CloseCallback>,
    ) -> MuxResult<Arc<Connection>> {
        self.open(NewConnectionPayload::unix(path), on_close).await
    }

    async fn open(
        &self,
        details: NewConnectionPayload,
        on_close: Option<CloseCallback>,
    ) -> MuxResult<Arc<Connection>> {
        self.shared.check_transport()?;

        // Allocate and announce under the encode lock so ids reach the peer
        // in increasing order.
        let mut writer = self.shared.writer.lock().await;
        let (conn, packet) = {
            let mut table = self.shared.table.write().await;
            // The peer may already have used the top of the id space.
            let id = table
                .last_id
                .checked_add(1)
                .ok_or_else(|| MuxError::Other("connection id space exhausted".into()))?;
            if table.connections.contains_key(&id) {
                return Err(MuxError::Other(format!(
                    "connection id {id} is already in use"
                )));
            }
            let packet = Packet::new_connection(id, &details)?;
            table.last_id = id;
            let conn = Connection::new(id, true, details, on_close, self.shared.clone());
            table.connections.insert(id, conn.clone());
            self.shared.open.send_modify(|n| *n += 1);
            (conn, packet)
        };

        let sent = self.shared.send_locked(&mut writer, &packet).await;
        drop(writer);

        if let Err(e) = sent {
            error!(connection_id = conn.id(), error = %e, "error writing new connection packet");
            let _ = conn.close_immediate().await;
            return Err(e);
        }
        debug!(
            connection_id = conn.id(),
            protocol = %conn.details().protocol,
            address = %conn.details().connected_address,
            "opened connection"
        );
        Ok(conn)
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Stop handing out new connections and tell the peer to do the same.
    ///
    /// Existing connections are left alone.
    pub async fn stop_accepting_new_connections(&self) -> MuxResult<()> {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.close_accept_queue().await;
        if self.shared.no_more_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("no longer accepting new connections");
        self.shared
            .send(&Packet::new(PacketType::NoMoreConnections, 0))
            .await
    }

    /// Wait until every connection of the session has reached `Closed`.
    pub async fn wait_for_all_connections_to_finish(&self) {
        self.shared.wait_all_finished().await;
    }

    /// Shut the session down without waiting on the peer forever.
    ///
    /// Stops accepting, asks every connection to close, gives them the
    /// configured grace period (5 seconds by default), forces the stragglers
    /// closed, and returns once every connection is `Closed`.
    pub async fn terminate(&self) {
        if !self.shared.stopped.load(Ordering::SeqCst) {
            if let Err(e) = self.stop_accepting_new_connections().await {
                warn!(error = %e, "failed to send no more connections");
            }
        }

        for conn in self.shared.snapshot().await {
            if let Err(e) = conn.close().await {
                debug!(connection_id = conn.id(), error = %e, "close request failed");
            }
        }

        // With a dead transport nobody can acknowledge, so skip the grace period.
        let finished = if self.shared.failure.get().is_some() {
            false
        } else {
            time::timeout(
                self.shared.config.terminate_timeout(),
                self.shared.wait_all_finished(),
            )
            .await
            .is_ok()
        };

        if !finished {
            let remaining = self.shared.snapshot().await;
            if !remaining.is_empty() {
                warn!(remaining = remaining.len(), "forcing connections closed");
            }
            for conn in remaining {
                let _ = conn.close_immediate().await;
            }
        }

        self.shared.wait_all_finished().await;
        debug!("all connections finished");
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Number of connections that have not reached `Closed`.
    pub fn open_connections(&self) -> usize {
        *self.shared.open.borrow()
    }

    /// Whether either side has stopped accepting new connections.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn take_startup(&self) -> MuxResult<Startup> {
        self.startup
            .lock()
            .await
            .take()
            .ok_or_else(|| MuxError::InvalidState("context has already been started".into()))
    }

    /// Record a fatal handshake failure on the context and pass it through.
    fn abort(&self, e: MuxError) -> MuxError {
        self.shared.fail(&e.to_string());
        e
    }

    fn spawn_dispatch(&self, reader: PacketReader<BoxedReader>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            dispatch_loop(shared, reader).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    /// A hand-driven peer that speaks raw packets.
    struct RawPeer {
        reader: PacketReader<ReadHalf<DuplexStream>>,
        writer: PacketWriter<WriteHalf<DuplexStream>>,
    }

    impl RawPeer {
        async fn send(&mut self, packet: Packet) {
            self.writer.write_packet(&packet).await.unwrap();
        }

        async fn recv(&mut self) -> Packet {
            time::timeout(Duration::from_secs(5), self.reader.read_packet())
                .await
                .expect("timed out waiting for packet")
                .unwrap()
        }
    }

    fn raw_pair(config: ForwardConfig) -> (ForwardCtx, RawPeer) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        let ctx = ForwardCtx::with_config(our_read, our_write, config);
        let peer = RawPeer {
            reader: PacketReader::new(their_read),
            writer: PacketWriter::new(their_write),
        };
        (ctx, peer)
    }

    fn ctx_pair() -> (ForwardCtx, ForwardCtx) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (ForwardCtx::new(a_read, a_write), ForwardCtx::new(b_read, b_write))
    }

    /// Context started as port-forward server against a raw peer.
    async fn started_server(config: ForwardConfig) -> (ForwardCtx, AcceptQueue, RawPeer) {
        let (ctx, mut peer) = raw_pair(config);
        let (queue, setup) = tokio::join!(ctx.start_port_forward_server(), async {
            let setup = peer.recv().await;
            peer.send(Packet::new(PacketType::Success, 0)).await;
            setup
        });
        assert_eq!(setup.packet_type, PacketType::Setup);
        (ctx, queue.unwrap(), peer)
    }

    async fn peer_opens(peer: &mut RawPeer, id: u64) {
        let details = NewConnectionPayload::tcp("127.0.0.1", 22, "10.0.0.1", 40000 + (id % 1000) as u32);
        peer.send(Packet::new_connection(id, &details).unwrap()).await;
    }

    async fn recv_conn(queue: &mut AcceptQueue) -> Arc<Connection> {
        time::timeout(Duration::from_secs(5), queue.recv())
            .await
            .expect("timed out waiting for connection")
            .expect("accept queue closed")
    }

    #[tokio::test]
    async fn reverse_forward_end_to_end() {
        let (gateway, agent) = ctx_pair();

        let (gateway_queue, client) = tokio::join!(
            gateway.start_reverse_forward("127.0.0.1", 8080, false),
            agent.become_client()
        );
        let mut gateway_queue = gateway_queue.unwrap();
        let (connection_type, setup, _agent_queue) = client.unwrap();
        assert_eq!(connection_type, ConnectionType::PortForward);
        assert_eq!(setup.bind_host, "127.0.0.1");
        assert_eq!(setup.bind_port, 8080);
        assert!(!setup.single_connection);

        let dialed = agent
            .open_tcp("127.0.0.1", 8080, "10.0.0.5", 9000, None)
            .await
            .unwrap();
        assert!(dialed.is_initiator());

        let incoming = recv_conn(&mut gateway_queue).await;
        assert!(!incoming.is_initiator());
        assert_eq!(
            incoming.details(),
            &NewConnectionPayload {
                protocol: "tcp".into(),
                connected_address: "127.0.0.1".into(),
                connected_port: 8080,
                originator_address: "10.0.0.5".into(),
                originator_port: 9000,
            }
        );
        incoming.accept().await.unwrap();

        assert_eq!(dialed.write(b"ping").await.unwrap(), 4);
        let mut buf = [0u8; 64];
        let n = incoming.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        // And back.
        incoming.write(b"pong").await.unwrap();
        let n = dialed.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        // Close handshake: both ends reach Closed and the counters drain.
        dialed.close().await.unwrap();
        time::timeout(Duration::from_secs(5), dialed.wait_closed())
            .await
            .unwrap();
        assert_eq!(incoming.state(), ConnectionState::Closed);
        assert_eq!(incoming.read(&mut buf).await.unwrap(), 0);
        agent.wait_for_all_connections_to_finish().await;
        gateway.wait_for_all_connections_to_finish().await;
    }

    #[tokio::test]
    async fn writes_on_distinct_connections_arrive_intact() {
        let (gateway, agent) = ctx_pair();
        let (gateway_queue, client) =
            tokio::join!(gateway.start_port_forward_server(), agent.become_client());
        let _gateway_queue = gateway_queue.unwrap();
        let (connection_type, _, mut agent_queue) = client.unwrap();
        assert_eq!(connection_type, ConnectionType::PortDial);

        let a = gateway.open_tcp("db", 5432, "", 0, None).await.unwrap();
        let b = gateway.open_unix("/run/app.sock", None).await.unwrap();
        assert!(a.id() < b.id());

        let remote_a = recv_conn(&mut agent_queue).await;
        let remote_b = recv_conn(&mut agent_queue).await;
        assert_eq!(remote_a.id(), a.id());
        assert_eq!(remote_b.details().protocol, "unix");
        assert_eq!(remote_b.details().connected_address, "/run/app.sock");
        remote_a.accept().await.unwrap();
        remote_b.accept().await.unwrap();

        let chunks_a: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 100 + i as usize]).collect();
        let chunks_b: Vec<Vec<u8>> = (0..20u8).map(|i| vec![0xff - i; 300]).collect();
        for (ca, cb) in chunks_a.iter().zip(chunks_b.iter()) {
            a.write(ca).await.unwrap();
            b.write(cb).await.unwrap();
        }

        async fn read_exact(conn: &Connection, len: usize) -> Vec<u8> {
            let mut out = Vec::new();
            let mut buf = [0u8; 333];
            while out.len() < len {
                let n = conn.read(&mut buf).await.unwrap();
                assert!(n > 0, "unexpected EOF");
                out.extend_from_slice(&buf[..n]);
            }
            out
        }

        let expected_a = chunks_a.concat();
        let expected_b = chunks_b.concat();
        assert_eq!(read_exact(&remote_a, expected_a.len()).await, expected_a);
        assert_eq!(read_exact(&remote_b, expected_b.len()).await, expected_b);
    }

    #[tokio::test]
    async fn client_requires_setup_first() {
        let (ctx, mut peer) = raw_pair(ForwardConfig::default());
        peer.send(Packet::new(PacketType::Data, 1)).await;
        let err = ctx.become_client().await.unwrap_err();
        assert!(matches!(err, MuxError::Protocol(_)));

        // The context is unusable afterwards.
        assert!(matches!(
            ctx.open_tcp("a", 1, "b", 2, None).await,
            Err(MuxError::Transport(_))
        ));
        assert!(matches!(
            ctx.become_client().await,
            Err(MuxError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn setup_rejected_by_peer() {
        let (ctx, mut peer) = raw_pair(ForwardConfig::default());
        let (result, ()) = tokio::join!(ctx.start_reverse_forward_unix("/tmp/x.sock", true), async {
            let setup = peer.recv().await;
            let decoded: SetupPacket = decode_record(&setup.payload).unwrap();
            assert_eq!(decoded.protocol, "unix");
            assert!(decoded.single_connection);
            peer.send(Packet::new(PacketType::Error, 0)).await;
        });
        assert!(matches!(result, Err(MuxError::SetupRejected)));
    }

    #[tokio::test]
    async fn setup_reply_must_be_success_or_error() {
        let (ctx, mut peer) = raw_pair(ForwardConfig::default());
        let (result, ()) = tokio::join!(ctx.start_x11_forward(false, "0", "MIT-MAGIC-COOKIE-1", "c0ffee"), async {
            let setup = peer.recv().await;
            let decoded: SetupPacket = decode_record(&setup.payload).unwrap();
            assert_eq!(decoded.connection_type, ConnectionType::X11);
            assert_eq!(decoded.auth_cookie, "c0ffee");
            peer.send(Packet::new(PacketType::Data, 0)).await;
        });
        assert!(matches!(result, Err(MuxError::Protocol(_))));
    }

    #[tokio::test]
    async fn accept_then_reject_is_invalid() {
        let (_ctx, mut queue, mut peer) = started_server(ForwardConfig::default()).await;
        peer_opens(&mut peer, 1).await;
        let conn = recv_conn(&mut queue).await;

        conn.accept().await.unwrap();
        assert_eq!(peer.recv().await, Packet::new(PacketType::Success, 1));
        assert!(matches!(conn.reject().await, Err(MuxError::InvalidState(_))));
        assert!(matches!(conn.accept().await, Err(MuxError::InvalidState(_))));
        assert_eq!(conn.state(), ConnectionState::Started);
    }

    #[tokio::test]
    async fn initiator_cannot_answer_its_own_dial() {
        let (ctx, _queue, mut peer) = started_server(ForwardConfig::default()).await;
        let conn = ctx.open_tcp("127.0.0.1", 80, "", 0, None).await.unwrap();
        assert_eq!(peer.recv().await.packet_type, PacketType::NewConnection);

        assert!(matches!(conn.accept().await, Err(MuxError::InvalidState(_))));
        assert!(matches!(conn.reject().await, Err(MuxError::InvalidState(_))));
        assert_eq!(conn.state(), ConnectionState::WaitInit);
    }

    #[tokio::test]
    async fn reject_sends_error_and_finishes() {
        let (ctx, mut queue, mut peer) = started_server(ForwardConfig::default()).await;
        peer_opens(&mut peer, 1).await;
        let conn = recv_conn(&mut queue).await;
        assert_eq!(ctx.open_connections(), 1);

        conn.reject().await.unwrap();
        assert_eq!(peer.recv().await, Packet::new(PacketType::Error, 1));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(ctx.open_connections(), 0);
        ctx.wait_for_all_connections_to_finish().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (ctx, _queue, mut peer) = started_server(ForwardConfig::default()).await;
        let conn = ctx.open_tcp("127.0.0.1", 80, "", 0, None).await.unwrap();
        let opened = peer.recv().await;
        peer.send(Packet::new(PacketType::Success, opened.connection_id)).await;
        conn.write(b"x").await.unwrap();
        assert_eq!(peer.recv().await.packet_type, PacketType::Data);

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::WaitClose);
        assert!(matches!(
            conn.write(b"late").await,
            Err(MuxError::ConnectionClosed(1))
        ));

        // Exactly one CLOSE_CONNECTION goes out; the NO_MORE_CONNECTIONS that
        // follows proves nothing else was queued in between.
        assert_eq!(peer.recv().await, Packet::new(PacketType::CloseConnection, 1));
        ctx.stop_accepting_new_connections().await.unwrap();
        assert_eq!(peer.recv().await.packet_type, PacketType::NoMoreConnections);

        peer.send(Packet::new(PacketType::Success, 1)).await;
        time::timeout(Duration::from_secs(5), conn.wait_closed())
            .await
            .unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_waits_for_accept() {
        let (ctx, _queue, mut peer) = started_server(ForwardConfig::default()).await;
        let conn = ctx.open_tcp("127.0.0.1", 80, "", 0, None).await.unwrap();
        assert_eq!(peer.recv().await.packet_type, PacketType::NewConnection);

        let writer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.write(b"early").await })
        };
        time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        peer.send(Packet::new(PacketType::Success, 1)).await;
        assert_eq!(writer.await.unwrap().unwrap(), 5);
        let data = peer.recv().await;
        assert_eq!(data.packet_type, PacketType::Data);
        assert_eq!(data.payload, b"early");
    }

    #[tokio::test]
    async fn remote_error_fails_pending_write() {
        let (ctx, _queue, mut peer) = started_server(ForwardConfig::default()).await;
        let closed = Arc::new(AtomicUsize::new(0));
        let callback: CloseCallback = {
            let closed = closed.clone();
            Box::new(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            })
        };
        let conn = ctx
            .open_tcp("10.1.1.1", 443, "", 0, Some(callback))
            .await
            .unwrap();
        assert_eq!(peer.recv().await.packet_type, PacketType::NewConnection);

        let writer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.write(b"hello").await })
        };
        peer.send(Packet::new(PacketType::Error, 1)).await;

        assert!(matches!(
            writer.await.unwrap(),
            Err(MuxError::ConnectionClosed(1))
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            conn.close_immediate().await,
            Err(MuxError::InvalidState(_))
        ));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peer_close_is_acknowledged_and_unblocks_reader() {
        let (ctx, mut queue, mut peer) = started_server(ForwardConfig::default()).await;
        peer_opens(&mut peer, 1).await;
        let conn = recv_conn(&mut queue).await;
        conn.accept().await.unwrap();
        assert_eq!(peer.recv().await, Packet::new(PacketType::Success, 1));

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                conn.read(&mut buf).await
            })
        };
        time::sleep(Duration::from_millis(20)).await;

        peer.send(Packet::new(PacketType::CloseConnection, 1)).await;
        assert_eq!(peer.recv().await, Packet::new(PacketType::Success, 1));
        assert_eq!(reader.await.unwrap().unwrap(), 0);
        assert_eq!(ctx.open_connections(), 0);

        // A second close for the same id refers to nothing any more.
        peer.send(Packet::new(PacketType::CloseConnection, 1)).await;
        peer_opens(&mut peer, 2).await;
        assert_eq!(recv_conn(&mut queue).await.id(), 2);
    }

    #[tokio::test]
    async fn duplicate_connection_id_is_dropped() {
        let (ctx, mut queue, mut peer) = started_server(ForwardConfig::default()).await;
        peer_opens(&mut peer, 1).await;
        let first = recv_conn(&mut queue).await;

        let other = NewConnectionPayload::tcp("evil", 1, "evil", 1);
        peer.send(Packet::new_connection(1, &other).unwrap()).await;
        // Lower than the last id seen: dropped as well.
        peer.send(Packet::new_connection(0, &other).unwrap()).await;
        // Gap in the sequence: logged but accepted.
        peer_opens(&mut peer, 5).await;

        let next = recv_conn(&mut queue).await;
        assert_eq!(next.id(), 5);
        assert_eq!(first.state(), ConnectionState::WaitInit);
        assert_eq!(first.details().connected_address, "127.0.0.1");
        assert_eq!(ctx.open_connections(), 2);

        // Local ids continue after the highest one seen.
        let local = ctx.open_tcp("x", 1, "", 0, None).await.unwrap();
        assert_eq!(local.id(), 6);
    }

    #[tokio::test]
    async fn exhausted_id_space_fails_open() {
        let (ctx, mut queue, mut peer) = started_server(ForwardConfig::default()).await;
        peer_opens(&mut peer, u64::MAX).await;
        assert_eq!(recv_conn(&mut queue).await.id(), u64::MAX);

        let err = ctx.open_tcp("h", 1, "", 0, None).await.unwrap_err();
        assert!(matches!(err, MuxError::Other(_)));
        assert_eq!(ctx.open_connections(), 1);

        // Nothing was announced: the next packet on the wire is ours from the
        // graceful stop.
        ctx.stop_accepting_new_connections().await.unwrap();
        assert_eq!(peer.recv().await.packet_type, PacketType::NoMoreConnections);
    }

    #[tokio::test]
    async fn stray_packets_are_ignored() {
        let (_ctx, mut queue, mut peer) = started_server(ForwardConfig::default()).await;
        peer.send(Packet::with_payload(PacketType::Data, 99, b"?".to_vec())).await;
        peer.send(Packet::new(PacketType::Success, 99)).await;
        peer.send(Packet::new(PacketType::Error, 99)).await;
        peer.send(Packet::new(PacketType::Unknown(77), 0)).await;
        peer.send(Packet::new(PacketType::Setup, 0)).await;

        peer_opens(&mut peer, 1).await;
        let conn = recv_conn(&mut queue).await;
        conn.accept().await.unwrap();
        assert_eq!(peer.recv().await, Packet::new(PacketType::Success, 1));
        peer.send(Packet::with_payload(PacketType::Data, 1, b"ok".to_vec())).await;

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[tokio::test]
    async fn data_before_accept_is_dropped() {
        let (_ctx, mut queue, mut peer) = started_server(ForwardConfig::default()).await;
        peer_opens(&mut peer, 1).await;
        peer.send(Packet::with_payload(PacketType::Data, 1, b"too soon".to_vec())).await;
        // Once connection 2 is delivered the early data has been handled.
        peer_opens(&mut peer, 2).await;
        let first = recv_conn(&mut queue).await;
        assert_eq!(recv_conn(&mut queue).await.id(), 2);

        first.accept().await.unwrap();
        assert_eq!(peer.recv().await, Packet::new(PacketType::Success, 1));
        peer.send(Packet::with_payload(PacketType::Data, 1, b"ok".to_vec())).await;
        let mut buf = [0u8; 16];
        let n = first.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[tokio::test]
    async fn no_more_connections_from_peer() {
        let (ctx, mut queue, mut peer) = started_server(ForwardConfig::default()).await;
        peer.send(Packet::new(PacketType::NoMoreConnections, 0)).await;
        peer.send(Packet::new(PacketType::NoMoreConnections, 0)).await;
        peer_opens(&mut peer, 1).await;

        assert_eq!(peer.recv().await, Packet::new(PacketType::Error, 1));
        assert!(queue.recv().await.is_none());
        assert!(ctx.is_stopped());
        assert_eq!(ctx.open_connections(), 0);
    }

    #[tokio::test]
    async fn graceful_stop_sends_one_notice() {
        let (ctx, mut queue, mut peer) = started_server(ForwardConfig::default()).await;
        ctx.stop_accepting_new_connections().await.unwrap();
        ctx.stop_accepting_new_connections().await.unwrap();
        assert!(queue.recv().await.is_none());

        peer_opens(&mut peer, 1).await;
        assert_eq!(peer.recv().await.packet_type, PacketType::NoMoreConnections);
        assert_eq!(peer.recv().await, Packet::new(PacketType::Error, 1));
    }

    #[tokio::test]
    async fn terminate_forces_unresponsive_connections() {
        let config = ForwardConfig {
            terminate_timeout_ms: 200,
            ..Default::default()
        };
        let (ctx, _queue, mut peer) = started_server(config).await;
        let forced = Arc::new(AtomicUsize::new(0));

        let mut conns = Vec::new();
        for port in [80, 81, 82] {
            let forced = forced.clone();
            let callback: CloseCallback = Box::new(move || {
                forced.fetch_add(1, Ordering::SeqCst);
            });
            conns.push(ctx.open_tcp("h", port, "", 0, Some(callback)).await.unwrap());
        }
        for id in 1..=3 {
            assert_eq!(peer.recv().await.connection_id, id);
            peer.send(Packet::new(PacketType::Success, id)).await;
        }
        assert_eq!(ctx.open_connections(), 3);

        // The peer reads our packets but never answers them.
        let drain = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(packet) = peer.reader.read_packet().await {
                seen.push(packet.packet_type);
            }
            seen
        });

        let started = time::Instant::now();
        time::timeout(Duration::from_secs(5), ctx.terminate())
            .await
            .expect("terminate hung");
        assert!(started.elapsed() >= Duration::from_millis(200));

        for conn in &conns {
            assert_eq!(conn.state(), ConnectionState::Closed);
        }
        assert_eq!(forced.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.open_connections(), 0);
        ctx.wait_for_all_connections_to_finish().await;

        drop(ctx);
        drop(conns);
        drain.abort();
    }

    #[tokio::test]
    async fn terminate_finishes_early_when_peer_cooperates() {
        let (gateway, agent) = ctx_pair();
        let (gateway_queue, client) =
            tokio::join!(gateway.start_port_forward_server(), agent.become_client());
        let _gateway_queue = gateway_queue.unwrap();
        let (_, _, mut agent_queue) = client.unwrap();

        let conn = gateway.open_tcp("h", 1, "", 0, None).await.unwrap();
        recv_conn(&mut agent_queue).await.accept().await.unwrap();
        conn.write(b"x").await.unwrap();

        let started = time::Instant::now();
        gateway.terminate().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(conn.state(), ConnectionState::Closed);
        agent.wait_for_all_connections_to_finish().await;
        assert!(agent.is_stopped());
    }

    #[tokio::test]
    async fn transport_loss_is_surfaced() {
        let (ctx, mut queue, peer) = started_server(ForwardConfig::default()).await;
        let conn = ctx.open_tcp("h", 1, "", 0, None).await.unwrap();
        drop(peer);

        // Dispatch notices the EOF and closes the accept queue.
        assert!(time::timeout(Duration::from_secs(5), queue.recv())
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            ctx.open_tcp("h", 2, "", 0, None).await,
            Err(MuxError::Transport(_))
        ));
        // Existing connections are left as they were.
        assert_eq!(conn.state(), ConnectionState::WaitInit);

        time::timeout(Duration::from_secs(1), ctx.terminate())
            .await
            .expect("terminate should not wait on a dead transport");
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
