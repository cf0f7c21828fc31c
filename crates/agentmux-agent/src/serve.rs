//! Forwarding modes of the agent.
//!
//! After the setup handshake the agent either dials out for every connection
//! the gateway opens (`PortDial` / `SocketDial`), or listens locally and opens
//! a logical connection toward the gateway for every client that connects
//! (`PortForward` / `SocketForward` / `X11`).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use agentmux::{relay, AcceptQueue, Connection, ForwardCtx, PROTOCOL_TCP, PROTOCOL_UNIX};
use agentmux_core::{ConnectionType, NewConnectionPayload, SetupPacket};
use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, AgentSection};

/// A local socket of either family.
trait LocalIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LocalIo for T {}

type LocalStream = Box<dyn LocalIo>;

/// Run one agent session over the given transport halves.
pub async fn run<R, W>(from_peer: R, to_peer: W, config: &AgentConfig) -> Result<()>
where
    R: AsyncRead + Send + 'static,
    W: AsyncWrite + Send + 'static,
{
    let ctx = ForwardCtx::with_config(from_peer, to_peer, config.forward.clone());
    let (connection_type, setup, queue) = ctx
        .become_client()
        .await
        .context("setup handshake failed")?;
    let chunk = config.forward.relay_chunk_size;

    let result = match connection_type {
        ConnectionType::PortDial | ConnectionType::SocketDial => {
            serve_dial(queue, chunk).await;
            Ok(())
        }
        ConnectionType::PortForward | ConnectionType::SocketForward => {
            serve_reverse(&ctx, &setup, queue, chunk).await
        }
        ConnectionType::X11 => serve_x11(&ctx, &setup, &config.agent, queue, chunk).await,
    };

    ctx.terminate().await;
    result
}

// ── Dial mode ────────────────────────────────────────────────────────

async fn serve_dial(mut queue: AcceptQueue, chunk: usize) {
    while let Some(conn) = queue.recv().await {
        tokio::spawn(dial_and_relay(conn, chunk));
    }
    info!("connection queue closed, ending dial mode");
}

async fn dial_and_relay(conn: Arc<Connection>, chunk: usize) {
    let id = conn.id();
    let stream = match dial(conn.details()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(connection_id = id, error = %e, "dial failed, rejecting connection");
            if let Err(e) = conn.reject().await {
                debug!(connection_id = id, error = %e, "reject failed");
            }
            return;
        }
    };
    if let Err(e) = conn.accept().await {
        warn!(connection_id = id, error = %e, "accept failed");
        return;
    }
    let stats = relay(conn, stream, chunk).await;
    debug!(connection_id = id, sent = stats.sent, received = stats.received, "dialed connection finished");
}

async fn dial(details: &NewConnectionPayload) -> io::Result<LocalStream> {
    match details.protocol.as_str() {
        PROTOCOL_TCP => {
            let port = u16::try_from(details.connected_port).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("port {} out of range", details.connected_port),
                )
            })?;
            let stream = TcpStream::connect((details.connected_address.as_str(), port)).await?;
            info!(addr = %details.connected_address, port, "TCP connection established");
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        PROTOCOL_UNIX => {
            let stream = tokio::net::UnixStream::connect(&details.connected_address).await?;
            info!(path = %details.connected_address, "unix connection established");
            Ok(Box::new(stream))
        }
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported protocol: {other}"),
        )),
    }
}

// ── Listen modes ─────────────────────────────────────────────────────

/// Local listener whose clients are forwarded to the gateway.
enum LocalListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, std::path::PathBuf),
}

impl LocalListener {
    async fn bind_tcp(host: &str, port: u32) -> Result<Self> {
        let port = u16::try_from(port).with_context(|| format!("port {port} out of range"))?;
        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("cannot listen on {host}:{port}"))?;
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "listening for TCP clients");
        }
        Ok(Self::Tcp(listener))
    }

    #[cfg(unix)]
    fn bind_unix(path: &str) -> Result<Self> {
        let listener = tokio::net::UnixListener::bind(path)
            .with_context(|| format!("cannot listen on {path}"))?;
        info!(path, "listening for unix clients");
        Ok(Self::Unix(listener, path.into()))
    }

    #[cfg(not(unix))]
    fn bind_unix(path: &str) -> Result<Self> {
        anyhow::bail!("unix socket forwarding is not supported on this platform: {path}")
    }

    async fn accept(&self) -> io::Result<(LocalStream, Option<SocketAddr>)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), Some(peer)))
            }
            #[cfg(unix)]
            Self::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), None))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for LocalListener {
    fn drop(&mut self) {
        if let Self::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// How local clients are announced to the gateway.
struct ForwardTarget {
    unix: bool,
    connected_address: String,
    connected_port: u32,
}

impl ForwardTarget {
    async fn open(&self, ctx: &ForwardCtx, peer: Option<SocketAddr>) -> agentmux::MuxResult<Arc<Connection>> {
        if self.unix {
            return ctx.open_unix(&self.connected_address, None).await;
        }
        let (originator_address, originator_port) = peer
            .map(|p| (p.ip().to_string(), u32::from(p.port())))
            .unwrap_or_default();
        ctx.open_tcp(
            &self.connected_address,
            self.connected_port,
            &originator_address,
            originator_port,
            None,
        )
        .await
    }
}

async fn serve_reverse(
    ctx: &ForwardCtx,
    setup: &SetupPacket,
    queue: AcceptQueue,
    chunk: usize,
) -> Result<()> {
    let unix = setup.protocol == PROTOCOL_UNIX || setup.connection_type == ConnectionType::SocketForward;
    let listener = if unix {
        LocalListener::bind_unix(&setup.bind_host)?
    } else {
        LocalListener::bind_tcp(&setup.bind_host, setup.bind_port).await?
    };
    let target = ForwardTarget {
        unix,
        connected_address: setup.bind_host.clone(),
        connected_port: setup.bind_port,
    };
    forward_clients(ctx, listener, target, setup.single_connection, queue, chunk).await;
    Ok(())
}

async fn serve_x11(
    ctx: &ForwardCtx,
    setup: &SetupPacket,
    agent: &AgentSection,
    queue: AcceptQueue,
    chunk: usize,
) -> Result<()> {
    info!(
        screen = %setup.screen,
        auth_protocol = %setup.auth_protocol,
        display = agent.x11_display,
        "starting X11 forwarding"
    );
    let listener = LocalListener::bind_tcp(&agent.x11_bind_host, agent.x11_port()).await?;
    let target = ForwardTarget {
        unix: false,
        connected_address: agent.x11_bind_host.clone(),
        connected_port: agent.x11_port(),
    };
    forward_clients(ctx, listener, target, setup.single_connection, queue, chunk).await;
    Ok(())
}

async fn accept_next(
    listener: Option<&LocalListener>,
) -> io::Result<(LocalStream, Option<SocketAddr>)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Forward local clients until the gateway stops accepting connections.
async fn forward_clients(
    ctx: &ForwardCtx,
    listener: LocalListener,
    target: ForwardTarget,
    single_connection: bool,
    mut queue: AcceptQueue,
    chunk: usize,
) {
    let mut listener = Some(listener);
    loop {
        tokio::select! {
            accepted = accept_next(listener.as_ref()) => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        continue;
                    }
                };
                if single_connection {
                    debug!("single connection mode, no longer listening");
                    listener = None;
                }
                match target.open(ctx, peer).await {
                    Ok(conn) => {
                        debug!(connection_id = conn.id(), peer = ?peer, "forwarding local client");
                        tokio::spawn(async move {
                            relay(conn, stream, chunk).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to open connection to gateway");
                    }
                }
            }
            queued = queue.recv() => {
                match queued {
                    Some(conn) => {
                        warn!(connection_id = conn.id(), "gateway tried to open a connection in listen mode, rejecting");
                        if let Err(e) = conn.reject().await {
                            debug!(connection_id = conn.id(), error = %e, "reject failed");
                        }
                    }
                    None => {
                        info!("connection queue closed, ending forward");
                        break;
                    }
                }
            }
        }
    }
}
