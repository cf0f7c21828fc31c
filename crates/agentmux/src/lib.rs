//! agentmux: multiplex many logical connections over one pair of byte streams.
//!
//! A [`ForwardCtx`] owns the shared transport (for example the stdin/stdout
//! pipe to an agent process), performs one of the setup handshakes, and runs a
//! dispatch loop that turns incoming packets into [`Connection`] state
//! transitions. Either side can dial logical connections with
//! [`ForwardCtx::open_tcp`] / [`ForwardCtx::open_unix`]; connections dialed by
//! the peer arrive on the [`AcceptQueue`] returned by the handshake.
//!
//! # Quick Start
//!
//! ```no_run
//! use agentmux::ForwardCtx;
//!
//! # async fn example() -> agentmux::MuxResult<()> {
//! let ctx = ForwardCtx::new(tokio::io::stdin(), tokio::io::stdout());
//! let mut queue = ctx.start_reverse_forward("127.0.0.1", 8080, false).await?;
//!
//! while let Some(conn) = queue.recv().await {
//!     conn.accept().await?;
//!     let mut buf = vec![0u8; 4096];
//!     let n = conn.read(&mut buf).await?;
//!     conn.write(&buf[..n]).await?;
//!     conn.close().await?;
//! }
//!
//! ctx.terminate().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod relay;

pub use config::ForwardConfig;
pub use connection::{CloseCallback, Connection, ConnectionState};
pub use context::{AcceptQueue, ForwardCtx};
pub use relay::{relay, RelayStats};

// Re-export protocol types for convenience.
pub use agentmux_core::{
    ConnectionType, MuxError, MuxResult, NewConnectionPayload, SetupPacket, PROTOCOL_TCP,
    PROTOCOL_UNIX,
};
