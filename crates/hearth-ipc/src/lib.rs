//! Local-only IPC transport for the Hearth kernel.
//!
//! This crate carries the boundary between the kernel and the external
//! shell process:
//!
//! - **[`wire`]** -- the JSON wire message (`{"type": ..., "data": {...}}`
//!   with a flat, string-typed data map), encoded with `serde_json` and
//!   framed one message per line.
//! - **[`server`]** -- a Unix-domain-socket server with a dedicated accept
//!   thread, per-type message handlers, and an outbound queue drained to
//!   the connected client.
//!
//! All communication is local to the machine; there is no network surface.

pub mod server;
pub mod wire;

pub use server::IpcServer;
pub use wire::WireMessage;

/// Errors produced by the IPC transport.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Binding the listening socket failed.
    #[error("failed to bind ipc socket {}: {source}", path.display())]
    Bind {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// A send was attempted with no client on the other end.
    #[error("no client connected")]
    NotConnected,

    /// Writing to the connected client failed.
    #[error("ipc write failed: {0}")]
    Write(#[source] std::io::Error),

    /// A message could not be encoded for the wire.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Convenience alias for transport results.
pub type Result<T> = std::result::Result<T, IpcError>;
