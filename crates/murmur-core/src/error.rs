use std::{io, net::SocketAddr};

use thiserror::Error;

/// Resource-fatal conditions at startup. Everything else is handled where
/// it happens and never crosses a session boundary.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("couldn't create the readiness demultiplexer: {0}")]
    Demux(#[source] io::Error),
    #[error("couldn't bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("couldn't register the listener: {0}")]
    RegisterListener(#[source] io::Error),
    #[error("couldn't spawn a worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),
    #[error("couldn't spawn the reactor thread: {0}")]
    ReactorSpawn(#[source] io::Error),
}

/// Why a session is being torn down. Logged once per disconnect.
#[derive(Debug, Error)]
pub enum DisconnectReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("socket error: {0}")]
    Io(#[source] io::Error),
    #[error("client sent EXIT")]
    Exit,
    #[error("name already taken")]
    NameCollision,
    #[error("frame body of {got} bytes exceeds the {limit} byte limit")]
    OversizeFrame { got: u64, limit: usize },
    #[error("write queue of {queued} bytes exceeds the {limit} byte limit")]
    QueueOverflow { queued: usize, limit: usize },
    #[error("server shutting down")]
    Shutdown,
}
