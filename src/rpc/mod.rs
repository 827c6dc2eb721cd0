//! RPC transport: a multiplexed [`client::Client`] (spec C3) and a serial
//! [`server::serve`] dispatch loop (spec C4), both built on the framing in
//! [`crate::wire`].

pub mod client;
pub mod server;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use client::{Client, ClientState};
pub use server::{serve, Handler};

use crate::error::{Error, Result};
use crate::wire::SERVER_READY;

/// Exchange the fixed handshake token before any framed traffic (spec §6).
/// Both sides write then read, so either can go first without deadlocking
/// as long as the stream is full-duplex (true of `TcpStream`/`UnixStream`).
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    stream.write_all(SERVER_READY).await.map_err(Error::from)?;
    let mut buf = vec![0u8; SERVER_READY.len()];
    stream.read_exact(&mut buf).await.map_err(Error::from)?;
    if buf != SERVER_READY {
        return Err(Error::BadMessage);
    }
    Ok(())
}

/// Read (without writing) the readiness token off a launched helper
/// process's stdout pipe. Distinct from [`handshake`]: this is the
/// launcher's one-way "has it bound its socket yet" probe, not the
/// two-way wire-level handshake the RPC client performs once connected.
pub async fn handshake_readback<S: AsyncRead + Unpin>(stream: &mut S) -> Result<()> {
    let mut buf = vec![0u8; SERVER_READY.len()];
    stream.read_exact(&mut buf).await.map_err(Error::from)?;
    if buf != SERVER_READY {
        return Err(Error::BadMessage);
    }
    Ok(())
}
