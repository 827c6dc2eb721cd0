//! Multiplexed RPC client (spec C3).
//!
//! A single background task (the "driver") owns both socket halves and the
//! in-flight request table. Callers never touch the socket directly; they
//! hand a [`Request`] to [`Client::send_req`], which is fulfilled by a
//! `oneshot` reply once the driver reads the matching response back off the
//! wire. This mirrors the split-task shape the rest of the crate's transport
//! layer uses (a dedicated task per socket direction, joined by channels)
//! but collapses reader+writer into one task since requests and responses
//! share a single in-flight table that must not be touched from two places
//! at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::wire::{self, Request, Response};

enum Command {
    Send { id: u32, req: Request, respond_to: oneshot::Sender<Result<Response>> },
    Shutdown,
}

/// Lifecycle state of a [`Client`] (spec C3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Started,
    Stopping,
    Closed,
}

/// RPC client multiplexing requests over a single byte stream.
///
/// `S` is generic over any split-able duplex stream (`TcpStream`,
/// `UnixStream`) so the same client drives both the TCP connection to the
/// on-device server and, in principle, any other transport.
pub struct Client {
    cmd_tx: mpsc::Sender<Command>,
    driver: JoinHandle<()>,
    counter: Arc<AtomicU32>,
    state: Arc<std::sync::Mutex<ClientState>>,
}

impl Client {
    /// Wrap an already-connected, already-handshaken stream and spawn the
    /// driver task. The client is immediately in the `Started` state.
    pub fn start<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let state = Arc::new(std::sync::Mutex::new(ClientState::Started));

        let driver = tokio::spawn(Self::drive_impl(read_half, write_half, cmd_rx, state.clone()));

        Self { cmd_tx, driver, counter: Arc::new(AtomicU32::new(0)), state }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.state.lock().expect("state mutex poisoned")
    }

    /// True while the driver task is still accepting requests.
    pub fn running(&self) -> bool {
        self.state() == ClientState::Started
    }

    /// Send a request and await its matching response, optionally bounded
    /// by a timeout (spec C3, §6 `--timeout`).
    pub async fn send_req(&self, req: Request, timeout: Option<Duration>) -> Result<Response> {
        if !self.running() {
            return Err(Error::NotConnected);
        }

        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(Command::Send { id, req, respond_to: tx })
            .await
            .map_err(|_| Error::NotConnected)?;

        let wait = async { rx.await.map_err(|_| Error::NotConnected)? };
        match timeout {
            Some(d) => tokio::time::timeout(d, wait).await.map_err(|_| Error::TimedOut)?,
            None => wait.await,
        }
    }

    /// Stop the driver task and close the socket. Idempotent.
    pub async fn stop(&self) {
        *self.state.lock().expect("state mutex poisoned") = ClientState::Stopping;
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    async fn drive_impl<S>(
        mut read_half: ReadHalf<S>,
        mut write_half: WriteHalf<S>,
        mut cmd_rx: mpsc::Receiver<Command>,
        state: Arc<std::sync::Mutex<ClientState>>,
    ) where
        S: AsyncRead + AsyncWrite,
    {
        let mut inflight: HashMap<u32, oneshot::Sender<Result<Response>>> = HashMap::new();

        let fail_all = |inflight: &mut HashMap<u32, oneshot::Sender<Result<Response>>>, err: Error| {
            for (_, tx) in inflight.drain() {
                let _ = tx.send(Err(err));
            }
        };

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Send { id, req, respond_to }) => {
                            if let Err(e) = wire::write_request(&mut write_half, id, &req).await {
                                let _ = respond_to.send(Err(e));
                                fail_all(&mut inflight, e);
                                break;
                            }
                            inflight.insert(id, respond_to);
                        }
                        Some(Command::Shutdown) | None => {
                            fail_all(&mut inflight, Error::OperationCanceled);
                            break;
                        }
                    }
                }
                resp = wire::read_response(&mut read_half) => {
                    match resp {
                        Ok((id, proc, result)) => {
                            trace!(?proc, id, "rpc response received");
                            if let Some(tx) = inflight.remove(&id) {
                                let _ = tx.send(result);
                            } else {
                                warn!(id, "response for unknown request id");
                            }
                        }
                        Err(e) => {
                            debug!(error = ?e, "rpc connection read failed, closing client");
                            fail_all(&mut inflight, e);
                            break;
                        }
                    }
                }
            }
        }

        *state.lock().expect("state mutex poisoned") = ClientState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Procedure;
    use tokio::net::{UnixListener, UnixStream};

    async fn pair() -> (UnixStream, UnixStream) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = UnixListener::bind(&path).unwrap();
        let connect = UnixStream::connect(&path);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn single_request_round_trips() {
        let (server_sock, client_sock) = pair().await;
        let client = Client::start(client_sock);

        tokio::spawn(async move {
            let mut sock = server_sock;
            let (id, req) = wire::read_request(&mut sock).await.unwrap();
            assert_eq!(req.procedure(), Procedure::Stat);
            let resp = Response::Stat(crate::wire::FileStat {
                size: 42,
                links: 1,
                mtime: crate::wire::WireTime { seconds: 0, nanos: 0 },
                atime: crate::wire::WireTime { seconds: 0, nanos: 0 },
                ctime: crate::wire::WireTime { seconds: 0, nanos: 0 },
                mode: 0o100644,
                uid: 0,
                gid: 0,
            });
            wire::write_response(&mut sock, id, Procedure::Stat, &Ok(resp)).await.unwrap();
        });

        let resp = client
            .send_req(Request::Stat { path: "/a".into() }, None)
            .await
            .unwrap();
        match resp {
            Response::Stat(stat) => assert_eq!(stat.size, 42),
            _ => panic!("wrong response variant"),
        }
    }

    #[tokio::test]
    async fn timeout_elapses_when_server_never_replies() {
        let (_server_sock, client_sock) = pair().await;
        let client = Client::start(client_sock);
        let result = client
            .send_req(Request::Stat { path: "/a".into() }, Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(Error::TimedOut)));
    }
}
