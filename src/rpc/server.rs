//! Serial per-connection RPC dispatch loop (spec C4).
//!
//! Unlike the client, the server does not need to multiplex: each
//! connection is served by a single task that reads a request, awaits the
//! handler, writes the response, and reads the next request. Concurrent
//! connections (if any) each get their own task and their own handler
//! instance.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::wire::{self, Request, Response};

/// Implemented by whatever owns the real filesystem syscalls on the
/// device-side helper (spec C4, §4.8's server counterpart).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: Request) -> Result<Response>;
}

/// Serve RPC requests on a single connection until the peer disconnects or
/// the handler stops (spec C4).
pub async fn serve<S, H>(mut stream: S, handler: H) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Handler,
{
    loop {
        let (id, request) = match wire::read_request(&mut stream).await {
            Ok(pair) => pair,
            Err(Error::BrokenPipe) => {
                debug!("peer closed connection");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let proc = request.procedure();
        let result = handler.call(request).await;
        if let Err(ref e) = result {
            warn!(?proc, error = ?e, "rpc handler returned error");
        }

        wire::write_response(&mut stream, id, proc, &result).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{FileStat, WireTime};
    use tokio::net::{UnixListener, UnixStream};

    struct EchoStat;

    #[async_trait]
    impl Handler for EchoStat {
        async fn call(&self, request: Request) -> Result<Response> {
            match request {
                Request::Stat { .. } => Ok(Response::Stat(FileStat {
                    size: 7,
                    links: 1,
                    mtime: WireTime { seconds: 0, nanos: 0 },
                    atime: WireTime { seconds: 0, nanos: 0 },
                    ctime: WireTime { seconds: 0, nanos: 0 },
                    mode: 0o100644,
                    uid: 0,
                    gid: 0,
                })),
                Request::Unlink { .. } => Err(Error::NotFound),
                _ => Err(Error::NotSupported),
            }
        }
    }

    #[tokio::test]
    async fn serves_multiple_requests_on_one_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server_task = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            serve(sock, EchoStat).await.unwrap();
        });

        let mut client_sock = UnixStream::connect(&path).await.unwrap();
        wire::write_request(&mut client_sock, 1, &Request::Stat { path: "/a".into() })
            .await
            .unwrap();
        let (id, proc, result) = wire::read_response(&mut client_sock).await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(proc, crate::wire::Procedure::Stat);
        assert!(result.is_ok());

        wire::write_request(&mut client_sock, 2, &Request::Unlink { path: "/a".into() })
            .await
            .unwrap();
        let (id, _, result) = wire::read_response(&mut client_sock).await.unwrap();
        assert_eq!(id, 2);
        assert_eq!(result.unwrap_err(), Error::NotFound);

        drop(client_sock);
        server_task.await.unwrap();
    }
}
