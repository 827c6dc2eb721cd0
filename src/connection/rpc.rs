//! RPC-backed [`Connection`] (spec C5, fast path): one wire request per
//! call, grounded directly on `rpc::Client::send_req`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::Connection;
use crate::error::{Error, Result};
use crate::rpc::Client;
use crate::wire::{FileStat, OpenMode, RenameFlags, Request, Response, TimeSpec};

/// Speaks the binary RPC protocol to the on-device helper over a single
/// multiplexed [`Client`] connection.
pub struct RpcConnection {
    client: Client,
    // Millis; 0 means no timeout. Stored atomically (not `Cell`) so the type
    // stays `Sync`, required by the `Connection: Send + Sync` supertrait.
    timeout_ms: AtomicU64,
}

impl RpcConnection {
    pub fn new(client: Client, timeout: Option<Duration>) -> Self {
        Self { client, timeout_ms: AtomicU64::new(Self::encode(timeout)) }
    }

    fn encode(timeout: Option<Duration>) -> u64 {
        timeout.map(|d| d.as_millis().max(1) as u64).unwrap_or(0)
    }

    fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    async fn call(&self, req: Request) -> Result<Response> {
        self.client.send_req(req, self.timeout()).await
    }
}

#[async_trait]
impl Connection for RpcConnection {
    fn set_timeout(&self, timeout: Option<Duration>) {
        self.timeout_ms.store(Self::encode(timeout), Ordering::Relaxed);
    }

    async fn statdir(&self, path: &str) -> Result<Vec<(String, FileStat)>> {
        match self.call(Request::Listdir { path: path.to_string() }).await? {
            Response::Listdir { entries } => Ok(entries),
            _ => Err(Error::BadMessage),
        }
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        match self.call(Request::Stat { path: path.to_string() }).await? {
            Response::Stat(stat) => Ok(stat),
            _ => Err(Error::BadMessage),
        }
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        match self.call(Request::Readlink { path: path.to_string() }).await? {
            Response::Readlink { target } => Ok(target),
            _ => Err(Error::BadMessage),
        }
    }

    async fn mknod(&self, path: &str, mode: u32, dev: u64) -> Result<()> {
        match self.call(Request::Mknod { path: path.to_string(), mode, dev }).await? {
            Response::Mknod => Ok(()),
            _ => Err(Error::BadMessage),
        }
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        match self.call(Request::Mkdir { path: path.to_string(), mode }).await? {
            Response::Mkdir => Ok(()),
            _ => Err(Error::BadMessage),
        }
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        match self.call(Request::Unlink { path: path.to_string() }).await? {
            Response::Unlink => Ok(()),
            _ => Err(Error::BadMessage),
        }
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        match self.call(Request::Rmdir { path: path.to_string() }).await? {
            Response::Rmdir => Ok(()),
            _ => Err(Error::BadMessage),
        }
    }

    async fn rename(&self, from: &str, to: &str, flags: RenameFlags) -> Result<()> {
        let req = Request::Rename { from: from.to_string(), to: to.to_string(), flags };
        match self.call(req).await? {
            Response::Rename => Ok(()),
            _ => Err(Error::BadMessage),
        }
    }

    async fn truncate(&self, path: &str, size: i64) -> Result<()> {
        match self.call(Request::Truncate { path: path.to_string(), size }).await? {
            Response::Truncate => Ok(()),
            _ => Err(Error::BadMessage),
        }
    }

    async fn read(&self, path: &str, buf: &mut [u8], offset: i64) -> Result<usize> {
        let open = self.call(Request::Open { path: path.to_string(), mode: OpenMode::Read }).await?;
        let fd = match open {
            Response::Open { fd } => fd,
            _ => return Err(Error::BadMessage),
        };

        let result = async {
            let resp = self.call(Request::Read { fd, offset, size: buf.len() as u32 }).await?;
            match resp {
                Response::Read { data } => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                _ => Err(Error::BadMessage),
            }
        }
        .await;

        let _ = self.call(Request::Close { fd }).await;
        result
    }

    async fn write(&self, path: &str, data: &[u8], offset: i64) -> Result<usize> {
        let open = self.call(Request::Open { path: path.to_string(), mode: OpenMode::Write }).await?;
        let fd = match open {
            Response::Open { fd } => fd,
            _ => return Err(Error::BadMessage),
        };

        let result = async {
            let resp = self.call(Request::Write { fd, offset, data: data.to_vec() }).await?;
            match resp {
                Response::Write { size } => Ok(size as usize),
                _ => Err(Error::BadMessage),
            }
        }
        .await;

        let _ = self.call(Request::Close { fd }).await;
        result
    }

    async fn utimens(&self, path: &str, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
        let req = Request::Utimens { path: path.to_string(), atime, mtime };
        match self.call(req).await? {
            Response::Utimens => Ok(()),
            _ => Err(Error::BadMessage),
        }
    }

    async fn copy_file_range(
        &self,
        in_path: &str,
        in_offset: i64,
        out_path: &str,
        out_offset: i64,
        size: u64,
    ) -> Result<u64> {
        let req = Request::CopyFileRange {
            in_path: in_path.to_string(),
            in_offset,
            out_path: out_path.to_string(),
            out_offset,
            size,
        };
        match self.call(req).await? {
            Response::CopyFileRange { size } => Ok(size),
            _ => Err(Error::BadMessage),
        }
    }
}
