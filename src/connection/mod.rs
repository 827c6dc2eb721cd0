//! Abstract remote-operations interface exposed to the file tree (spec C5).
//!
//! Two implementations exist: [`rpc::RpcConnection`] (fast path, speaks the
//! binary wire protocol to the on-device helper) and [`shell::ShellConnection`]
//! (fallback, shells out to `adb shell` when no helper is reachable). The
//! tree depends only on the [`Connection`] trait.

pub mod rpc;
pub mod shell;

use async_trait::async_trait;

use crate::error::Result;
use crate::wire::{FileStat, RenameFlags, TimeSpec};

pub use rpc::RpcConnection;
pub use shell::ShellConnection;

/// Remote filesystem verbs the tree needs, independent of transport.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Reconfigure the per-request timeout (control op `set_timeout`, spec
    /// §4.8). Transports without a meaningful notion of one (the shell
    /// fallback) ignore this.
    fn set_timeout(&self, _timeout: Option<std::time::Duration>) {}

    async fn statdir(&self, path: &str) -> Result<Vec<(String, FileStat)>>;
    async fn stat(&self, path: &str) -> Result<FileStat>;
    async fn readlink(&self, path: &str) -> Result<String>;

    async fn mknod(&self, path: &str, mode: u32, dev: u64) -> Result<()>;
    async fn mkdir(&self, path: &str, mode: u32) -> Result<()>;
    async fn unlink(&self, path: &str) -> Result<()>;
    async fn rmdir(&self, path: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str, flags: RenameFlags) -> Result<()>;
    async fn truncate(&self, path: &str, size: i64) -> Result<()>;

    async fn read(&self, path: &str, buf: &mut [u8], offset: i64) -> Result<usize>;
    async fn write(&self, path: &str, data: &[u8], offset: i64) -> Result<usize>;

    async fn utimens(&self, path: &str, atime: TimeSpec, mtime: TimeSpec) -> Result<()>;

    async fn copy_file_range(
        &self,
        in_path: &str,
        in_offset: i64,
        out_path: &str,
        out_offset: i64,
        size: u64,
    ) -> Result<u64>;
}
