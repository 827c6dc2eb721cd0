//! Control endpoint (spec C9): a local stream socket accepting one
//! length-prefixed JSON command per connection.
//!
//! Framing is `len:u32 (big-endian) | json-bytes`, request and response
//! alike, mirroring the wire module's own length-prefix convention. `logcat`
//! is the one op that doesn't close after replying: it keeps forwarding
//! further frames for each line the logging layer broadcasts.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::cache::PageCache;
use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::log::{self, LogHandle, LogcatLayer};
use crate::tree::FileTree;

const MAX_MESSAGE_LEN: usize = 4 * 1024;

/// Inbound command, one per connection unless `op == "logcat"`.
#[derive(Debug, Deserialize)]
struct Command {
    op: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct Reply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl Reply {
    fn ok() -> Self {
        Reply { ok: true, message: None }
    }

    fn ok_with(message: impl Into<String>) -> Self {
        Reply { ok: true, message: Some(message.into()) }
    }

    fn err(message: impl Into<String>) -> Self {
        Reply { ok: false, message: Some(message.into()) }
    }
}

/// Shared state the control endpoint can act on (spec §4.8).
pub struct ControlState {
    pub cache: Rc<PageCache>,
    pub tree: Rc<FileTree>,
    pub logcat: Arc<LogcatLayer>,
    pub log_handle: LogHandle,
    pub version: &'static str,
}

const MIN_PAGE_SIZE_KIB: usize = 64;
const MAX_PAGE_SIZE_KIB: usize = 4096;
const MIN_CACHE_PAGES: usize = 128;

fn next_pow2(x: usize) -> usize {
    if x <= 1 {
        1
    } else {
        1usize << (usize::BITS - (x - 1).leading_zeros())
    }
}

/// The path a control socket is bound at: `madbfs@<serial>.sock` under the
/// user's runtime directory (spec §6).
pub fn socket_path(serial: &str) -> PathBuf {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    runtime_dir.join(format!("madbfs@{serial}.sock"))
}

/// Bind and serve the control endpoint until cancelled. Intended to run on
/// the same single-threaded executor as the rest of the core (spec §5);
/// callers treat bind/accept failures as non-fatal.
pub async fn serve(path: PathBuf, state: Rc<ControlState>) -> Result<()> {
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).map_err(Error::from)?;
    info!(path = %path.display(), "control endpoint listening");

    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "control endpoint accept failed");
                continue;
            }
        };
        let state = state.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = handle_connection(stream, state).await {
                debug!(error = ?e, "control connection ended with error");
            }
        });
    }
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let len = stream.read_u32().await.map_err(Error::from)? as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::BadMessage);
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(Error::from)?;
    Ok(buf)
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream.write_u32(bytes.len() as u32).await.map_err(Error::from)?;
    stream.write_all(bytes).await.map_err(Error::from)
}

async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, reply: &Reply) -> Result<()> {
    let bytes = serde_json::to_vec(reply).map_err(|_| Error::BadMessage)?;
    write_frame(stream, &bytes).await
}

async fn handle_connection(mut stream: UnixStream, state: Rc<ControlState>) -> Result<()> {
    let frame = read_frame(&mut stream).await?;
    let command: Command = match serde_json::from_slice(&frame) {
        Ok(c) => c,
        Err(e) => {
            write_reply(&mut stream, &Reply::err(format!("bad command: {e}"))).await?;
            return Ok(());
        }
    };

    if command.op == "logcat" {
        write_reply(&mut stream, &Reply::ok_with("streaming")).await?;
        return stream_logcat(stream, &state).await;
    }

    let reply = dispatch(&command, &state).await;
    write_reply(&mut stream, &reply).await
}

async fn dispatch(command: &Command, state: &ControlState) -> Reply {
    match command.op.as_str() {
        "help" => Reply::ok_with(
            "ops: help, version, info, invalidate_cache, set_page_size, set_cache_size, \
             set_ttl, set_timeout, set_log_level, logcat",
        ),
        "version" => Reply::ok_with(state.version),
        "info" => Reply::ok_with(format!(
            "page_size={} max_pages={}",
            state.cache.page_size(),
            state.cache.max_pages()
        )),
        "invalidate_cache" => match state.tree.invalidate_all_cache().await {
            Ok(()) => Reply::ok(),
            Err(e) => Reply::err(e.to_string()),
        },
        "set_page_size" => match command.value.as_ref().and_then(|v| v.as_u64()) {
            Some(kib) => {
                let kib = (kib as usize).clamp(MIN_PAGE_SIZE_KIB, MAX_PAGE_SIZE_KIB);
                state.cache.set_page_size(next_pow2(kib) * 1024);
                Reply::ok()
            }
            None => Reply::err("set_page_size requires an integer KiB value"),
        },
        "set_cache_size" => match command.value.as_ref().and_then(|v| v.as_u64()) {
            Some(mib) => {
                let bytes = (mib as usize) * 1024 * 1024;
                let pages = (bytes / state.cache.page_size()).max(MIN_CACHE_PAGES);
                state.cache.set_max_pages(pages);
                Reply::ok()
            }
            None => Reply::err("set_cache_size requires an integer MiB value"),
        },
        "set_ttl" => match command.value.as_ref().and_then(|v| v.as_u64()) {
            Some(secs) => {
                state.tree.set_ttl(std::time::Duration::from_secs(secs));
                Reply::ok()
            }
            None => Reply::err("set_ttl requires an integer seconds value"),
        },
        "set_timeout" => match command.value.as_ref().and_then(|v| v.as_u64()) {
            Some(secs) => {
                let timeout =
                    if secs == 0 { None } else { Some(std::time::Duration::from_secs(secs)) };
                state.tree.set_request_timeout(timeout);
                Reply::ok()
            }
            None => Reply::err("set_timeout requires an integer seconds value"),
        },
        "set_log_level" => match command.value.as_ref().and_then(|v| v.as_str()).and_then(parse_log_level) {
            Some(level) => match log::set_level(&state.log_handle, level) {
                Ok(()) => Reply::ok(),
                Err(e) => Reply::err(e.to_string()),
            },
            None => Reply::err("set_log_level requires a known level name"),
        },
        other => Reply::err(format!("unknown op: {other}")),
    }
}

fn parse_log_level(s: &str) -> Option<LogLevel> {
    use clap::ValueEnum;
    LogLevel::from_str(s, true).ok()
}

async fn stream_logcat(mut stream: UnixStream, state: &ControlState) -> Result<()> {
    let mut rx = state.logcat.subscribe();
    loop {
        tokio::select! {
            line = rx.recv() => {
                let line = match line {
                    Ok(line) => line,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                };
                if write_frame(&mut stream, line.as_bytes()).await.is_err() {
                    return Ok(());
                }
            }
            // A closed peer surfaces as a zero-length read; stop streaming.
            n = stream.read_u8() => {
                if n.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
