//! Binary RPC protocol between the host mount process and the on-device
//! helper (spec C2, §4.1, §6).
//!
//! A request frame is `request-id:u32 | procedure:u8 | body`. A response
//! frame is `request-id:u32 | procedure:u8 | status:u8 | body-if-status==0`.
//! Status `0` means success; any other value is a POSIX errno (spec §7).

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Maximum path length accepted on the wire.
pub const MAX_PATH_LEN: usize = 4096;

/// Handshake token exchanged before any framed traffic (spec §6).
pub const SERVER_READY: &[u8] = b"SERVER_IS_READY";

/// Procedure tags. Order is part of the wire contract — do not reorder
/// (spec §6 gives this exact sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Procedure {
    Stat = 0,
    Listdir,
    Readlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Truncate,
    Utimens,
    CopyFileRange,
    Open,
    Close,
    Read,
    Write,
}

impl Procedure {
    fn from_tag(tag: u8) -> Result<Self> {
        Procedure::from_u8(tag).ok_or(Error::BadMessage)
    }

    fn tag(self) -> u8 {
        self.to_u8().expect("Procedure fits in u8")
    }
}

/// Mode requested by the `Open` procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum OpenMode {
    Read = 0,
    Write = 1,
    ReadWrite = 2,
}

/// Flags for the `Rename` procedure (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum RenameFlags {
    None = 0,
    NoReplace = 1,
    Exchange = 2,
}

/// A timestamp as carried on the wire: signed seconds + nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireTime {
    pub seconds: i64,
    pub nanos: i64,
}

/// The special markers honored by `Utimens` (spec §4.4, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    Omit,
    Now,
    Set(WireTime),
}

const TS_OMIT: i64 = i64::MIN;
const TS_NOW: i64 = i64::MIN + 1;

async fn write_timespec<W: AsyncWrite + Unpin>(w: &mut W, ts: TimeSpec) -> Result<()> {
    let (seconds, nanos) = match ts {
        TimeSpec::Omit => (TS_OMIT, 0),
        TimeSpec::Now => (TS_NOW, 0),
        TimeSpec::Set(t) => (t.seconds, t.nanos),
    };
    w.write_i64(seconds).await.map_err(Error::from)?;
    w.write_i64(nanos).await.map_err(Error::from)
}

async fn read_timespec<R: AsyncRead + Unpin>(r: &mut R) -> Result<TimeSpec> {
    let seconds = r.read_i64().await.map_err(Error::from)?;
    let nanos = r.read_i64().await.map_err(Error::from)?;
    Ok(match seconds {
        TS_OMIT => TimeSpec::Omit,
        TS_NOW => TimeSpec::Now,
        _ => TimeSpec::Set(WireTime { seconds, nanos }),
    })
}

async fn write_str<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<()> {
    w.write_u64(s.len() as u64).await.map_err(Error::from)?;
    w.write_all(s.as_bytes()).await.map_err(Error::from)
}

async fn read_str<R: AsyncRead + Unpin>(r: &mut R, max_len: usize) -> Result<String> {
    let len = r.read_u64().await.map_err(Error::from)? as usize;
    if len > max_len {
        return Err(Error::BadMessage);
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await.map_err(Error::from)?;
    String::from_utf8(buf).map_err(|_| Error::BadMessage)
}

async fn write_bytes<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> Result<()> {
    w.write_u64(bytes.len() as u64).await.map_err(Error::from)?;
    w.write_all(bytes).await.map_err(Error::from)
}

async fn read_bytes<R: AsyncRead + Unpin>(r: &mut R, max_len: usize) -> Result<Vec<u8>> {
    let len = r.read_u64().await.map_err(Error::from)? as usize;
    if len > max_len {
        return Err(Error::BadMessage);
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await.map_err(Error::from)?;
    Ok(buf)
}

/// Attributes returned by `Stat` (and embedded in `Listdir` entries).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FileStat {
    pub size: i64,
    pub links: u32,
    pub mtime: WireTime,
    pub atime: WireTime,
    pub ctime: WireTime,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

async fn write_stat<W: AsyncWrite + Unpin>(w: &mut W, s: &FileStat) -> Result<()> {
    w.write_i64(s.size).await.map_err(Error::from)?;
    w.write_u32(s.links).await.map_err(Error::from)?;
    w.write_i64(s.mtime.seconds).await.map_err(Error::from)?;
    w.write_i64(s.mtime.nanos).await.map_err(Error::from)?;
    w.write_i64(s.atime.seconds).await.map_err(Error::from)?;
    w.write_i64(s.atime.nanos).await.map_err(Error::from)?;
    w.write_i64(s.ctime.seconds).await.map_err(Error::from)?;
    w.write_i64(s.ctime.nanos).await.map_err(Error::from)?;
    w.write_u32(s.mode).await.map_err(Error::from)?;
    w.write_u32(s.uid).await.map_err(Error::from)?;
    w.write_u32(s.gid).await.map_err(Error::from)
}

async fn read_stat<R: AsyncRead + Unpin>(r: &mut R) -> Result<FileStat> {
    let size = r.read_i64().await.map_err(Error::from)?;
    let links = r.read_u32().await.map_err(Error::from)?;
    let mtime = WireTime {
        seconds: r.read_i64().await.map_err(Error::from)?,
        nanos: r.read_i64().await.map_err(Error::from)?,
    };
    let atime = WireTime {
        seconds: r.read_i64().await.map_err(Error::from)?,
        nanos: r.read_i64().await.map_err(Error::from)?,
    };
    let ctime = WireTime {
        seconds: r.read_i64().await.map_err(Error::from)?,
        nanos: r.read_i64().await.map_err(Error::from)?,
    };
    let mode = r.read_u32().await.map_err(Error::from)?;
    let uid = r.read_u32().await.map_err(Error::from)?;
    let gid = r.read_u32().await.map_err(Error::from)?;
    Ok(FileStat { size, links, mtime, atime, ctime, mode, uid, gid })
}

/// A decoded request, tagged by [`Procedure`].
#[derive(Debug, Clone)]
pub enum Request {
    Stat { path: String },
    Listdir { path: String },
    Readlink { path: String },
    Mknod { path: String, mode: u32, dev: u64 },
    Mkdir { path: String, mode: u32 },
    Unlink { path: String },
    Rmdir { path: String },
    Rename { from: String, to: String, flags: RenameFlags },
    Truncate { path: String, size: i64 },
    Utimens { path: String, atime: TimeSpec, mtime: TimeSpec },
    CopyFileRange { in_path: String, in_offset: i64, out_path: String, out_offset: i64, size: u64 },
    Open { path: String, mode: OpenMode },
    Close { fd: u64 },
    Read { fd: u64, offset: i64, size: u32 },
    Write { fd: u64, offset: i64, data: Vec<u8> },
}

impl Request {
    pub fn procedure(&self) -> Procedure {
        match self {
            Request::Stat { .. } => Procedure::Stat,
            Request::Listdir { .. } => Procedure::Listdir,
            Request::Readlink { .. } => Procedure::Readlink,
            Request::Mknod { .. } => Procedure::Mknod,
            Request::Mkdir { .. } => Procedure::Mkdir,
            Request::Unlink { .. } => Procedure::Unlink,
            Request::Rmdir { .. } => Procedure::Rmdir,
            Request::Rename { .. } => Procedure::Rename,
            Request::Truncate { .. } => Procedure::Truncate,
            Request::Utimens { .. } => Procedure::Utimens,
            Request::CopyFileRange { .. } => Procedure::CopyFileRange,
            Request::Open { .. } => Procedure::Open,
            Request::Close { .. } => Procedure::Close,
            Request::Read { .. } => Procedure::Read,
            Request::Write { .. } => Procedure::Write,
        }
    }

    async fn encode_body<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        match self {
            Request::Stat { path } | Request::Listdir { path } | Request::Readlink { path } => {
                write_str(w, path).await
            }
            Request::Mknod { path, mode, dev } => {
                write_str(w, path).await?;
                w.write_u32(*mode).await.map_err(Error::from)?;
                w.write_u64(*dev).await.map_err(Error::from)
            }
            Request::Mkdir { path, mode } => {
                write_str(w, path).await?;
                w.write_u32(*mode).await.map_err(Error::from)
            }
            Request::Unlink { path } | Request::Rmdir { path } => write_str(w, path).await,
            Request::Rename { from, to, flags } => {
                write_str(w, from).await?;
                write_str(w, to).await?;
                w.write_u32(flags.to_u32().unwrap()).await.map_err(Error::from)
            }
            Request::Truncate { path, size } => {
                write_str(w, path).await?;
                w.write_i64(*size).await.map_err(Error::from)
            }
            Request::Utimens { path, atime, mtime } => {
                write_str(w, path).await?;
                write_timespec(w, *atime).await?;
                write_timespec(w, *mtime).await
            }
            Request::CopyFileRange { in_path, in_offset, out_path, out_offset, size } => {
                write_str(w, in_path).await?;
                w.write_i64(*in_offset).await.map_err(Error::from)?;
                write_str(w, out_path).await?;
                w.write_i64(*out_offset).await.map_err(Error::from)?;
                w.write_u64(*size).await.map_err(Error::from)
            }
            Request::Open { path, mode } => {
                write_str(w, path).await?;
                w.write_u8(mode.to_u8().unwrap()).await.map_err(Error::from)
            }
            Request::Close { fd } => w.write_u64(*fd).await.map_err(Error::from),
            Request::Read { fd, offset, size } => {
                w.write_u64(*fd).await.map_err(Error::from)?;
                w.write_i64(*offset).await.map_err(Error::from)?;
                w.write_u32(*size).await.map_err(Error::from)
            }
            Request::Write { fd, offset, data } => {
                w.write_u64(*fd).await.map_err(Error::from)?;
                w.write_i64(*offset).await.map_err(Error::from)?;
                write_bytes(w, data).await
            }
        }
    }

    async fn decode_body<R: AsyncRead + Unpin>(proc: Procedure, r: &mut R) -> Result<Self> {
        Ok(match proc {
            Procedure::Stat => Request::Stat { path: read_str(r, MAX_PATH_LEN).await? },
            Procedure::Listdir => Request::Listdir { path: read_str(r, MAX_PATH_LEN).await? },
            Procedure::Readlink => Request::Readlink { path: read_str(r, MAX_PATH_LEN).await? },
            Procedure::Mknod => {
                let path = read_str(r, MAX_PATH_LEN).await?;
                let mode = r.read_u32().await.map_err(Error::from)?;
                let dev = r.read_u64().await.map_err(Error::from)?;
                Request::Mknod { path, mode, dev }
            }
            Procedure::Mkdir => {
                let path = read_str(r, MAX_PATH_LEN).await?;
                let mode = r.read_u32().await.map_err(Error::from)?;
                Request::Mkdir { path, mode }
            }
            Procedure::Unlink => Request::Unlink { path: read_str(r, MAX_PATH_LEN).await? },
            Procedure::Rmdir => Request::Rmdir { path: read_str(r, MAX_PATH_LEN).await? },
            Procedure::Rename => {
                let from = read_str(r, MAX_PATH_LEN).await?;
                let to = read_str(r, MAX_PATH_LEN).await?;
                let flags = r.read_u32().await.map_err(Error::from)?;
                let flags = RenameFlags::from_u32(flags).ok_or(Error::BadMessage)?;
                Request::Rename { from, to, flags }
            }
            Procedure::Truncate => {
                let path = read_str(r, MAX_PATH_LEN).await?;
                let size = r.read_i64().await.map_err(Error::from)?;
                Request::Truncate { path, size }
            }
            Procedure::Utimens => {
                let path = read_str(r, MAX_PATH_LEN).await?;
                let atime = read_timespec(r).await?;
                let mtime = read_timespec(r).await?;
                Request::Utimens { path, atime, mtime }
            }
            Procedure::CopyFileRange => {
                let in_path = read_str(r, MAX_PATH_LEN).await?;
                let in_offset = r.read_i64().await.map_err(Error::from)?;
                let out_path = read_str(r, MAX_PATH_LEN).await?;
                let out_offset = r.read_i64().await.map_err(Error::from)?;
                let size = r.read_u64().await.map_err(Error::from)?;
                Request::CopyFileRange { in_path, in_offset, out_path, out_offset, size }
            }
            Procedure::Open => {
                let path = read_str(r, MAX_PATH_LEN).await?;
                let mode = r.read_u8().await.map_err(Error::from)?;
                let mode = OpenMode::from_u8(mode).ok_or(Error::BadMessage)?;
                Request::Open { path, mode }
            }
            Procedure::Close => Request::Close { fd: r.read_u64().await.map_err(Error::from)? },
            Procedure::Read => {
                let fd = r.read_u64().await.map_err(Error::from)?;
                let offset = r.read_i64().await.map_err(Error::from)?;
                let size = r.read_u32().await.map_err(Error::from)?;
                Request::Read { fd, offset, size }
            }
            Procedure::Write => {
                let fd = r.read_u64().await.map_err(Error::from)?;
                let offset = r.read_i64().await.map_err(Error::from)?;
                let data = read_bytes(r, usize::MAX).await?;
                Request::Write { fd, offset, data }
            }
        })
    }
}

/// A decoded response, tagged by [`Procedure`].
#[derive(Debug, Clone)]
pub enum Response {
    Stat(FileStat),
    Listdir { entries: Vec<(String, FileStat)> },
    Readlink { target: String },
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Truncate,
    Utimens,
    CopyFileRange { size: u64 },
    Open { fd: u64 },
    Close,
    Read { data: Vec<u8> },
    Write { size: u32 },
}

impl Response {
    pub fn procedure(&self) -> Procedure {
        match self {
            Response::Stat(_) => Procedure::Stat,
            Response::Listdir { .. } => Procedure::Listdir,
            Response::Readlink { .. } => Procedure::Readlink,
            Response::Mknod => Procedure::Mknod,
            Response::Mkdir => Procedure::Mkdir,
            Response::Unlink => Procedure::Unlink,
            Response::Rmdir => Procedure::Rmdir,
            Response::Rename => Procedure::Rename,
            Response::Truncate => Procedure::Truncate,
            Response::Utimens => Procedure::Utimens,
            Response::CopyFileRange { .. } => Procedure::CopyFileRange,
            Response::Open { .. } => Procedure::Open,
            Response::Close => Procedure::Close,
            Response::Read { .. } => Procedure::Read,
            Response::Write { .. } => Procedure::Write,
        }
    }

    async fn encode_body<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        match self {
            Response::Stat(stat) => write_stat(w, stat).await,
            Response::Listdir { entries } => {
                w.write_u64(entries.len() as u64).await.map_err(Error::from)?;
                for (name, stat) in entries {
                    write_str(w, name).await?;
                    write_stat(w, stat).await?;
                }
                Ok(())
            }
            Response::Readlink { target } => write_str(w, target).await,
            Response::Mknod
            | Response::Mkdir
            | Response::Unlink
            | Response::Rmdir
            | Response::Rename
            | Response::Truncate
            | Response::Utimens
            | Response::Close => Ok(()),
            Response::CopyFileRange { size } => w.write_u64(*size).await.map_err(Error::from),
            Response::Open { fd } => w.write_u64(*fd).await.map_err(Error::from),
            Response::Read { data } => write_bytes(w, data).await,
            Response::Write { size } => w.write_u32(*size).await.map_err(Error::from),
        }
    }

    async fn decode_body<R: AsyncRead + Unpin>(proc: Procedure, r: &mut R) -> Result<Self> {
        Ok(match proc {
            Procedure::Stat => Response::Stat(read_stat(r).await?),
            Procedure::Listdir => {
                let count = r.read_u64().await.map_err(Error::from)? as usize;
                let mut entries = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let name = read_str(r, MAX_PATH_LEN).await?;
                    let stat = read_stat(r).await?;
                    entries.push((name, stat));
                }
                Response::Listdir { entries }
            }
            Procedure::Readlink => Response::Readlink { target: read_str(r, MAX_PATH_LEN).await? },
            Procedure::Mknod => Response::Mknod,
            Procedure::Mkdir => Response::Mkdir,
            Procedure::Unlink => Response::Unlink,
            Procedure::Rmdir => Response::Rmdir,
            Procedure::Rename => Response::Rename,
            Procedure::Truncate => Response::Truncate,
            Procedure::Utimens => Response::Utimens,
            Procedure::CopyFileRange => {
                Response::CopyFileRange { size: r.read_u64().await.map_err(Error::from)? }
            }
            Procedure::Open => Response::Open { fd: r.read_u64().await.map_err(Error::from)? },
            Procedure::Close => Response::Close,
            Procedure::Read => Response::Read { data: read_bytes(r, usize::MAX).await? },
            Procedure::Write => Response::Write { size: r.read_u32().await.map_err(Error::from)? },
        })
    }
}

/// Write a full request frame: `request-id | procedure | body`.
pub async fn write_request<W: AsyncWrite + Unpin>(w: &mut W, id: u32, req: &Request) -> Result<()> {
    w.write_u32(id).await.map_err(Error::from)?;
    w.write_u8(req.procedure().tag()).await.map_err(Error::from)?;
    req.encode_body(w).await
}

/// Read a full request frame, returning its request-id and decoded body.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<(u32, Request)> {
    let id = r.read_u32().await.map_err(Error::from)?;
    let tag = r.read_u8().await.map_err(Error::from)?;
    let proc = Procedure::from_tag(tag)?;
    let req = Request::decode_body(proc, r).await?;
    Ok((id, req))
}

/// Write a full response frame: `request-id | procedure | status | body?`.
pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    id: u32,
    proc: Procedure,
    result: &std::result::Result<Response, Error>,
) -> Result<()> {
    w.write_u32(id).await.map_err(Error::from)?;
    w.write_u8(proc.tag()).await.map_err(Error::from)?;
    match result {
        Ok(resp) => {
            w.write_u8(0).await.map_err(Error::from)?;
            resp.encode_body(w).await
        }
        Err(e) => w.write_u8(e.to_errno() as u8).await.map_err(Error::from),
    }
}

/// Read a full response frame, returning its request-id, procedure, and
/// decoded result.
pub async fn read_response<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(u32, Procedure, std::result::Result<Response, Error>)> {
    let id = r.read_u32().await.map_err(Error::from)?;
    let tag = r.read_u8().await.map_err(Error::from)?;
    let proc = Procedure::from_tag(tag)?;
    let status = r.read_u8().await.map_err(Error::from)?;
    if status == 0 {
        let resp = Response::decode_body(proc, r).await?;
        Ok((id, proc, Ok(resp)))
    } else {
        Ok((id, proc, Err(Error::from_errno(status as i32))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn request_round_trip_for_every_procedure() {
        let reqs = vec![
            Request::Stat { path: "/a".into() },
            Request::Listdir { path: "/a".into() },
            Request::Readlink { path: "/a".into() },
            Request::Mknod { path: "/a".into(), mode: 0o644, dev: 0 },
            Request::Mkdir { path: "/a".into(), mode: 0o755 },
            Request::Unlink { path: "/a".into() },
            Request::Rmdir { path: "/a".into() },
            Request::Rename { from: "/a".into(), to: "/b".into(), flags: RenameFlags::Exchange },
            Request::Truncate { path: "/a".into(), size: 10 },
            Request::Utimens { path: "/a".into(), atime: TimeSpec::Now, mtime: TimeSpec::Omit },
            Request::CopyFileRange {
                in_path: "/a".into(),
                in_offset: 0,
                out_path: "/b".into(),
                out_offset: 5,
                size: 12,
            },
            Request::Open { path: "/a".into(), mode: OpenMode::ReadWrite },
            Request::Close { fd: 3 },
            Request::Read { fd: 3, offset: 0, size: 128 },
            Request::Write { fd: 3, offset: 0, data: vec![1, 2, 3] },
        ];

        for req in reqs {
            let mut buf = Vec::new();
            write_request(&mut buf, 42, &req).await.unwrap();
            let mut cur = Cursor::new(buf);
            let (id, decoded) = read_request(&mut cur).await.unwrap();
            assert_eq!(id, 42);
            assert_eq!(decoded.procedure(), req.procedure());
        }
    }

    #[tokio::test]
    async fn response_round_trip_ok_and_error() {
        let resp = Response::Listdir {
            entries: vec![(
                "f".to_string(),
                FileStat {
                    size: 5,
                    links: 1,
                    mtime: WireTime { seconds: 1, nanos: 2 },
                    atime: WireTime { seconds: 1, nanos: 2 },
                    ctime: WireTime { seconds: 1, nanos: 2 },
                    mode: 0o100644,
                    uid: 0,
                    gid: 0,
                },
            )],
        };
        let mut buf = Vec::new();
        write_response(&mut buf, 7, Procedure::Listdir, &Ok(resp)).await.unwrap();
        let mut cur = Cursor::new(buf);
        let (id, proc, result) = read_response(&mut cur).await.unwrap();
        assert_eq!(id, 7);
        assert_eq!(proc, Procedure::Listdir);
        assert!(result.is_ok());

        let mut buf = Vec::new();
        write_response(&mut buf, 8, Procedure::Stat, &Err(Error::NotFound)).await.unwrap();
        let mut cur = Cursor::new(buf);
        let (id, proc, result) = read_response(&mut cur).await.unwrap();
        assert_eq!(id, 8);
        assert_eq!(proc, Procedure::Stat);
        assert_eq!(result.unwrap_err(), Error::NotFound);
    }
}
