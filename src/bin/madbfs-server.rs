//! On-device RPC helper (spec C4, §6): listens on a TCP port forwarded from
//! the host, exchanges the wire handshake, then serves requests by mapping
//! each procedure onto a local syscall (spec §4.3).
//!
//! Writes the handshake token to its own stdout once bound, so the host's
//! launcher can detect readiness without racing the TCP connect itself
//! (mirrors the reference implementation's `prepare_and_create`).

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use madbfs::error::{Error, Result};
use madbfs::rpc::{self, Handler};
use madbfs::wire::{FileStat, OpenMode, RenameFlags, Request, Response, TimeSpec, WireTime};

#[derive(Parser)]
#[command(name = "madbfs-server")]
struct Args {
    /// TCP port to listen on, forwarded from the host via `adb forward`.
    #[arg(long, default_value_t = 12345)]
    port: u16,
}

const COPY_CHUNK: usize = 256 * 1024;

struct DeviceHandler {
    fds: Mutex<HashMap<u64, File>>,
    next_fd: AtomicU64,
}

impl DeviceHandler {
    fn new() -> Self {
        DeviceHandler { fds: Mutex::new(HashMap::new()), next_fd: AtomicU64::new(1) }
    }

    fn insert(&self, file: File) -> u64 {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.fds.lock().unwrap().insert(fd, file);
        fd
    }

    fn take(&self, fd: u64) -> Result<File> {
        self.fds.lock().unwrap().remove(&fd).ok_or(Error::BadFileDescriptor)
    }

    fn with<T>(&self, fd: u64, f: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let mut guard = self.fds.lock().unwrap();
        let file = guard.get_mut(&fd).ok_or(Error::BadFileDescriptor)?;
        f(file)
    }
}

fn cpath(path: &str) -> Result<CString> {
    CString::new(path).map_err(|_| Error::InvalidArgument)
}

fn stat_to_filestat(stat: nix::sys::stat::FileStat) -> FileStat {
    FileStat {
        size: stat.st_size,
        links: stat.st_nlink as u32,
        mtime: WireTime { seconds: stat.st_mtime, nanos: stat.st_mtime_nsec },
        atime: WireTime { seconds: stat.st_atime, nanos: stat.st_atime_nsec },
        ctime: WireTime { seconds: stat.st_ctime, nanos: stat.st_ctime_nsec },
        mode: stat.st_mode,
        uid: stat.st_uid,
        gid: stat.st_gid,
    }
}

fn do_stat(path: &str) -> Result<FileStat> {
    let stat = nix::sys::stat::lstat(Path::new(path)).map_err(Error::from)?;
    Ok(stat_to_filestat(stat))
}

fn do_listdir(path: &str) -> Result<Vec<(String, FileStat)>> {
    let dir = nix::dir::Dir::open(
        Path::new(path),
        nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_DIRECTORY,
        nix::sys::stat::Mode::empty(),
    )
    .map_err(Error::from)?;

    let base = Path::new(path);
    let mut entries = Vec::new();
    for entry in dir {
        let entry = entry.map_err(Error::from)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "." || name == ".." {
            continue;
        }
        let child = base.join(&name);
        let stat = match nix::sys::stat::lstat(&child) {
            Ok(s) => stat_to_filestat(s),
            Err(_) => continue,
        };
        entries.push((name, stat));
    }
    Ok(entries)
}

fn do_readlink(path: &str) -> Result<String> {
    let target = std::fs::read_link(path).map_err(Error::from)?;
    Ok(target.to_string_lossy().into_owned())
}

fn do_mknod(path: &str, mode: u32, dev: u64) -> Result<()> {
    let kind = nix::sys::stat::SFlag::from_bits_truncate(mode);
    let perm = nix::sys::stat::Mode::from_bits_truncate(mode);
    nix::sys::stat::mknod(Path::new(path), kind, perm, dev).map_err(Error::from)
}

fn do_mkdir(path: &str, mode: u32) -> Result<()> {
    let perm = nix::sys::stat::Mode::from_bits_truncate(mode);
    nix::unistd::mkdir(Path::new(path), perm).map_err(Error::from)
}

fn do_unlink(path: &str) -> Result<()> {
    nix::unistd::unlink(Path::new(path)).map_err(Error::from)
}

fn do_rmdir(path: &str) -> Result<()> {
    nix::unistd::rmdir(Path::new(path)).map_err(Error::from)
}

fn do_rename(from: &str, to: &str, flags: RenameFlags) -> Result<()> {
    let from = cpath(from)?;
    let to = cpath(to)?;
    let raw_flags: libc::c_uint = match flags {
        RenameFlags::None => 0,
        RenameFlags::NoReplace => libc::RENAME_NOREPLACE as libc::c_uint,
        RenameFlags::Exchange => libc::RENAME_EXCHANGE as libc::c_uint,
    };
    let rc = unsafe {
        libc::renameat2(libc::AT_FDCWD, from.as_ptr(), libc::AT_FDCWD, to.as_ptr(), raw_flags)
    };
    if rc != 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn do_truncate(path: &str, size: i64) -> Result<()> {
    nix::unistd::truncate(Path::new(path), size).map_err(Error::from)
}

fn timespec_to_raw(ts: TimeSpec) -> libc::timespec {
    match ts {
        TimeSpec::Omit => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
        TimeSpec::Now => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_NOW },
        TimeSpec::Set(t) => libc::timespec { tv_sec: t.seconds as libc::time_t, tv_nsec: t.nanos as _ },
    }
}

fn do_utimens(path: &str, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
    let path = cpath(path)?;
    let times = [timespec_to_raw(atime), timespec_to_raw(mtime)];
    let rc = unsafe {
        libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW)
    };
    if rc != 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn do_copy_file_range(in_path: &str, in_offset: i64, out_path: &str, out_offset: i64, size: u64) -> Result<u64> {
    let mut src = File::open(in_path).map_err(Error::from)?;
    let mut dst = OpenOptions::new().write(true).create(true).open(out_path).map_err(Error::from)?;
    src.seek(SeekFrom::Start(in_offset as u64)).map_err(Error::from)?;
    dst.seek(SeekFrom::Start(out_offset as u64)).map_err(Error::from)?;

    let mut remaining = size as usize;
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_CHUNK];
    while remaining > 0 {
        let chunk = remaining.min(COPY_CHUNK);
        let n = src.read(&mut buf[..chunk]).map_err(Error::from)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).map_err(Error::from)?;
        total += n as u64;
        remaining -= n;
    }
    Ok(total)
}

fn do_open(handler: &DeviceHandler, path: &str, mode: OpenMode) -> Result<u64> {
    let mut opts = OpenOptions::new();
    match mode {
        OpenMode::Read => { opts.read(true); }
        OpenMode::Write => { opts.write(true).create(true); }
        OpenMode::ReadWrite => { opts.read(true).write(true).create(true); }
    }
    opts.mode(0o644);
    let file = opts.open(path).map_err(Error::from)?;
    Ok(handler.insert(file))
}

fn do_read(handler: &DeviceHandler, fd: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
    handler.with(fd, |file| {
        file.seek(SeekFrom::Start(offset as u64)).map_err(Error::from)?;
        let mut buf = vec![0u8; size as usize];
        let n = file.read(&mut buf).map_err(Error::from)?;
        buf.truncate(n);
        Ok(buf)
    })
}

fn do_write(handler: &DeviceHandler, fd: u64, offset: i64, data: &[u8]) -> Result<u32> {
    handler.with(fd, |file| {
        file.seek(SeekFrom::Start(offset as u64)).map_err(Error::from)?;
        file.write_all(data).map_err(Error::from)?;
        Ok(data.len() as u32)
    })
}

#[async_trait]
impl Handler for DeviceHandler {
    async fn call(&self, request: Request) -> Result<Response> {
        match request {
            Request::Stat { path } => do_stat(&path).map(Response::Stat),
            Request::Listdir { path } => do_listdir(&path).map(|entries| Response::Listdir { entries }),
            Request::Readlink { path } => do_readlink(&path).map(|target| Response::Readlink { target }),
            Request::Mknod { path, mode, dev } => do_mknod(&path, mode, dev).map(|()| Response::Mknod),
            Request::Mkdir { path, mode } => do_mkdir(&path, mode).map(|()| Response::Mkdir),
            Request::Unlink { path } => do_unlink(&path).map(|()| Response::Unlink),
            Request::Rmdir { path } => do_rmdir(&path).map(|()| Response::Rmdir),
            Request::Rename { from, to, flags } => do_rename(&from, &to, flags).map(|()| Response::Rename),
            Request::Truncate { path, size } => do_truncate(&path, size).map(|()| Response::Truncate),
            Request::Utimens { path, atime, mtime } => do_utimens(&path, atime, mtime).map(|()| Response::Utimens),
            Request::CopyFileRange { in_path, in_offset, out_path, out_offset, size } => {
                do_copy_file_range(&in_path, in_offset, &out_path, out_offset, size)
                    .map(|size| Response::CopyFileRange { size })
            }
            Request::Open { path, mode } => do_open(self, &path, mode).map(|fd| Response::Open { fd }),
            Request::Close { fd } => {
                self.take(fd)?;
                Ok(Response::Close)
            }
            Request::Read { fd, offset, size } => do_read(self, fd, offset, size).map(|data| Response::Read { data }),
            Request::Write { fd, offset, data } => do_write(self, fd, offset, &data).map(|size| Response::Write { size }),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args = Args::parse();
    let listener = match TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("madbfs-server: bind failed: {e}");
            std::process::exit(1);
        }
    };

    // Readiness probe for the host launcher (spec §6): a one-way token on
    // our own stdout, distinct from the wire handshake done per connection.
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(madbfs::wire::SERVER_READY);
    let _ = stdout.flush();

    info!(port = args.port, "madbfs-server listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream).await {
                warn!(peer = %peer, error = ?e, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream) -> Result<()> {
    rpc::handshake(&mut stream).await?;
    let handler = DeviceHandler::new();
    rpc::serve(stream, handler).await
}
