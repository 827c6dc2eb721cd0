//! POSIX-flavored error taxonomy shared by every layer of the crate.
//!
//! Every remote operation (connection, cache, tree) resolves to either success
//! or one of the variants below (spec §7). The taxonomy is deliberately small
//! and maps cleanly onto `libc` errno values on one side and FUSE's `Errno` on
//! the other, so a single type threads all the way from the wire to the
//! kernel callback reply.

use std::io;

/// Error taxonomy reused across the wire, the cache, and the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("file exists")]
    FileExists,
    #[error("permission denied")]
    PermissionDenied,
    #[error("read-only file system")]
    ReadOnlyFilesystem,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not supported")]
    NotSupported,
    #[error("filename too long")]
    NameTooLong,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("not connected")]
    NotConnected,
    #[error("timed out")]
    TimedOut,
    #[error("operation canceled")]
    OperationCanceled,
    #[error("resource temporarily unavailable")]
    TryAgain,
    #[error("I/O error")]
    Io,
    #[error("bad message")]
    BadMessage,
}

impl Error {
    /// Whether this error is transient: a revalidating [`crate::tree`] must
    /// never let a transient failure overwrite a node's last-known kind
    /// (spec §4.6, §7).
    pub fn is_transient(self) -> bool {
        matches!(self, Error::NotConnected | Error::TimedOut)
    }

    /// Map to the POSIX errno carried as the wire status byte (spec §4.1).
    pub fn to_errno(self) -> i32 {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::DirectoryNotEmpty => libc::ENOTEMPTY,
            Error::FileExists => libc::EEXIST,
            Error::PermissionDenied => libc::EACCES,
            Error::ReadOnlyFilesystem => libc::EROFS,
            Error::InvalidArgument => libc::EINVAL,
            Error::NotSupported => libc::ENOTSUP,
            Error::NameTooLong => libc::ENAMETOOLONG,
            Error::BadFileDescriptor => libc::EBADF,
            Error::BrokenPipe => libc::EPIPE,
            Error::NotConnected => libc::ENOTCONN,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::OperationCanceled => libc::ECANCELED,
            Error::TryAgain => libc::EAGAIN,
            Error::Io => libc::EIO,
            Error::BadMessage => libc::EBADMSG,
        }
    }

    /// Recover an [`Error`] from a raw POSIX errno (wire status byte, or a
    /// `libc`/`nix` syscall failure on the server side).
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => Error::NotFound,
            libc::ENOTDIR => Error::NotADirectory,
            libc::EISDIR => Error::IsADirectory,
            libc::ENOTEMPTY => Error::DirectoryNotEmpty,
            libc::EEXIST => Error::FileExists,
            libc::EACCES | libc::EPERM => Error::PermissionDenied,
            libc::EROFS => Error::ReadOnlyFilesystem,
            libc::EINVAL => Error::InvalidArgument,
            libc::ENOTSUP => Error::NotSupported,
            libc::ENAMETOOLONG => Error::NameTooLong,
            libc::EBADF => Error::BadFileDescriptor,
            libc::EPIPE => Error::BrokenPipe,
            libc::ENOTCONN => Error::NotConnected,
            libc::ETIMEDOUT => Error::TimedOut,
            libc::ECANCELED => Error::OperationCanceled,
            libc::EAGAIN => Error::TryAgain,
            libc::EBADMSG => Error::BadMessage,
            _ => Error::Io,
        }
    }

    /// Map to `fuser`'s errno newtype for a callback reply.
    pub fn to_fuser_errno(self) -> i32 {
        self.to_errno()
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound,
            io::ErrorKind::PermissionDenied => Error::PermissionDenied,
            io::ErrorKind::AlreadyExists => Error::FileExists,
            io::ErrorKind::BrokenPipe => Error::BrokenPipe,
            io::ErrorKind::NotConnected => Error::NotConnected,
            io::ErrorKind::TimedOut => Error::TimedOut,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Error::InvalidArgument,
            io::ErrorKind::UnexpectedEof => Error::BrokenPipe,
            io::ErrorKind::WouldBlock => Error::TryAgain,
            _ => err.raw_os_error().map(Error::from_errno).unwrap_or(Error::Io),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::from_errno(err as i32)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
