//! Shell-backed [`Connection`] fallback (spec C5, §4.4), used when no
//! on-device helper is reachable. Shells out to `adb shell` per call and
//! parses `stat`/`dd`/`mv` output, grounded on the original `adb shell`
//! fallback's command shapes and stderr taxonomy.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::Connection;
use crate::error::{Error, Result};
use crate::wire::{FileStat, RenameFlags, TimeSpec, WireTime};

const NO_DEVICE: &str = "adb: no devices/emulators found";
const DEVICE_OFFLINE: &str = "adb: device offline";
const PERMISSION_DENIED: &str = "Permission denied";
const NO_SUCH_FILE: &str = "No such file or directory";
const NOT_A_DIRECTORY: &str = "Not a directory";
const READ_ONLY: &str = "Read-only file system";

fn parse_stderr(stderr: &str) -> Error {
    for line in stderr.lines() {
        if line.contains(NO_DEVICE) || line.contains(DEVICE_OFFLINE) {
            return Error::NotConnected;
        } else if line.contains(PERMISSION_DENIED) {
            return Error::PermissionDenied;
        } else if line.contains(NO_SUCH_FILE) {
            return Error::NotFound;
        } else if line.contains(NOT_A_DIRECTORY) {
            return Error::NotADirectory;
        } else if line.contains(READ_ONLY) {
            return Error::ReadOnlyFilesystem;
        }
    }
    Error::Io
}

fn quote(path: &str) -> String {
    format!("\"{path}\"")
}

/// Shells out to `adb [-s serial] shell ...` (and `adb push`/`pull` for bulk
/// transfer, though this fallback uses `dd` for byte-range I/O like the
/// original shell backend).
pub struct ShellConnection {
    serial: Option<String>,
}

impl ShellConnection {
    pub fn new(serial: Option<String>) -> Self {
        Self { serial }
    }

    fn adb_shell(&self) -> Command {
        let mut cmd = Command::new("adb");
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.arg("shell");
        cmd
    }

    /// Run `adb shell <args...>`, optionally piping `stdin`, and return
    /// stdout on success or a parsed [`Error`] on non-zero exit.
    async fn exec(&self, args: &[&str], stdin_data: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut cmd = self.adb_shell();
        cmd.args(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin_data.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd.spawn().map_err(Error::from)?;

        if let Some(data) = stdin_data {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin.write_all(data).await.map_err(Error::from)?;
            drop(stdin);
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_end(&mut stdout).await.map_err(Error::from)?;
        }
        if let Some(mut err) = child.stderr.take() {
            err.read_to_end(&mut stderr).await.map_err(Error::from)?;
        }

        let status = child.wait().await.map_err(Error::from)?;
        if !status.success() {
            let msg = String::from_utf8_lossy(&stderr);
            return Err(parse_stderr(&msg));
        }
        Ok(stdout)
    }

    async fn exec_str(&self, args: &[&str], stdin_data: Option<&[u8]>) -> Result<String> {
        let out = self.exec(args, stdin_data).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }
}

/// Parses `stat -c '%f %h %s %u %g %X %Y %Z %n'` output: hex mode, links,
/// size, uid, gid, atime, mtime, ctime, name.
fn parse_stat_line(line: &str) -> Option<(String, FileStat)> {
    let mut parts = line.splitn(9, ' ');
    let mode = u32::from_str_radix(parts.next()?, 16).ok()?;
    let links = parts.next()?.parse().ok()?;
    let size = parts.next()?.parse().ok()?;
    let uid = parts.next()?.parse().ok()?;
    let gid = parts.next()?.parse().ok()?;
    let atime: i64 = parts.next()?.parse().ok()?;
    let mtime: i64 = parts.next()?.parse().ok()?;
    let ctime: i64 = parts.next()?.parse().ok()?;
    let name = parts.next()?.to_string();

    Some((
        name,
        FileStat {
            size,
            links,
            mtime: WireTime { seconds: mtime, nanos: 0 },
            atime: WireTime { seconds: atime, nanos: 0 },
            ctime: WireTime { seconds: ctime, nanos: 0 },
            mode,
            uid,
            gid,
        },
    ))
}

fn basename(path: &str) -> &str {
    if path == "/" {
        return path;
    }
    path.rsplit('/').next().unwrap_or(path)
}

#[async_trait]
impl Connection for ShellConnection {
    async fn statdir(&self, path: &str) -> Result<Vec<(String, FileStat)>> {
        let q = quote(path);
        let out = self
            .exec_str(
                &["find", &q, "-maxdepth", "1", "-exec", "stat", "-c", "'%f %h %s %u %g %X %Y %Z %n'", "{}", "+"],
                None,
            )
            .await?;

        let mut entries = Vec::new();
        for line in out.lines().skip(1) {
            if let Some((name, stat)) = parse_stat_line(line.trim()) {
                entries.push((basename(&name).to_string(), stat));
            }
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let q = quote(path);
        let out = self.exec_str(&["stat", "-c", "'%f %h %s %u %g %X %Y %Z %n'", &q], None).await?;
        parse_stat_line(&out).map(|(_, stat)| stat).ok_or(Error::Io)
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        let q = quote(path);
        self.exec_str(&["readlink", &q], None).await
    }

    async fn mknod(&self, path: &str, _mode: u32, _dev: u64) -> Result<()> {
        let q = quote(path);
        self.exec(&["touch", &q], None).await.map(|_| ())
    }

    async fn mkdir(&self, path: &str, _mode: u32) -> Result<()> {
        let q = quote(path);
        self.exec(&["mkdir", &q], None).await.map(|_| ())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let q = quote(path);
        self.exec(&["rm", &q], None).await.map(|_| ())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let q = quote(path);
        self.exec(&["rmdir", &q], None).await.map(|_| ())
    }

    async fn rename(&self, from: &str, to: &str, flags: RenameFlags) -> Result<()> {
        match flags {
            RenameFlags::Exchange => Err(Error::InvalidArgument),
            RenameFlags::NoReplace => {
                let (f, t) = (quote(from), quote(to));
                self.exec(&["mv", "-n", &f, &t], None).await.map(|_| ())
            }
            RenameFlags::None => {
                let (f, t) = (quote(from), quote(to));
                self.exec(&["mv", &f, &t], None).await.map(|_| ())
            }
        }
    }

    async fn truncate(&self, path: &str, size: i64) -> Result<()> {
        let q = quote(path);
        let size_str = size.to_string();
        self.exec(&["truncate", "-s", &size_str, &q], None).await.map(|_| ())
    }

    async fn read(&self, path: &str, buf: &mut [u8], offset: i64) -> Result<usize> {
        let skip = format!("skip={offset}");
        let count = format!("count={}", buf.len());
        let ifile = format!("if=\"{path}\"");
        let out = self.exec(&["dd", "iflag=skip_bytes,count_bytes", &skip, &count, &ifile], None).await?;
        let n = out.len().min(buf.len());
        buf[..n].copy_from_slice(&out[..n]);
        Ok(n)
    }

    async fn write(&self, path: &str, data: &[u8], offset: i64) -> Result<usize> {
        let seek = format!("seek={offset}");
        let ofile = format!("of=\"{path}\"");
        self.exec(&["dd", "oflag=seek_bytes", "conv=notrunc", &seek, &ofile], Some(data)).await?;
        Ok(data.len())
    }

    async fn utimens(&self, path: &str, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
        // `touch` cannot set atime and mtime independently; pick the later
        // of the two and apply it to both, matching the original fallback.
        let q = quote(path);
        let later = match (atime, mtime) {
            (TimeSpec::Now, _) | (_, TimeSpec::Now) => TimeSpec::Now,
            (TimeSpec::Set(a), TimeSpec::Set(m)) => {
                if (a.seconds, a.nanos) >= (m.seconds, m.nanos) {
                    TimeSpec::Set(a)
                } else {
                    TimeSpec::Set(m)
                }
            }
            (TimeSpec::Set(a), TimeSpec::Omit) => TimeSpec::Set(a),
            (TimeSpec::Omit, TimeSpec::Set(m)) => TimeSpec::Set(m),
            (TimeSpec::Omit, TimeSpec::Omit) => TimeSpec::Now,
        };

        match later {
            TimeSpec::Now => self.exec(&["touch", "-c", &q], None).await.map(|_| ()),
            TimeSpec::Set(t) => {
                let datetime = format_touch_date(t);
                self.exec(&["touch", "-c", "-d", &datetime, &q], None).await.map(|_| ())
            }
            TimeSpec::Omit => unreachable!("resolved above"),
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
        let skip = format!("skip={in_offset}");
        let count = format!("count={size}");
        let ifile = format!("if=\"{in_path}\"");
        let seek = format!("seek={out_offset}");
        let ofile = format!("of=\"{out_path}\"");

        self.exec(
            &["dd", "iflag=skip_bytes,count_bytes", &skip, &count, &ifile, "oflag=seek_bytes", "conv=notrunc", &seek, &ofile],
            None,
        )
        .await?;
        Ok(size)
    }
}

/// Render a wire timestamp as `touch -d`'s `YYYYMMDDhhmm.ss` format (UTC).
fn format_touch_date(t: WireTime) -> String {
    let civil = civil_time::from_unix(t.seconds.max(0));
    format!(
        "{:04}{:02}{:02}{:02}{:02}.{:02}",
        civil.year, civil.month, civil.day, civil.hour, civil.minute, civil.second
    )
}

/// UTC civil-calendar conversion (proleptic Gregorian), after Howard
/// Hinnant's `civil_from_days`.
mod civil_time {
    pub struct Civil {
        pub year: i64,
        pub month: u32,
        pub day: u32,
        pub hour: u32,
        pub minute: u32,
        pub second: u32,
    }

    pub fn from_unix(secs: i64) -> Civil {
        let days = secs.div_euclid(86400);
        let rem = secs.rem_euclid(86400);
        let (hour, minute, second) = ((rem / 3600) as u32, ((rem / 60) % 60) as u32, (rem % 60) as u32);

        // Howard Hinnant's civil_from_days algorithm.
        let z = days + 719468;
        let era = if z >= 0 { z } else { z - 146096 } / 146097;
        let doe = (z - era * 146097) as i64;
        let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
        let y = yoe + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
        let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
        let year = if month <= 2 { y + 1 } else { y };

        Civil { year, month, day, hour, minute, second }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_line() {
        let line = "81a4 1 1024 1000 1000 1700000000 1700000001 1700000002 /sdcard/f.txt";
        let (name, stat) = parse_stat_line(line).unwrap();
        assert_eq!(name, "/sdcard/f.txt");
        assert_eq!(stat.size, 1024);
        assert_eq!(stat.links, 1);
        assert_eq!(stat.mode, 0o100644);
    }

    #[test]
    fn stderr_taxonomy() {
        assert_eq!(parse_stderr("rm: /a: No such file or directory"), Error::NotFound);
        assert_eq!(parse_stderr("adb: device offline"), Error::NotConnected);
        assert_eq!(parse_stderr("touch: /a: Read-only file system"), Error::ReadOnlyFilesystem);
        assert_eq!(parse_stderr("something unexpected"), Error::Io);
    }

    #[test]
    fn basename_strips_directory() {
        assert_eq!(basename("/a/b/c.txt"), "c.txt");
        assert_eq!(basename("/"), "/");
    }

    #[test]
    fn touch_date_formats_epoch() {
        let s = format_touch_date(WireTime { seconds: 0, nanos: 0 });
        assert_eq!(s, "197001010000.00");
    }
}
