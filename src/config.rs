//! Mount CLI surface (spec §6), parsed with `clap`'s derive API.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[clap(rename_all = "lower")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Err,
    Critical,
    Off,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Err | LogLevel::Critical => "error",
            LogLevel::Off => "off",
        }
    }
}

/// FUSE mount of a remote Android device's filesystem over ADB.
#[derive(Debug, Clone, Parser)]
#[command(name = "madbfs", version)]
pub struct Config {
    /// Mount point.
    pub mountpoint: PathBuf,

    /// Device serial (else discovered via the debug bridge).
    #[arg(long, env = "ANDROID_SERIAL")]
    pub serial: Option<String>,

    /// Path to an on-device helper binary to push and launch.
    #[arg(long)]
    pub server: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Log destination; "-" for stdout.
    #[arg(long, default_value = "-")]
    pub log_file: String,

    /// Total page cache budget, in MiB.
    #[arg(long, default_value_t = 256)]
    pub cache_size: usize,

    /// Page size, in KiB.
    #[arg(long, default_value_t = 128)]
    pub page_size: usize,

    /// Stat TTL in seconds; 0 disables revalidation caching.
    #[arg(long, default_value_t = 30)]
    pub ttl: u64,

    /// RPC request timeout in seconds; 0 disables the timeout.
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,

    /// TCP port the on-device helper listens on.
    #[arg(long, default_value_t = 12345)]
    pub port: u16,

    /// Skip attempting to launch/connect to the on-device helper.
    #[arg(long)]
    pub no_server: bool,
}

const MIN_PAGE_SIZE_KIB: usize = 64;
const MAX_PAGE_SIZE_KIB: usize = 4096;
const MIN_CACHE_SIZE_MIB: usize = 128;

fn next_pow2(x: usize) -> usize {
    if x <= 1 {
        1
    } else {
        1usize << (usize::BITS - (x - 1).leading_zeros())
    }
}

impl Config {
    /// Page size in bytes, clamped and rounded to a power of two (spec §6, §4.8).
    pub fn page_size_bytes(&self) -> usize {
        let kib = self.page_size.clamp(MIN_PAGE_SIZE_KIB, MAX_PAGE_SIZE_KIB);
        next_pow2(kib) * 1024
    }

    /// Max resident pages, derived from `cache_size` / `page_size`.
    pub fn max_pages(&self) -> usize {
        let cache_bytes = self.cache_size.max(MIN_CACHE_SIZE_MIB) * 1024 * 1024;
        (cache_bytes / self.page_size_bytes()).max(128)
    }

    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ttl)
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        if self.timeout == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(self.timeout))
        }
    }
}
