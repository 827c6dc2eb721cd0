//! Tracing setup: a file (or stdout) sink plus a broadcast layer the control
//! endpoint's `logcat` op subscribes to (spec §4.8, §9).

use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LogLevel;

/// Handle onto the live `EnvFilter`, letting `set_log_level` (spec §4.8)
/// swap the level without tearing down the subscriber.
pub type LogHandle = tracing_subscriber::reload::Handle<EnvFilter, Registry>;

/// Reinstall `level` as the active filter (control op `set_log_level`).
pub fn set_level(handle: &LogHandle, level: LogLevel) -> Result<(), tracing_subscriber::reload::Error> {
    handle.modify(|filter| *filter = EnvFilter::new(level.as_filter()))
}

/// Fan-out for log lines: every formatted line is also pushed to a broadcast
/// channel so `logcat` control connections can tail it live.
pub struct LogcatLayer {
    tx: tokio::sync::broadcast::Sender<String>,
}

impl LogcatLayer {
    pub fn new(capacity: usize) -> (Self, tokio::sync::broadcast::Receiver<String>) {
        let (tx, rx) = tokio::sync::broadcast::channel(capacity);
        (LogcatLayer { tx }, rx)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S> Layer<S> for LogcatLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format!("{} {} {}", event.metadata().level(), event.metadata().target(), visitor.0);
        let _ = self.tx.send(line);
    }
}

/// Install the global tracing subscriber. Returns the file-sink worker guard
/// (must be kept alive for the process lifetime), the logcat layer handle,
/// and a reload handle onto the active filter.
pub fn init(
    level: LogLevel,
    log_file: &str,
) -> (Option<tracing_appender::non_blocking::WorkerGuard>, Arc<LogcatLayer>, LogHandle) {
    let filter = EnvFilter::try_new(level.as_filter()).unwrap_or_else(|_| EnvFilter::new("warn"));
    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);

    let (logcat_layer, _rx) = LogcatLayer::new(1024);
    let logcat_layer = Arc::new(logcat_layer);

    if log_file == "-" {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(logcat_layer.clone());
        tracing::subscriber::set_global_default(subscriber).ok();
        (None, logcat_layer, reload_handle)
    } else {
        let path = std::path::Path::new(log_file);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
        let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("madbfs.log"));
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
            .with(logcat_layer.clone());
        tracing::subscriber::set_global_default(subscriber).ok();
        (Some(guard), logcat_layer, reload_handle)
    }
}
