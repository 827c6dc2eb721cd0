//! Orchestrator (spec C8): owns the single-threaded runtime the rest of the
//! core lives on and bridges synchronous filesystem callbacks into it.
//!
//! `PageCache` and `FileTree` are built on `Rc`/`RefCell` (spec §5: no locks
//! needed, one executor). That executor is a dedicated OS thread running a
//! current-thread `tokio` runtime inside a `LocalSet`, separate from
//! whatever thread pool the filesystem library delivers callbacks on. A
//! callback thread hands the orchestrator a boxed closure and blocks on a
//! `std::sync::mpsc` reply channel; the closure itself must be `Send` (it
//! only captures plain request data and the reply sender) even though the
//! future it produces, which touches `Rc`-based state, never leaves the
//! worker thread.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::mpsc as sync_mpsc;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, LocalSet};
use tracing::{info, warn};

use crate::cache::PageCache;
use crate::config::Config;
use crate::connection::{Connection, RpcConnection, ShellConnection};
use crate::control::{self, ControlState};
use crate::error::{Error, Result};
use crate::log::{LogHandle, LogcatLayer};
use crate::rpc::{self, Client};
use crate::tree::FileTree;

/// State reachable from inside a [`Job`].
pub struct Core {
    pub cache: Rc<PageCache>,
    pub tree: Rc<FileTree>,
}

/// A unit of work submitted from a callback thread: runs on the worker's
/// `LocalSet` with access to [`Core`], and must itself be `Send` even though
/// its returned future is not.
type Job = Box<dyn FnOnce(&Core) -> Pin<Box<dyn Future<Output = ()>>> + Send>;

/// Handle a filesystem callback thread uses to run async work on the
/// orchestrator's executor and block for the result.
pub struct Orchestrator {
    cmd_tx: mpsc::UnboundedSender<Job>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Start the worker thread, connect (or fall back) to a remote
    /// filesystem, and bring up the cache, tree, and control endpoint
    /// (spec §4.7).
    pub fn start(config: &Config, logcat: Arc<LogcatLayer>, log_handle: LogHandle) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Job>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = sync_mpsc::channel::<Result<()>>();

        let config = config.clone();
        let worker = std::thread::Builder::new()
            .name("madbfs-core".into())
            .spawn(move || run(config, logcat, log_handle, cmd_rx, shutdown_rx, ready_tx))
            .map_err(|_| Error::Io)?;

        ready_rx.recv().map_err(|_| Error::Io)??;

        Ok(Orchestrator { cmd_tx, shutdown_tx: Some(shutdown_tx), worker: Some(worker) })
    }

    /// Run `f` on the core's executor and block the calling (FUSE callback)
    /// thread for its result.
    pub fn block_on<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Rc<Core>) -> Pin<Box<dyn Future<Output = T>>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = sync_mpsc::channel::<T>();
        let job: Job = Box::new(move |core: &Core| {
            let core = Rc::new(Core { cache: core.cache.clone(), tree: core.tree.clone() });
            Box::pin(async move {
                let value = f(core).await;
                let _ = reply_tx.send(value);
            })
        });
        self.cmd_tx.send(job).map_err(|_| Error::NotConnected)?;
        reply_rx.recv().map_err(|_| Error::OperationCanceled)
    }

    /// Stop the worker thread: flushes every open file, cancels the control
    /// endpoint and RPC client, joins the thread (spec §5 Cancellation).
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    config: Config,
    logcat: Arc<LogcatLayer>,
    log_handle: LogHandle,
    mut cmd_rx: mpsc::UnboundedReceiver<Job>,
    mut shutdown_rx: oneshot::Receiver<()>,
    ready_tx: sync_mpsc::Sender<Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(_) => {
            let _ = ready_tx.send(Err(Error::Io));
            return;
        }
    };
    let local = LocalSet::new();

    local.block_on(&runtime, async move {
        let connection = connect(&config).await;
        let cache = Rc::new(PageCache::new(connection.clone(), config.page_size_bytes(), config.max_pages()));
        let tree = Rc::new(FileTree::new(connection, cache.clone(), config.ttl()));
        let core = Core { cache: cache.clone(), tree: tree.clone() };

        if let Some(serial) = config.serial.clone() {
            let socket_path = control::socket_path(&serial);
            let state = Rc::new(ControlState {
                cache,
                tree: tree.clone(),
                logcat,
                log_handle,
                version: env!("CARGO_PKG_VERSION"),
            });
            tokio::task::spawn_local(async move {
                if let Err(e) = control::serve(socket_path, state).await {
                    warn!(error = ?e, "control endpoint did not start");
                }
            });
        } else {
            info!("no device serial available, control endpoint disabled");
        }

        let _ = ready_tx.send(Ok(()));

        loop {
            tokio::select! {
                job = cmd_rx.recv() => {
                    match job {
                        Some(job) => {
                            tokio::task::spawn_local(job(&core));
                        }
                        None => break,
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }

        if let Err(e) = tree.flush_all().await {
            warn!(error = ?e, "flush on shutdown failed");
        }
    });
}

/// Attempt the RPC fast path (spec §4.7); on any failure, fall back to the
/// shell-backed connection.
async fn connect(config: &Config) -> Rc<dyn Connection> {
    if !config.no_server {
        match try_rpc(config).await {
            Ok(conn) => return Rc::new(conn),
            Err(e) => warn!(error = ?e, "RPC connection unavailable, falling back to shell"),
        }
    }
    Rc::new(ShellConnection::new(config.serial.clone()))
}

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

async fn try_rpc(config: &Config) -> Result<RpcConnection> {
    let forward = format!("tcp:{}", config.port);
    adb(&config.serial, &["forward", &forward, &forward]).await?;

    if let Some(server_path) = &config.server {
        launch_server(&config.serial, server_path, config.port).await?;
    }

    let mut stream = TcpStream::connect(("127.0.0.1", config.port)).await.map_err(Error::from)?;
    rpc::handshake(&mut stream).await?;
    let client = Client::start(stream);
    Ok(RpcConnection::new(client, config.timeout()))
}

/// Push the helper binary, mark it executable, launch it over `adb shell`,
/// and wait for its readiness token on the child's own stdout (grounded on
/// the reference implementation's `prepare_and_create`).
async fn launch_server(serial: &Option<String>, server_path: &std::path::Path, port: u16) -> Result<()> {
    const REMOTE_PATH: &str = "/data/local/tmp/madbfs-server";

    adb(serial, &["push", &server_path.to_string_lossy(), REMOTE_PATH]).await?;
    adb(serial, &["shell", "chmod", "+x", REMOTE_PATH]).await?;

    let mut cmd = adb_command(serial);
    cmd.args(["shell", REMOTE_PATH, "--port", &port.to_string()]);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::null());
    let mut child = cmd.spawn().map_err(|_| Error::NotConnected)?;
    let mut stdout = child.stdout.take().ok_or(Error::Io)?;

    let wait = rpc::handshake_readback(&mut stdout);
    match tokio::time::timeout(STARTUP_TIMEOUT, wait).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::TimedOut),
    }
}

fn adb_command(serial: &Option<String>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("adb");
    if let Some(s) = serial {
        cmd.args(["-s", s]);
    }
    cmd
}

async fn adb(serial: &Option<String>, args: &[&str]) -> Result<()> {
    let mut cmd = adb_command(serial);
    cmd.args(args);
    let output = cmd.output().await.map_err(|_| Error::NotConnected)?;
    if !output.status.success() {
        return Err(Error::NotConnected);
    }
    Ok(())
}
