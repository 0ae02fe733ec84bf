use crate::error::{ProxyError, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Lifecycle of the supervised nginx process
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// `start` has not been called
    NotStarted,
    /// Process is running
    Running,
    /// Process has exited; a new supervisor is needed to run it again
    Exited,
}

/// Delivers control signals to the nginx master process.
///
/// Tests substitute a recording implementation to observe reloads and
/// shutdowns without signalling a real process.
pub trait Signaller: Send + Sync {
    /// Ask the process to finish in-flight requests and exit (SIGQUIT)
    fn shutdown(&self, pid: u32) -> std::io::Result<()>;

    /// Ask the process to re-read its configuration (SIGHUP)
    fn reload(&self, pid: u32) -> std::io::Result<()>;
}

/// Sends real OS signals
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSignaller;

impl Signaller for OsSignaller {
    fn shutdown(&self, pid: u32) -> std::io::Result<()> {
        debug!(pid, "Sending SIGQUIT");
        send_signal(pid, Signal::Quit)
    }

    fn reload(&self, pid: u32) -> std::io::Result<()> {
        debug!(pid, "Sending SIGHUP");
        send_signal(pid, Signal::Hangup)
    }
}

enum Signal {
    Quit,
    Hangup,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> std::io::Result<()> {
    let signum = match signal {
        Signal::Quit => libc::SIGQUIT,
        Signal::Hangup => libc::SIGHUP,
    };
    let result = unsafe { libc::kill(pid as libc::pid_t, signum) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process signals are only supported on unix",
    ))
}

/// State shared with the exit watcher. Each field has a single writer.
#[derive(Debug)]
struct ExitStatus {
    running: AtomicBool,
    state: Mutex<ProcessState>,
    last_error: Mutex<Option<String>>,
}

/// Handle kept by the supervisor while the watcher owns the child
struct RunningProcess {
    pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Owns one nginx process from spawn until exit.
///
/// The exit watcher task holds the `Child` and flips a completion signal
/// exactly once when the process is gone. `stop` and the metrics ticker
/// both wait on that signal.
pub struct ProcessSupervisor {
    binary: PathBuf,
    config_path: PathBuf,
    start_delay: Duration,
    shutdown_timeout: Duration,
    signaller: Arc<dyn Signaller>,
    status: Arc<ExitStatus>,
    process: Mutex<Option<RunningProcess>>,
    started: AtomicBool,
    done_tx: Arc<watch::Sender<bool>>,
}

impl ProcessSupervisor {
    pub fn new(
        binary: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        signaller: Arc<dyn Signaller>,
    ) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            binary: binary.into(),
            config_path: config_path.into(),
            start_delay: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
            signaller,
            status: Arc::new(ExitStatus {
                running: AtomicBool::new(false),
                state: Mutex::new(ProcessState::NotStarted),
                last_error: Mutex::new(None),
            }),
            process: Mutex::new(None),
            started: AtomicBool::new(false),
            done_tx: Arc::new(done_tx),
        }
    }

    /// Grace interval between spawning and the liveness check
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// How long `stop` waits for a graceful exit before killing the process
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Receiver that turns `true` once the process has exited
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Whether `start` has ever been attempted on this supervisor
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.status.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ProcessState {
        *self.status.state.lock()
    }

    /// Error recorded by the exit watcher, `None` while running or after a clean exit
    pub fn last_error(&self) -> Option<String> {
        self.status.last_error.lock().clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.lock().as_ref().map(|p| p.pid)
    }

    /// Spawn `<binary> -c <config>` and confirm it survives the grace interval
    pub async fn start(&self) -> Result<u32> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyStarted);
        }

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c").arg(&self.config_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ProxyError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;
        let pid = match spawned_pid(&mut child) {
            Ok(pid) => pid,
            Err(reason) => {
                *self.status.state.lock() = ProcessState::Exited;
                *self.status.last_error.lock() = Some(reason.clone());
                self.done_tx.send_replace(true);
                return Err(ProxyError::DiedImmediately {
                    binary: self.binary.clone(),
                    reason,
                });
            }
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        self.status.running.store(true, Ordering::SeqCst);
        *self.status.state.lock() = ProcessState::Running;

        let (kill_tx, kill_rx) = oneshot::channel();
        *self.process.lock() = Some(RunningProcess {
            pid,
            kill_tx: Some(kill_tx),
        });

        tokio::spawn(watch_process(
            child,
            kill_rx,
            Arc::clone(&self.status),
            Arc::clone(&self.done_tx),
        ));

        tokio::time::sleep(self.start_delay).await;
        if !self.is_running() {
            let reason = self
                .last_error()
                .unwrap_or_else(|| "exited cleanly".to_string());
            return Err(ProxyError::DiedImmediately {
                binary: self.binary.clone(),
                reason,
            });
        }

        info!(pid, binary = %self.binary.display(), "nginx started");
        Ok(pid)
    }

    /// Signal nginx to reload its configuration
    pub fn reload(&self) -> Result<()> {
        let pid = self.pid().ok_or(ProxyError::NotStarted)?;
        if !self.is_running() {
            return Err(ProxyError::NotRunning);
        }
        self.signaller
            .reload(pid)
            .map_err(|source| ProxyError::Signal {
                signal: "SIGHUP",
                pid,
                source,
            })
    }

    /// Ask nginx to shut down gracefully and wait until it has exited.
    ///
    /// If the process is still alive after the shutdown timeout it is killed.
    /// Returns the error recorded when the process exited, if any.
    pub async fn stop(&self) -> Result<()> {
        let pid = self.pid().ok_or(ProxyError::NotStarted)?;

        if self.is_running() {
            info!(pid, "Shutting down nginx process");
            self.signaller
                .shutdown(pid)
                .map_err(|source| ProxyError::Signal {
                    signal: "SIGQUIT",
                    pid,
                    source,
                })?;
        } else {
            debug!(pid, "nginx already exited, not signalling");
        }

        let mut done_rx = self.subscribe_done();
        let exited = tokio::time::timeout(self.shutdown_timeout, done_rx.wait_for(|done| *done))
            .await
            .is_ok();

        if !exited {
            warn!(
                pid,
                timeout_secs = self.shutdown_timeout.as_secs(),
                "nginx did not exit within the shutdown timeout, killing it"
            );
            let kill_tx = self.process.lock().as_mut().and_then(|p| p.kill_tx.take());
            if let Some(kill_tx) = kill_tx {
                let _ = kill_tx.send(());
            }
            let _ = done_rx.wait_for(|done| *done).await;
        }

        match self.last_error() {
            Some(e) => Err(ProxyError::Exited(e)),
            None => Ok(()),
        }
    }

    /// Fails with `NotRunning` unless the process is alive
    pub fn health(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ProxyError::NotRunning)
        }
    }
}

/// Wait for the child to exit, record how it ended and fire the completion signal
async fn watch_process(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    status: Arc<ExitStatus>,
    done_tx: Arc<watch::Sender<bool>>,
) {
    let result = tokio::select! {
        result = child.wait() => result,
        Ok(()) = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to kill nginx");
            }
            child.wait().await
        }
    };

    let exit_error = match result {
        Ok(exit) if exit.success() => {
            info!("nginx has shut down successfully");
            None
        }
        Ok(exit) => {
            error!(status = %exit, "nginx has exited with an error");
            Some(exit.to_string())
        }
        Err(e) => {
            error!(error = %e, "Failed to wait for nginx");
            Some(e.to_string())
        }
    };

    *status.last_error.lock() = exit_error;
    *status.state.lock() = ProcessState::Exited;
    status.running.store(false, Ordering::SeqCst);
    done_tx.send_replace(true);
}

/// Pid of a freshly spawned child. A child that has already been reaped has
/// none, and signalling pid 0 would hit the controller's own process group.
fn spawned_pid(child: &mut Child) -> std::result::Result<u32, String> {
    if let Some(pid) = child.id() {
        return Ok(pid);
    }
    Err(match child.try_wait() {
        Ok(Some(exit)) => exit.to_string(),
        Ok(None) => "no process id".to_string(),
        Err(e) => e.to_string(),
    })
}

/// Log each line the child writes
async fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "nginx", stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(stream, error = %e, "Error reading nginx output");
                break;
            }
        }
    }
}
