//! Child process supervision shared by both engines
//!
//! - Locating the executable
//! - Spawning with `kill_on_drop`
//! - Graceful stop: SIGTERM, then kill after a grace period

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Time a freshly spawned engine gets before we check it is still alive
pub const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process not started
    Stopped,
    /// Process is starting
    Starting,
    /// Process is running
    Running,
    /// Process exited on its own or failed to spawn
    Failed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

/// Find an executable: explicit paths are checked as-is, bare names are
/// searched on `PATH`.
pub fn resolve_executable(executable: &Path) -> Option<PathBuf> {
    if executable.components().count() > 1 || executable.is_absolute() {
        return executable.is_file().then(|| executable.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(executable))
        .find(|candidate| candidate.is_file())
}

/// One supervised child process
pub struct ChildProcess {
    name: &'static str,
    child: Mutex<Option<Child>>,
    state_tx: watch::Sender<ProcessState>,
    stop_timeout: Duration,
}

impl ChildProcess {
    pub fn new(name: &'static str, stop_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ProcessState::Stopped);
        ChildProcess {
            name,
            child: Mutex::new(None),
            state_tx,
            stop_timeout,
        }
    }

    /// Get current process state
    pub fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, new_state: ProcessState) {
        self.state_tx.send_if_modified(|state| {
            if *state == new_state {
                return false;
            }
            debug!("{} process state: {} -> {}", self.name, *state, new_state);
            *state = new_state;
            true
        });
    }

    /// Spawn the command and confirm it survives its first moments.
    /// On failure returns the text to report to the caller.
    pub async fn spawn(&self, mut cmd: Command) -> std::result::Result<u32, String> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Err(format!("{} is already running", self.name));
        }

        self.set_state(ProcessState::Starting);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_state(ProcessState::Failed);
                return Err(format!("failed to spawn {}: {}", self.name, e));
            }
        };

        let pid = child.id().unwrap_or(0);
        info!("{} started with PID: {}", self.name, pid);

        // Wait a moment for process to initialize
        sleep(STARTUP_GRACE).await;

        match child.try_wait() {
            Ok(None) => {
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(forward_stderr(self.name, stderr));
                }
                *guard = Some(child);
                self.set_state(ProcessState::Running);
                Ok(pid)
            }
            Ok(Some(status)) => {
                let stderr = read_stderr(&mut child).await;
                self.set_state(ProcessState::Failed);
                Err(if stderr.is_empty() {
                    format!("{} exited immediately: {}", self.name, status)
                } else {
                    stderr
                })
            }
            Err(e) => {
                self.set_state(ProcessState::Failed);
                Err(format!("failed to poll {}: {}", self.name, e))
            }
        }
    }

    /// Stop the process: SIGTERM, wait, then kill
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            info!("Stopping {}...", self.name);

            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }

            match timeout(self.stop_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("{} exited with status: {}", self.name, status);
                }
                Ok(Err(e)) => {
                    warn!("Error waiting for {}: {}", self.name, e);
                }
                Err(_) => {
                    warn!("{} didn't exit gracefully, forcing kill", self.name);
                    let _ = child.kill().await;
                }
            }
        }

        self.set_state(ProcessState::Stopped);
    }
}

async fn forward_stderr(name: &'static str, stderr: tokio::process::ChildStderr) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{}: {}", name, line);
    }
}

async fn read_stderr(child: &mut Child) -> String {
    use tokio::io::AsyncReadExt;

    let mut buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut buf).await;
    }
    buf.trim().to_string()
}
