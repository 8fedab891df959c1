//! hev-socks5-tunnel as the forwarding engine

use super::process::{resolve_executable, ChildProcess};
use super::{ForwardingEngine, TrafficStats};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Descriptor number the interface fd is handed to the child as
pub const INHERITED_TUN_FD: RawFd = 3;

const STAT_FILES: [&str; 4] = ["tx_packets", "tx_bytes", "rx_packets", "rx_bytes"];

/// Forwarding engine backed by the `hev-socks5-tunnel` binary
pub struct Tun2SocksEngine {
    executable: PathBuf,
    interface_name: String,
    located: Mutex<Option<PathBuf>>,
    process: ChildProcess,
    stats_root: PathBuf,
}

impl Tun2SocksEngine {
    pub fn new(executable: PathBuf, interface_name: impl Into<String>, stop_timeout: Duration) -> Self {
        Tun2SocksEngine {
            executable,
            interface_name: interface_name.into(),
            located: Mutex::new(None),
            process: ChildProcess::new("tun2socks", stop_timeout),
            stats_root: PathBuf::from("/sys/class/net"),
        }
    }

    /// Read counters from another sysfs-like root
    pub fn with_stats_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.stats_root = root.into();
        self
    }

    pub fn process(&self) -> &ChildProcess {
        &self.process
    }

    fn read_counter(&self, file: &str) -> u64 {
        let path = self
            .stats_root
            .join(&self.interface_name)
            .join("statistics")
            .join(file);
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Make `fd` available as `target` across exec. `dup2` onto itself is a
/// no-op that keeps close-on-exec set, so that case clears the flag.
#[cfg(unix)]
fn inherit_fd(fd: RawFd, target: RawFd) -> std::io::Result<()> {
    // SAFETY: plain fd syscalls, async-signal-safe
    let rc = unsafe {
        if fd == target {
            libc::fcntl(fd, libc::F_SETFD, 0)
        } else {
            libc::dup2(fd, target)
        }
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl ForwardingEngine for Tun2SocksEngine {
    async fn load(&self) -> Result<()> {
        let path = resolve_executable(&self.executable).ok_or_else(|| {
            Error::forwarding_load(format!(
                "tun2socks executable not found: {}",
                self.executable.display()
            ))
        })?;
        debug!("tun2socks located at {}", path.display());
        *self.located.lock() = Some(path);
        Ok(())
    }

    async fn start(&self, config_path: &Path, tun_fd: RawFd) -> Result<()> {
        let executable = self
            .located
            .lock()
            .clone()
            .ok_or_else(|| Error::forwarding_load("tun2socks was not loaded"))?;

        let mut cmd = Command::new(&executable);
        cmd.arg(config_path).env("TUN_FD", INHERITED_TUN_FD.to_string());

        #[cfg(unix)]
        {
            // SAFETY: only async-signal-safe calls between fork and exec
            unsafe {
                cmd.pre_exec(move || inherit_fd(tun_fd, INHERITED_TUN_FD));
            }
        }

        info!(
            "Starting tun2socks on {} (fd {}): {}",
            self.interface_name,
            tun_fd,
            config_path.display()
        );
        self.process
            .spawn(cmd)
            .await
            .map(|_| ())
            .map_err(Error::forwarding_load)
    }

    async fn stop(&self) {
        self.process.stop().await;
    }

    fn stats(&self) -> TrafficStats {
        let mut values = [0u64; 4];
        for (value, file) in values.iter_mut().zip(STAT_FILES) {
            *value = self.read_counter(file);
        }
        TrafficStats::from_array(values)
    }
}
