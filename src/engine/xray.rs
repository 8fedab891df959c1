//! Xray-core as the proxy engine

use super::process::{resolve_executable, ChildProcess};
use super::ProxyEngine;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Proxy engine backed by the `xray` binary
pub struct XrayEngine {
    executable: PathBuf,
    process: ChildProcess,
}

impl XrayEngine {
    pub fn new(executable: PathBuf, stop_timeout: Duration) -> Self {
        XrayEngine {
            executable,
            process: ChildProcess::new("xray", stop_timeout),
        }
    }

    pub fn process(&self) -> &ChildProcess {
        &self.process
    }

    fn command(&self, executable: &Path, work_dir: &Path) -> Command {
        let mut cmd = Command::new(executable);
        cmd.current_dir(work_dir)
            // geoip.dat / geosite.dat are looked up next to the config
            .env("XRAY_LOCATION_ASSET", work_dir);
        cmd
    }

    fn locate(&self) -> Result<PathBuf, String> {
        resolve_executable(&self.executable)
            .ok_or_else(|| format!("xray executable not found: {}", self.executable.display()))
    }
}

#[async_trait]
impl ProxyEngine for XrayEngine {
    async fn test(&self, work_dir: &Path, config_path: &Path) -> String {
        let executable = match self.locate() {
            Ok(path) => path,
            Err(msg) => return msg,
        };

        let mut cmd = self.command(&executable, work_dir);
        cmd.arg("run").arg("-test").arg("-c").arg(config_path);

        match cmd.output().await {
            Ok(output) if output.status.success() => {
                debug!("xray accepted {}", config_path.display());
                String::new()
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let msg = if !stderr.is_empty() {
                    stderr
                } else if !stdout.is_empty() {
                    stdout
                } else {
                    format!("config test exited with {}", output.status)
                };
                error!("xray rejected config: {}", msg);
                msg
            }
            Err(e) => format!("failed to run xray: {}", e),
        }
    }

    async fn start(&self, work_dir: &Path, config_path: &Path) -> String {
        let executable = match self.locate() {
            Ok(path) => path,
            Err(msg) => return msg,
        };

        let mut cmd = self.command(&executable, work_dir);
        cmd.arg("run").arg("-c").arg(config_path);

        info!("Starting xray: {} run -c {}", executable.display(), config_path.display());
        match self.process.spawn(cmd).await {
            Ok(_) => String::new(),
            Err(msg) => msg,
        }
    }

    async fn stop(&self) {
        self.process.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_executable_reports_text() {
        let engine = XrayEngine::new(PathBuf::from("/nonexistent/xray"), Duration::from_secs(1));
        let dir = std::env::temp_dir();

        let msg = engine.test(&dir, &dir.join("config.json")).await;
        assert!(msg.contains("not found"));

        let msg = engine.start(&dir, &dir.join("config.json")).await;
        assert!(msg.contains("not found"));

        // Stopping something that never started is harmless
        engine.stop().await;
    }
}
