//! Configuration module

pub mod generator;
mod parser;

pub use generator::{generate_config, EngineConfigDocument, ForwardingConfig};
pub use parser::*;

use crate::provider::ServerId;
use crate::{Error, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Proxy engine document file name inside the work directory
pub const ENGINE_CONFIG_FILE: &str = "config.json";

/// Forwarding engine config file name inside the work directory
pub const FORWARDING_CONFIG_FILE: &str = "tun2socks.yml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Directory handed to the engines; config artifacts live here
    pub work_dir: PathBuf,

    /// Log level
    pub log_level: String,

    pub network: NetworkSettings,

    pub tun: TunSettings,

    pub monitor: MonitorSettings,

    pub failover: FailoverSettings,

    pub ranking: RankingSettings,

    pub engines: EngineSettings,
}

impl Settings {
    /// Load configuration from file (synchronous)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;

        if self.tun.mtu == 0 {
            return Err(Error::config("tun.mtu cannot be 0"));
        }
        if self.tun.name.is_empty() {
            return Err(Error::config("tun.name cannot be empty"));
        }
        if self.monitor.interval_secs == 0 {
            return Err(Error::config("monitor.interval-secs cannot be 0"));
        }
        if self.monitor.max_attempts == 0 {
            return Err(Error::config("monitor.max-attempts cannot be 0"));
        }
        if self.monitor.probe_timeout_ms == 0 {
            return Err(Error::config("monitor.probe-timeout-ms cannot be 0"));
        }
        if self.ranking.timeout_ms == 0 {
            return Err(Error::config("ranking.timeout-ms cannot be 0"));
        }

        Ok(())
    }

    /// Path of the proxy engine document
    pub fn engine_config_path(&self) -> PathBuf {
        self.work_dir.join(ENGINE_CONFIG_FILE)
    }

    /// Path of the forwarding engine config
    pub fn forwarding_config_path(&self) -> PathBuf {
        self.work_dir.join(FORWARDING_CONFIG_FILE)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            work_dir: std::env::temp_dir().join("sfkt"),
            log_level: "info".to_string(),
            network: NetworkSettings::default(),
            tun: TunSettings::default(),
            monitor: MonitorSettings::default(),
            failover: FailoverSettings::default(),
            ranking: RankingSettings::default(),
            engines: EngineSettings::default(),
        }
    }
}

/// Local SOCKS listener and DNS servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NetworkSettings {
    pub socks_address: String,
    pub socks_port: u16,
    pub primary_dns: String,
    pub secondary_dns: String,
}

impl NetworkSettings {
    pub fn validate(&self) -> Result<()> {
        if self.socks_address.is_empty() {
            return Err(Error::config("network.socks-address cannot be empty"));
        }
        if self.socks_port == 0 {
            return Err(Error::config("network.socks-port cannot be 0"));
        }
        if self.primary_dns.is_empty() || self.secondary_dns.is_empty() {
            return Err(Error::config("network DNS servers cannot be empty"));
        }
        Ok(())
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            socks_address: "127.0.0.1".to_string(),
            socks_port: 10808,
            primary_dns: "1.1.1.1".to_string(),
            secondary_dns: "1.0.0.1".to_string(),
        }
    }
}

/// Virtual interface configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TunSettings {
    pub name: String,
    pub mtu: u32,
    pub address: Ipv4Net,
    /// Applications whose traffic bypasses the tunnel
    pub excluded_apps: Vec<String>,
}

impl Default for TunSettings {
    fn default() -> Self {
        TunSettings {
            name: "sfkt".to_string(),
            mtu: 8500,
            address: Ipv4Net::from(Ipv4Addr::new(10, 10, 10, 10)),
            excluded_apps: Vec::new(),
        }
    }
}

/// Connectivity monitor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MonitorSettings {
    pub interval_secs: u64,
    pub max_attempts: u32,
    pub probe_host: String,
    pub probe_port: u16,
    pub probe_timeout_ms: u64,
    pub auto_failover: bool,
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            interval_secs: 30,
            max_attempts: 3,
            probe_host: "1.1.1.1".to_string(),
            probe_port: 53,
            probe_timeout_ms: 5000,
            auto_failover: true,
        }
    }
}

/// Failover configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FailoverSettings {
    /// Pause between stopping one session and starting the next
    pub settle_delay_ms: u64,
    /// Servers eligible for failover; empty means all
    pub preferred: Vec<ServerId>,
}

impl FailoverSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for FailoverSettings {
    fn default() -> Self {
        FailoverSettings {
            settle_delay_ms: 800,
            preferred: Vec::new(),
        }
    }
}

/// Latency ranking configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RankingSettings {
    pub timeout_ms: u64,
}

impl RankingSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RankingSettings {
    fn default() -> Self {
        RankingSettings { timeout_ms: 3000 }
    }
}

/// External engine executables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineSettings {
    pub proxy_executable: PathBuf,
    pub forwarding_executable: PathBuf,
    /// Grace period between SIGTERM and kill
    pub stop_timeout_ms: u64,
}

impl EngineSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            proxy_executable: PathBuf::from("xray"),
            forwarding_executable: PathBuf::from("hev-socks5-tunnel"),
            stop_timeout_ms: 5000,
        }
    }
}
