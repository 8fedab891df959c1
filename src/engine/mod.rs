//! External engines
//!
//! The proxy engine relays traffic to the remote server; the forwarding
//! engine bridges the virtual interface to the proxy engine's local SOCKS
//! listener. Both are opaque to this crate and reached only through the
//! narrow contracts below.
//!
//! ```text
//!  +-------------+   packets   +------------------+  SOCKS  +--------------+
//!  | virtual if  |------------>| ForwardingEngine |-------->| ProxyEngine  |---> server
//!  +-------------+     fd      +------------------+         +--------------+
//! ```

mod process;
mod tun2socks;
mod xray;

pub use process::{resolve_executable, ChildProcess, ProcessState};
pub use tun2socks::{Tun2SocksEngine, INHERITED_TUN_FD};
pub use xray::XrayEngine;

use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::os::fd::RawFd;
use std::path::Path;

/// Proxy/relay engine call contract.
///
/// `test` and `start` report failure as text; an empty string means success.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Validate a config document without starting anything
    async fn test(&self, work_dir: &Path, config_path: &Path) -> String;

    async fn start(&self, work_dir: &Path, config_path: &Path) -> String;

    async fn stop(&self);
}

/// Packet-forwarding engine call contract
#[async_trait]
pub trait ForwardingEngine: Send + Sync {
    /// Make the engine available; fails when it cannot be loaded
    async fn load(&self) -> Result<()>;

    async fn start(&self, config_path: &Path, tun_fd: RawFd) -> Result<()>;

    async fn stop(&self);

    fn stats(&self) -> TrafficStats;
}

/// Forwarding engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

impl TrafficStats {
    /// `[txPackets, txBytes, rxPackets, rxBytes]`
    pub fn as_array(&self) -> [u64; 4] {
        [self.tx_packets, self.tx_bytes, self.rx_packets, self.rx_bytes]
    }

    pub fn from_array(values: [u64; 4]) -> Self {
        TrafficStats {
            tx_packets: values[0],
            tx_bytes: values[1],
            rx_packets: values[2],
            rx_bytes: values[3],
        }
    }
}

/// Human readable byte count ("1.50 MB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_array_order() {
        let stats = TrafficStats::from_array([1, 2, 3, 4]);
        assert_eq!(stats.tx_packets, 1);
        assert_eq!(stats.rx_bytes, 4);
        assert_eq!(stats.as_array(), [1, 2, 3, 4]);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(1572864), "1.50 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
