//! Reachability probes

use crate::common::net::measure_connect;
use crate::config::MonitorSettings;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One reachability check
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Platform view of the active network
pub trait NetworkCapabilities: Send + Sync {
    fn has_internet(&self) -> bool;

    /// The platform confirmed the network actually reaches the Internet
    fn is_validated(&self) -> bool;
}

/// Raw TCP connect to a well-known host, falling back to the platform's
/// network capabilities when the connect fails
pub struct TcpReachabilityProbe {
    host: String,
    port: u16,
    timeout: Duration,
    capabilities: Arc<dyn NetworkCapabilities>,
}

impl TcpReachabilityProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration, capabilities: Arc<dyn NetworkCapabilities>) -> Self {
        TcpReachabilityProbe {
            host: host.into(),
            port,
            timeout,
            capabilities,
        }
    }

    pub fn from_settings(settings: &MonitorSettings, capabilities: Arc<dyn NetworkCapabilities>) -> Self {
        Self::new(
            settings.probe_host.clone(),
            settings.probe_port,
            settings.probe_timeout(),
            capabilities,
        )
    }
}

#[async_trait]
impl ReachabilityProbe for TcpReachabilityProbe {
    async fn probe(&self) -> bool {
        if measure_connect(&self.host, self.port, self.timeout).await.is_some() {
            return true;
        }

        let fallback = self.capabilities.has_internet() && self.capabilities.is_validated();
        debug!(
            "probe {}:{} failed, capability fallback: {}",
            self.host, self.port, fallback
        );
        fallback
    }
}

const RTF_UP: u32 = 0x0001;
const RTF_GATEWAY: u32 = 0x0002;

/// Capabilities derived from the kernel's main routing table.
///
/// A default route means the host has an Internet-facing network; it
/// counts as validated when that route is up and goes through a gateway.
pub struct RouteTableCapabilities {
    path: PathBuf,
}

impl RouteTableCapabilities {
    pub fn new() -> Self {
        RouteTableCapabilities {
            path: PathBuf::from("/proc/net/route"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        RouteTableCapabilities { path: path.into() }
    }

    /// Flags of the first default route, if any
    fn default_route_flags(&self) -> Option<u32> {
        let table = std::fs::read_to_string(&self.path).ok()?;
        table.lines().skip(1).find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // Iface Destination Gateway Flags ...
            if fields.len() >= 4 && fields[1] == "00000000" {
                u32::from_str_radix(fields[3], 16).ok()
            } else {
                None
            }
        })
    }
}

impl Default for RouteTableCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkCapabilities for RouteTableCapabilities {
    fn has_internet(&self) -> bool {
        self.default_route_flags().is_some()
    }

    fn is_validated(&self) -> bool {
        self.default_route_flags()
            .map(|flags| flags & (RTF_UP | RTF_GATEWAY) == (RTF_UP | RTF_GATEWAY))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct Caps(bool, bool);

    impl NetworkCapabilities for Caps {
        fn has_internet(&self) -> bool {
            self.0
        }

        fn is_validated(&self) -> bool {
            self.1
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_probe_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpReachabilityProbe::new("127.0.0.1", port, Duration::from_secs(1), Arc::new(Caps(false, false)));
        assert!(probe.probe().await);
    }

    #[tokio::test]
    async fn test_probe_capability_fallback() {
        let port = closed_port().await;
        let timeout = Duration::from_millis(500);

        let validated = TcpReachabilityProbe::new("127.0.0.1", port, timeout, Arc::new(Caps(true, true)));
        assert!(validated.probe().await);

        let unvalidated = TcpReachabilityProbe::new("127.0.0.1", port, timeout, Arc::new(Caps(true, false)));
        assert!(!unvalidated.probe().await);
    }

    #[test]
    fn test_route_table_capabilities() {
        let path = std::env::temp_dir().join(format!("sfkt-route-{}", std::process::id()));
        std::fs::write(
            &path,
            "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\n\
             eth0\t0000A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\n\
             eth0\t00000000\t0100A8C0\t0003\t0\t0\t0\t00000000\n",
        )
        .unwrap();

        let caps = RouteTableCapabilities::with_path(&path);
        assert!(caps.has_internet());
        assert!(caps.is_validated());
        std::fs::remove_file(&path).unwrap();

        let missing = RouteTableCapabilities::with_path("/nonexistent/route");
        assert!(!missing.has_internet());
        assert!(!missing.is_validated());
    }
}
