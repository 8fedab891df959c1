//! Virtual network interface capability
//!
//! An interface is acquired through an [`InterfaceProvider`] and handed
//! back as a boxed [`VirtualInterface`] that owns the device descriptor.
//! Closing or dropping it releases the device and every route/rule that
//! was installed for it, so partial failures unwind on their own.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::{resolve_app_uid, LinuxTunProvider};

use crate::config::{NetworkSettings, TunSettings};
use crate::Result;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;

/// Everything needed to bring up the tunnel device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    pub name: String,
    pub mtu: u32,
    pub address: Ipv4Net,
    pub dns_servers: Vec<String>,
    pub routes: Vec<Ipv4Net>,
    /// Keep this process's own traffic off the tunnel
    pub exclude_self: bool,
    /// Applications whose traffic bypasses the tunnel
    pub excluded_apps: Vec<String>,
}

impl InterfaceRequest {
    /// Full-tunnel request: default route, both DNS servers, own traffic excluded
    pub fn from_settings(tun: &TunSettings, network: &NetworkSettings) -> Self {
        InterfaceRequest {
            name: tun.name.clone(),
            mtu: tun.mtu,
            address: tun.address,
            dns_servers: vec![network.primary_dns.clone(), network.secondary_dns.clone()],
            routes: Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).into_iter().collect(),
            exclude_self: true,
            excluded_apps: tun.excluded_apps.clone(),
        }
    }
}

/// An established tunnel device
pub trait VirtualInterface: Send + Sync {
    fn name(&self) -> &str;

    /// Raw descriptor handed to the forwarding engine; owned by the interface
    fn raw_fd(&self) -> RawFd;

    /// Release the device; calling it again is a no-op
    fn close(&mut self);
}

/// Platform hook that allocates tunnel devices
pub trait InterfaceProvider: Send + Sync {
    /// Blocking; run it off the async executor
    fn establish(&self, request: &InterfaceRequest) -> Result<Box<dyn VirtualInterface>>;
}
