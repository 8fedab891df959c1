//! Linux TUN device via /dev/net/tun
//!
//! The device is configured with `ip`. Traffic is steered into the tunnel
//! by policy routing: a dedicated table carries the tunnel routes, and uid
//! rules with higher priority send excluded users back to `main`.

use super::{InterfaceProvider, InterfaceRequest, VirtualInterface};
use crate::{Error, Result};
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info, warn};

const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// Routing table holding the tunnel routes
const DEFAULT_ROUTE_TABLE: u32 = 10808;
/// Priority of uid exclusion rules; the tunnel rule sits right after them
const EXCLUSION_PRIORITY: u32 = 9000;

/// `struct ifreq` as TUNSETIFF reads it
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IF_NAMESIZE],
    flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> Self {
        let mut ifr = IfReq {
            name: [0; libc::IF_NAMESIZE],
            flags,
            _pad: [0; 22],
        };
        for (dst, src) in ifr.name.iter_mut().zip(name.bytes().take(libc::IF_NAMESIZE - 1)) {
            *dst = src as libc::c_char;
        }
        ifr
    }

    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Resolve an excluded application id to a uid: numeric ids are taken
/// as-is, anything else is looked up as a user name.
pub fn resolve_app_uid(app: &str) -> Option<u32> {
    if let Ok(uid) = app.parse::<u32>() {
        return Some(uid);
    }
    nix::unistd::User::from_name(app)
        .ok()
        .flatten()
        .map(|user| user.uid.as_raw())
}

fn ip(args: &[&str]) -> std::result::Result<(), String> {
    debug!("ip {}", args.join(" "));
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| format!("failed to run ip: {}", e))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Allocates tunnel devices on Linux; needs CAP_NET_ADMIN
pub struct LinuxTunProvider {
    device: PathBuf,
    route_table: u32,
}

impl LinuxTunProvider {
    pub fn new() -> Self {
        LinuxTunProvider {
            device: PathBuf::from("/dev/net/tun"),
            route_table: DEFAULT_ROUTE_TABLE,
        }
    }

    pub fn with_device(mut self, device: impl Into<PathBuf>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_route_table(mut self, table: u32) -> Self {
        self.route_table = table;
        self
    }

    fn open(&self, request: &InterfaceRequest) -> Result<(OwnedFd, String)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .map_err(|e| Error::interface(format!("open {}: {}", self.device.display(), e)))?;

        let mut ifr = IfReq::new(&request.name, IFF_TUN | IFF_NO_PI);
        // SAFETY: fd is open and ifr is a properly sized, initialized ifreq
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr as *mut IfReq) };
        if rc < 0 {
            return Err(Error::interface(format!(
                "TUNSETIFF {}: {}",
                request.name,
                std::io::Error::last_os_error()
            )));
        }

        Ok((OwnedFd::from(file), ifr.name()))
    }
}

impl Default for LinuxTunProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceProvider for LinuxTunProvider {
    fn establish(&self, request: &InterfaceRequest) -> Result<Box<dyn VirtualInterface>> {
        let (fd, name) = self.open(request)?;
        info!("Allocated tun device {}", name);

        // From here on, dropping `tun` undoes whatever was applied
        let mut tun = LinuxTun {
            fd: Some(fd),
            name,
            route_table: self.route_table,
            rule_priorities: Vec::new(),
            dns_applied: false,
        };
        tun.configure(request).map_err(Error::interface)?;
        Ok(Box::new(tun))
    }
}

/// Established device plus the routing state installed for it
struct LinuxTun {
    fd: Option<OwnedFd>,
    name: String,
    route_table: u32,
    rule_priorities: Vec<u32>,
    dns_applied: bool,
}

impl LinuxTun {
    fn configure(&mut self, request: &InterfaceRequest) -> std::result::Result<(), String> {
        let name = self.name.clone();
        let table = self.route_table.to_string();

        ip(&["addr", "add", &request.address.to_string(), "dev", &name])?;
        ip(&["link", "set", "dev", &name, "mtu", &request.mtu.to_string(), "up"])?;

        for route in &request.routes {
            ip(&["route", "replace", &route.to_string(), "dev", &name, "table", &table])?;
        }

        let mut excluded: Vec<u32> = Vec::new();
        if request.exclude_self {
            excluded.push(nix::unistd::getuid().as_raw());
        }
        for app in &request.excluded_apps {
            match resolve_app_uid(app) {
                Some(uid) => excluded.push(uid),
                None => warn!("Cannot exclude {}: no such user", app),
            }
        }
        excluded.sort_unstable();
        excluded.dedup();

        let mut priority = EXCLUSION_PRIORITY;
        for uid in excluded {
            let range = format!("{}-{}", uid, uid);
            let prio = priority.to_string();
            match ip(&["rule", "add", "priority", &prio, "uidrange", &range, "lookup", "main"]) {
                Ok(()) => {
                    self.rule_priorities.push(priority);
                    priority += 1;
                }
                Err(e) => warn!("Failed to exclude uid {}: {}", uid, e),
            }
        }

        let prio = priority.to_string();
        ip(&["rule", "add", "priority", &prio, "lookup", &table])?;
        self.rule_priorities.push(priority);

        if !request.dns_servers.is_empty() {
            let mut args = vec!["dns", name.as_str()];
            args.extend(request.dns_servers.iter().map(String::as_str));
            match Command::new("resolvectl").args(&args).output() {
                Ok(output) if output.status.success() => self.dns_applied = true,
                Ok(output) => warn!(
                    "Failed to set DNS on {}: {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => warn!("Failed to set DNS on {}: {}", name, e),
            }
        }

        debug!("{} configured: {} mtu {}", name, request.address, request.mtu);
        Ok(())
    }
}

impl VirtualInterface for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    fn close(&mut self) {
        let Some(fd) = self.fd.take() else {
            return;
        };

        for priority in self.rule_priorities.drain(..).rev() {
            if let Err(e) = ip(&["rule", "del", "priority", &priority.to_string()]) {
                debug!("rule {} cleanup: {}", priority, e);
            }
        }
        if let Err(e) = ip(&["route", "flush", "table", &self.route_table.to_string()]) {
            debug!("route cleanup: {}", e);
        }
        if self.dns_applied {
            let _ = Command::new("resolvectl").args(["revert", &self.name]).output();
        }

        // The device is not persistent; closing the fd removes it
        drop(fd);
        info!("Released tun device {}", self.name);
    }
}

impl Drop for LinuxTun {
    fn drop(&mut self) {
        self.close();
    }
}
