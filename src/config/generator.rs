//! Engine configuration generator
//!
//! Turns a [`ConnectionDescriptor`] plus the local network settings into
//! the document consumed by the proxy engine, and produces the small
//! YAML file the forwarding engine reads. Both are plain data: field
//! declaration order is serialization order, so identical inputs always
//! serialize to identical bytes.

use super::parser::{ConnectionDescriptor, SecurityKind, TransportKind};
use super::NetworkSettings;
use serde::Serialize;
use std::path::Path;
use tokio::fs;

/// Tag of the outbound built from the descriptor
pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";

/// Address ranges that never leave through the proxy
pub const PRIVATE_RANGES: [&str; 5] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
];

const ENGINE_LOG_LEVEL: &str = "warning";
const DOMAIN_STRATEGY: &str = "IPIfNonMatch";
const DNS_PORT: u16 = 53;

/// Full proxy engine configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfigDocument {
    pub log: LogSection,
    pub dns: DnsSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub routing: Routing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSection {
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsSection {
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inbound {
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: SocksSettings,
    pub sniffing: Sniffing,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SocksSettings {
    pub udp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<VlessSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlessSettings {
    pub vnext: Vec<VlessServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlessServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VlessUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlessUser {
    pub id: String,
    pub encryption: String,
    pub flow: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xhttp_settings: Option<PathSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<PathSettings>,
    pub security: SecurityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathSettings {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    pub server_name: String,
    pub fingerprint: String,
    pub public_key: String,
    pub short_id: String,
    pub spider_x: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub domain_strategy: String,
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub ip: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub outbound_tag: String,
}

impl EngineConfigDocument {
    /// Pretty JSON with a trailing newline
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Write the document to the artifact path read by the proxy engine
    pub async fn write_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = self.to_json().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;
        write_artifact(path.as_ref(), json).await
    }
}

/// Build the proxy engine document. Pure: no I/O, no clock, no randomness.
pub fn generate_config(descriptor: &ConnectionDescriptor, network: &NetworkSettings) -> EngineConfigDocument {
    let dns_servers = vec![network.primary_dns.clone(), network.secondary_dns.clone()];

    EngineConfigDocument {
        log: LogSection {
            loglevel: ENGINE_LOG_LEVEL.to_string(),
        },
        dns: DnsSection {
            servers: dns_servers.clone(),
        },
        inbounds: vec![socks_inbound(network)],
        outbounds: vec![
            proxy_outbound(descriptor),
            Outbound {
                protocol: "freedom".to_string(),
                settings: None,
                stream_settings: None,
                tag: DIRECT_TAG.to_string(),
            },
            Outbound {
                protocol: "blackhole".to_string(),
                settings: None,
                stream_settings: None,
                tag: BLOCK_TAG.to_string(),
            },
        ],
        routing: Routing {
            domain_strategy: DOMAIN_STRATEGY.to_string(),
            rules: vec![
                // DNS through proxy
                RoutingRule {
                    ip: dns_servers,
                    port: Some(DNS_PORT),
                    outbound_tag: PROXY_TAG.to_string(),
                },
                RoutingRule {
                    ip: PRIVATE_RANGES.iter().map(|r| r.to_string()).collect(),
                    port: None,
                    outbound_tag: DIRECT_TAG.to_string(),
                },
            ],
        },
    }
}

fn socks_inbound(network: &NetworkSettings) -> Inbound {
    Inbound {
        listen: network.socks_address.clone(),
        port: network.socks_port,
        protocol: "socks".to_string(),
        settings: SocksSettings { udp: true },
        sniffing: Sniffing {
            enabled: true,
            dest_override: vec!["http".to_string(), "tls".to_string(), "quic".to_string()],
        },
        tag: "socks".to_string(),
    }
}

fn proxy_outbound(d: &ConnectionDescriptor) -> Outbound {
    let path = || {
        Some(PathSettings {
            path: d.path.clone(),
        })
    };

    let (xhttp_settings, ws_settings) = match d.transport {
        TransportKind::Xhttp => (path(), None),
        TransportKind::Ws => (None, path()),
        TransportKind::Tcp => (None, None),
    };

    let (reality_settings, tls_settings) = match d.security {
        SecurityKind::Reality => (
            Some(RealitySettings {
                server_name: d.sni.clone(),
                fingerprint: d.fingerprint.clone(),
                public_key: d.public_key.clone(),
                short_id: d.short_id.clone(),
                spider_x: String::new(),
            }),
            None,
        ),
        SecurityKind::Tls => (
            None,
            Some(TlsSettings {
                server_name: d.sni.clone(),
                fingerprint: d.fingerprint.clone(),
            }),
        ),
        SecurityKind::None => (None, None),
    };

    Outbound {
        protocol: "vless".to_string(),
        settings: Some(VlessSettings {
            vnext: vec![VlessServer {
                address: d.address.clone(),
                port: d.port,
                users: vec![VlessUser {
                    id: d.identity.clone(),
                    encryption: "none".to_string(),
                    flow: String::new(),
                }],
            }],
        }),
        stream_settings: Some(StreamSettings {
            network: d.transport,
            xhttp_settings,
            ws_settings,
            security: d.security,
            reality_settings,
            tls_settings,
        }),
        tag: PROXY_TAG.to_string(),
    }
}

/// Forwarding engine (tun2socks) configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardingConfig {
    pub tunnel: ForwardingTunnel,
    pub socks5: ForwardingSocks,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardingTunnel {
    pub name: String,
    pub mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardingSocks {
    pub address: String,
    pub port: u16,
    pub udp: String,
}

impl ForwardingConfig {
    pub fn new(tunnel_name: &str, mtu: u32, network: &NetworkSettings) -> Self {
        ForwardingConfig {
            tunnel: ForwardingTunnel {
                name: tunnel_name.to_string(),
                mtu,
            },
            socks5: ForwardingSocks {
                address: network.socks_address.clone(),
                port: network.socks_port,
                udp: "udp".to_string(),
            },
        }
    }

    /// Serialize to YAML string
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Write configuration to file
    pub async fn write_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let yaml = self.to_yaml().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;
        write_artifact(path.as_ref(), yaml).await
    }
}

async fn write_artifact(path: &Path, content: String) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    fs::write(path, content).await
}
