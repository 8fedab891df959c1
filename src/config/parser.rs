//! Connection descriptor parser
//!
//! Decodes `vless://identity@host:port?query#label` into a
//! [`ConnectionDescriptor`]. A parse either yields a complete descriptor
//! or an [`Error::Parse`]; nothing in between.

use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Scheme prefix accepted by the parser
pub const VLESS_SCHEME: &str = "vless://";

/// Label used when the URI has none or it fails to decode
pub const DEFAULT_LABEL: &str = "Server";

/// Port used when the port segment is not a valid number
pub const DEFAULT_PORT: u16 = 443;

const DEFAULT_FINGERPRINT: &str = "chrome";
const DEFAULT_PATH: &str = "/";

/// Stream transport carried by the proxy outbound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Ws,
    Xhttp,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [TransportKind::Tcp, TransportKind::Ws, TransportKind::Xhttp];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Ws => "ws",
            TransportKind::Xhttp => "xhttp",
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "ws" => Ok(TransportKind::Ws),
            "xhttp" => Ok(TransportKind::Xhttp),
            other => Err(Error::parse(format!("Unsupported transport type: {}", other))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security layer wrapped around the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityKind {
    None,
    Tls,
    Reality,
}

impl SecurityKind {
    pub const ALL: [SecurityKind; 3] = [SecurityKind::None, SecurityKind::Tls, SecurityKind::Reality];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityKind::None => "none",
            SecurityKind::Tls => "tls",
            SecurityKind::Reality => "reality",
        }
    }
}

impl FromStr for SecurityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(SecurityKind::None),
            "tls" => Ok(SecurityKind::Tls),
            "reality" => Ok(SecurityKind::Reality),
            other => Err(Error::parse(format!("Unsupported security type: {}", other))),
        }
    }
}

impl fmt::Display for SecurityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed connection parameters of a single server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionDescriptor {
    /// User identity token (VLESS uuid)
    pub identity: String,
    pub address: String,
    pub port: u16,
    pub transport: TransportKind,
    pub security: SecurityKind,
    /// Server name indication (tls / reality)
    pub sni: String,
    /// Client hello fingerprint (tls / reality)
    pub fingerprint: String,
    /// Reality public key
    pub public_key: String,
    /// Reality short id
    pub short_id: String,
    /// Request path for ws / xhttp
    pub path: String,
    pub label: String,
}

impl ConnectionDescriptor {
    /// Parse a descriptor URI
    pub fn parse(uri: &str) -> Result<Self> {
        parse_descriptor(uri)
    }

    /// Render back into the URI grammar accepted by [`parse_descriptor`]
    pub fn to_uri(&self) -> String {
        let enc = |s: &str| urlencoding::encode(s).into_owned();
        format!(
            "{}{}@{}:{}?type={}&security={}&sni={}&fp={}&pbk={}&sid={}&path={}#{}",
            VLESS_SCHEME,
            enc(&self.identity),
            self.address,
            self.port,
            self.transport,
            self.security,
            enc(&self.sni),
            enc(&self.fingerprint),
            enc(&self.public_key),
            enc(&self.short_id),
            enc(&self.path),
            enc(&self.label),
        )
    }

    /// `host:port` of the remote server
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_descriptor(s)
    }
}

/// Parse `vless://identity@host:port?query#label`
pub fn parse_descriptor(uri: &str) -> Result<ConnectionDescriptor> {
    let rest = uri
        .strip_prefix(VLESS_SCHEME)
        .ok_or_else(|| Error::parse("Not a VLESS URL"))?;

    // Split by # to get the label
    let (head, label) = match rest.split_once('#') {
        Some((head, raw)) => {
            let label = urlencoding::decode(raw)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| DEFAULT_LABEL.to_string());
            (head, label)
        }
        None => (rest, DEFAULT_LABEL.to_string()),
    };

    let (authority, query) = head.split_once('?').unwrap_or((head, ""));

    let (identity, host_port) = authority
        .rsplit_once('@')
        .ok_or_else(|| Error::parse("Invalid VLESS URL format: no @"))?;

    let (address, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| Error::parse("Invalid VLESS URL format: no port"))?;

    // A garbled port is not fatal
    let port = port.parse::<u16>().unwrap_or(DEFAULT_PORT);

    if identity.is_empty() {
        return Err(Error::parse("Invalid VLESS URL format: empty identity"));
    }
    if address.is_empty() {
        return Err(Error::parse("Invalid VLESS URL format: empty host"));
    }

    let mut params = parse_query(query)?;
    let mut take = |key: &str, default: &str| params.remove(key).unwrap_or_else(|| default.to_string());

    let transport = take("type", "tcp").parse()?;
    let security = take("security", "none").parse()?;

    // Percent-escaped identities decode; anything else is taken verbatim
    let identity = urlencoding::decode(identity)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| identity.to_string());

    Ok(ConnectionDescriptor {
        identity,
        address: address.to_string(),
        port,
        transport,
        security,
        sni: take("sni", ""),
        fingerprint: take("fp", DEFAULT_FINGERPRINT),
        public_key: take("pbk", ""),
        short_id: take("sid", ""),
        path: take("path", DEFAULT_PATH),
        label,
    })
}

fn parse_query(query: &str) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    if query.is_empty() {
        return Ok(params);
    }

    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            let value = urlencoding::decode(value)
                .map_err(|e| Error::parse(format!("Invalid value for '{}': {}", key, e)))?;
            params.insert(key.to_string(), value.into_owned());
        }
    }

    Ok(params)
}
