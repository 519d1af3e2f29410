//! Persisted inbound records as seen by the engine core
//!
//! These mirror the rows owned by the panel database. The core only
//! reads them; the settings blobs stay opaque JSON text until synthesis.

use serde::{Deserialize, Serialize};

/// Inbound protocol.
///
/// Names the core does not know are kept in [`Protocol::Other`] and written
/// back byte for byte, so the engine sees exactly what the panel stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    Vmess,
    Vless,
    Dokodemo,
    Http,
    Socks,
    Trojan,
    Shadowsocks,
    Other(String),
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Dokodemo => "dokodemo-door",
            Protocol::Http => "http",
            Protocol::Socks => "socks",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Other(name) => name,
        }
    }
}

impl From<String> for Protocol {
    fn from(name: String) -> Self {
        match name.as_str() {
            "vmess" => Protocol::Vmess,
            "vless" => Protocol::Vless,
            "dokodemo-door" => Protocol::Dokodemo,
            "http" => Protocol::Http,
            "socks" => Protocol::Socks,
            "trojan" => Protocol::Trojan,
            "shadowsocks" => Protocol::Shadowsocks,
            _ => Protocol::Other(name),
        }
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// Protocol spoken towards a forwarding backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendProtocol {
    Http,
    Socks,
    /// No forward-server concept; expressed as a dialer-proxy override
    Dokodemo,
}

impl BackendProtocol {
    /// Resolve the persisted protocol name. Unset or unknown names fall back to HTTP.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(str::trim).unwrap_or_default() {
            "socks" => BackendProtocol::Socks,
            "dokodemo" | "dokodemo-door" => BackendProtocol::Dokodemo,
            "http" | "" => BackendProtocol::Http,
            other => {
                tracing::debug!(protocol = other, "unknown backend protocol, using http");
                BackendProtocol::Http
            }
        }
    }
}

/// Per-client usage accounting, maintained by the traffic collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTraffic {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub inbound_id: i64,
    pub enable: bool,
    pub email: String,
    #[serde(default)]
    pub up: i64,
    #[serde(default)]
    pub down: i64,
    /// Milliseconds since epoch, 0 = never expires
    #[serde(default)]
    pub expiry_time: i64,
    /// Byte quota, 0 = unlimited
    #[serde(default)]
    pub total: i64,
}

impl ClientTraffic {
    pub fn new(email: impl Into<String>, enable: bool) -> Self {
        Self {
            id: 0,
            inbound_id: 0,
            enable,
            email: email.into(),
            up: 0,
            down: 0,
            expiry_time: 0,
            total: 0,
        }
    }

    /// Whether the client crossed its expiry time or traffic quota at `now_ms`
    pub fn is_exhausted(&self, now_ms: i64) -> bool {
        let over_quota = self.total > 0 && self.up + self.down >= self.total;
        let expired = self.expiry_time > 0 && self.expiry_time <= now_ms;
        over_quota || expired
    }
}

/// Inbound listener as stored in the panel database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub up: i64,
    #[serde(default)]
    pub down: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub remark: String,
    pub enable: bool,
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub client_stats: Vec<ClientTraffic>,

    #[serde(default)]
    pub listen: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub settings: String,
    #[serde(default)]
    pub stream_settings: String,
    pub tag: String,
    #[serde(default)]
    pub sniffing: String,

    #[serde(default)]
    pub backend_address: Option<String>,
    #[serde(default)]
    pub backend_port: Option<u16>,
    #[serde(default)]
    pub backend_protocol: Option<String>,
    #[serde(default)]
    pub enable_backend: bool,
}

impl InboundRecord {
    /// Minimal enabled record, mostly useful for fixtures
    pub fn new(tag: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            id: 0,
            user_id: 0,
            up: 0,
            down: 0,
            total: 0,
            remark: String::new(),
            enable: true,
            expiry_time: 0,
            client_stats: Vec::new(),
            listen: String::new(),
            port,
            protocol,
            settings: String::new(),
            stream_settings: String::new(),
            tag: tag.into(),
            sniffing: String::new(),
            backend_address: None,
            backend_port: None,
            backend_protocol: None,
            enable_backend: false,
        }
    }

    /// Backend forwarding target, if forwarding is switched on and fully specified
    pub fn backend_target(&self) -> Option<(&str, u16)> {
        if !self.enable_backend {
            return None;
        }
        let address = self.backend_address.as_deref().filter(|a| !a.is_empty())?;
        let port = self.backend_port.filter(|p| *p > 0)?;
        Some((address, port))
    }

    pub fn backend_protocol(&self) -> BackendProtocol {
        BackendProtocol::from_name(self.backend_protocol.as_deref())
    }
}
