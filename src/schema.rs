//! Typed configuration of the relay process
//!
//! The relay reads one JSON document. Sections the control plane never touches
//! (`log`, `routing`, `dns`, ...) are carried as opaque JSON; the parts it
//! rewrites (policy levels, inbounds, client lists, stream settings and the
//! registration outbound) are typed. Unknown keys inside typed sections are
//! preserved through `extra` maps so a template round-trips unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Complete relay configuration, compared structurally to skip no-op restarts
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Policy>,

    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,

    #[serde(default)]
    pub outbounds: Vec<Outbound>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RelayConfig {
    /// Find an inbound by tag
    pub fn inbound(&self, tag: &str) -> Option<&InboundConfig> {
        self.inbounds.iter().find(|i| i.tag == tag)
    }

    /// Find an outbound by tag
    pub fn outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag() == Some(tag))
    }

    /// Insert an outbound, replacing any existing one with the same tag
    pub fn upsert_outbound(&mut self, outbound: Outbound) {
        let tag = outbound.tag().map(str::to_owned);
        match self
            .outbounds
            .iter_mut()
            .find(|o| tag.is_some() && o.tag() == tag.as_deref())
        {
            Some(existing) => *existing = outbound,
            None => self.outbounds.push(outbound),
        }
    }

    /// Port of the inbound with the given tag, if it is a plain port number
    pub fn inbound_port(&self, tag: &str) -> Option<u16> {
        self.inbound(tag).and_then(InboundConfig::port_number)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub levels: BTreeMap<String, LevelPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-user-level connection policy
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_idle: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_only: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downlink_only: Option<u32>,

    /// Buffer size in KiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_user_uplink: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_user_downlink: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    /// A port number or a port range string
    pub port: Value,

    pub protocol: String,

    #[serde(default)]
    pub settings: InboundSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,

    pub tag: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundConfig {
    pub fn port_number(&self) -> Option<u16> {
        match &self.port {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Protocol settings of an inbound; only the client list is typed
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<ClientEntry>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The fields of a client that the relay needs; anything else is dropped
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// Transport settings of an inbound
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<Map<String, Value>>,

    /// Panel-side hint for share links, never meant for the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_proxy: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockopt: Option<SockOpt>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StreamSettings {
    /// Drop fields that only matter to the admin surface
    pub fn strip_volatile(&mut self) {
        for security in [&mut self.tls_settings, &mut self.reality_settings]
            .into_iter()
            .flatten()
        {
            security.remove("settings");
        }
        self.external_proxy = None;
    }
}

/// Socket options applied to a listener or dialer
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SockOpt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_fast_open: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_keep_alive_interval: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_no_delay: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SockOpt {
    /// Fill every option not set here from `defaults`
    pub fn fill_from(&mut self, defaults: &SockOpt) {
        self.tcp_fast_open = self.tcp_fast_open.or(defaults.tcp_fast_open);
        self.tcp_keep_alive_interval = self
            .tcp_keep_alive_interval
            .or(defaults.tcp_keep_alive_interval);
        self.tcp_no_delay = self.tcp_no_delay.or(defaults.tcp_no_delay);
    }
}

/// Outbound leg of the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    /// Tunnel built from the registration credential
    Wireguard(WireguardOutbound),
    /// Any other outbound from the template, carried verbatim
    Other(GenericOutbound),
}

impl Outbound {
    pub fn tag(&self) -> Option<&str> {
        match self {
            Outbound::Wireguard(w) => Some(&w.tag),
            Outbound::Other(o) => o.tag.as_deref(),
        }
    }

    pub fn protocol(&self) -> &str {
        match self {
            Outbound::Wireguard(_) => "wireguard",
            Outbound::Other(o) => &o.protocol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireguardProtocol {
    Wireguard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireguardOutbound {
    pub protocol: WireguardProtocol,
    pub tag: String,
    pub settings: WireguardSettings,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireguardSettings {
    pub secret_key: String,
    pub address: Vec<String>,
    pub peers: Vec<WireguardPeer>,
    pub mtu: u32,
    pub workers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved: Option<Vec<u8>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireguardPeer {
    pub public_key: String,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    pub endpoint: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericOutbound {
    pub protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
