//! Seams to the external stores the control plane reads from
//!
//! Routing rules and their client records are owned by the rule store; the
//! settings store is a flat key/value space holding the template text and the
//! registration credential.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Settings key of the relay configuration template
pub const TEMPLATE_KEY: &str = "relayTemplate";

/// Settings key of the registration credential
pub const CREDENTIAL_KEY: &str = "registration";

/// Settings key of the last remote configuration fetched for the credential
pub const REMOTE_CONFIG_KEY: &str = "registrationConfig";

/// Flat key/value settings storage
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Source of routing rules
pub trait RuleStore: Send + Sync {
    /// All enabled rules, in enumeration order
    fn list_enabled_rules(&self) -> Result<Vec<RoutingRule>>;
}

/// A named entry point of the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: i64,
    pub tag: String,
    pub enabled: bool,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    /// Protocol settings JSON, including the raw client list
    pub settings: String,
    /// Transport settings JSON (may be empty)
    pub stream_settings: String,
    /// Sniffing settings JSON (may be empty)
    pub sniffing: String,
    /// Usage records of the clients of this rule
    pub client_records: Vec<ClientRecord>,
}

/// Entitlement state of one client within a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub email: String,
    /// False once the client expired or went over its usage cap
    pub enabled: bool,
}

impl ClientRecord {
    pub fn new(email: impl Into<String>, enabled: bool) -> Self {
        Self {
            email: email.into(),
            enabled,
        }
    }
}
