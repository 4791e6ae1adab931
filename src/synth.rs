//! Configuration synthesis
//!
//! Builds the complete relay configuration from the stored template, the
//! cached registration credential and every enabled routing rule.

use crate::config::{Config, MissingRecordPolicy, RegistrationConfig, TuningConfig};
use crate::error::{ControlError, Result};
use crate::filter::filter_clients;
use crate::registration::RegistrationCredential;
use crate::schema::{
    InboundConfig, InboundSettings, Outbound, RelayConfig, StreamSettings, WireguardOutbound,
    WireguardPeer, WireguardProtocol, WireguardSettings,
};
use crate::store::{RoutingRule, RuleStore, SettingsStore, REMOTE_CONFIG_KEY, TEMPLATE_KEY};
use crate::template::{merge_template, socket_options, DEFAULT_TEMPLATE};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Interface address used until the remote configuration has been fetched
const FALLBACK_ADDRESS: &str = "172.16.0.2/32";

/// Anything that can produce a complete relay configuration
pub trait ConfigSource: Send + Sync {
    fn synthesize(&self) -> Result<RelayConfig>;
}

/// Builds relay configurations from the settings and rule stores
pub struct Synthesizer {
    settings: Arc<dyn SettingsStore>,
    rules: Arc<dyn RuleStore>,
    tuning: TuningConfig,
    registration: RegistrationConfig,
    missing_record: MissingRecordPolicy,
}

impl Synthesizer {
    pub fn new(settings: Arc<dyn SettingsStore>, rules: Arc<dyn RuleStore>, config: &Config) -> Self {
        Self {
            settings,
            rules,
            tuning: config.tuning.clone(),
            registration: config.registration.clone(),
            missing_record: config.filter.missing_record,
        }
    }

    /// Build a fresh configuration.
    ///
    /// Template and store failures abort the call; a rule that cannot be
    /// parsed is logged and left out.
    pub fn synthesize(&self) -> Result<RelayConfig> {
        let template = self
            .settings
            .get(TEMPLATE_KEY)?
            .filter(|t| !t.trim().is_empty());
        let mut config = merge_template(template.as_deref().unwrap_or(DEFAULT_TEMPLATE), &self.tuning)?;

        match RegistrationCredential::load(self.settings.as_ref())? {
            Some(credential) if !credential.is_empty() => {
                let remote = self.cached_remote_config()?;
                config.upsert_outbound(self.registration_outbound(&credential, remote.as_ref()));
            }
            _ => debug!("No registration credential stored, skipping registration outbound"),
        }

        for rule in self.rules.list_enabled_rules()? {
            if !rule.enabled {
                continue;
            }
            match self.build_inbound(&rule) {
                Ok(inbound) => config.inbounds.push(inbound),
                Err(e) => warn!(tag = %rule.tag, error = %e, "Skipping routing rule"),
            }
        }

        Ok(config)
    }

    fn build_inbound(&self, rule: &RoutingRule) -> Result<InboundConfig> {
        let parse_error = |source: serde_json::Error| ControlError::RuleParse {
            tag: rule.tag.clone(),
            source,
        };

        let mut settings: Map<String, Value> = parse_blob(&rule.settings)
            .map_err(parse_error)?
            .unwrap_or_default();

        // Only a client list is filtered; anything else is passed through as is
        let clients = match settings.remove("clients") {
            Some(Value::Array(raw)) => Some(filter_clients(
                &rule.tag,
                &raw,
                &rule.client_records,
                self.missing_record,
            )),
            Some(other) => {
                debug!(tag = %rule.tag, "Rule has no client list, skipping client filter");
                settings.insert("clients".to_string(), other);
                None
            }
            None => None,
        };

        let mut stream: StreamSettings = parse_blob(&rule.stream_settings)
            .map_err(parse_error)?
            .unwrap_or_default();
        stream.strip_volatile();
        stream
            .sockopt
            .get_or_insert_with(Default::default)
            .fill_from(&socket_options(&self.tuning));

        let sniffing: Option<Value> = parse_blob(&rule.sniffing).map_err(parse_error)?;

        Ok(InboundConfig {
            listen: (!rule.listen.is_empty()).then(|| rule.listen.clone()),
            port: Value::from(rule.port),
            protocol: rule.protocol.clone(),
            settings: InboundSettings {
                clients,
                extra: settings,
            },
            stream_settings: Some(stream),
            tag: rule.tag.clone(),
            sniffing,
            extra: Map::new(),
        })
    }

    fn cached_remote_config(&self) -> Result<Option<Value>> {
        let Some(raw) = self.settings.get(REMOTE_CONFIG_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable cached registration config");
                Ok(None)
            }
        }
    }

    fn registration_outbound(&self, credential: &RegistrationCredential, remote: Option<&Value>) -> Outbound {
        let lookup = |pointer: &str| {
            remote
                .and_then(|r| r.pointer(pointer))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        };

        let mut address = Vec::new();
        if let Some(v4) = lookup("/config/interface/addresses/v4") {
            address.push(format!("{}/32", v4));
        }
        if let Some(v6) = lookup("/config/interface/addresses/v6") {
            address.push(format!("{}/128", v6));
        }
        if address.is_empty() {
            address.push(FALLBACK_ADDRESS.to_string());
        }

        let reserved = lookup("/config/client_id")
            .and_then(|id| base64::engine::general_purpose::STANDARD.decode(id).ok())
            .filter(|bytes| bytes.len() == 3);

        let peer = WireguardPeer {
            public_key: lookup("/config/peers/0/public_key")
                .unwrap_or(&self.registration.peer_public_key)
                .to_string(),
            allowed_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            endpoint: lookup("/config/peers/0/endpoint/host")
                .unwrap_or(&self.registration.peer_endpoint)
                .to_string(),
            extra: Map::new(),
        };

        Outbound::Wireguard(WireguardOutbound {
            protocol: WireguardProtocol::Wireguard,
            tag: self.registration.outbound_tag.clone(),
            settings: WireguardSettings {
                secret_key: credential.private_key.clone(),
                address,
                peers: vec![peer],
                mtu: self.registration.mtu,
                workers: self.registration.workers,
                domain_strategy: None,
                reserved,
                extra: Map::new(),
            },
            extra: Map::new(),
        })
    }
}

impl ConfigSource for Synthesizer {
    fn synthesize(&self) -> Result<RelayConfig> {
        Synthesizer::synthesize(self)
    }
}

/// Parse an optional JSON blob; blank text means absent
fn parse_blob<T: DeserializeOwned>(raw: &str) -> serde_json::Result<Option<T>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClientRecord, CREDENTIAL_KEY};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryStore {
        settings: Mutex<HashMap<String, String>>,
        rules: Mutex<Vec<RoutingRule>>,
    }

    impl SettingsStore for MemoryStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            Ok(self.settings.lock().get(key).cloned())
        }

        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.settings.lock().insert(key.to_string(), value.to_string());
            Ok(())
        }
    }

    impl RuleStore for MemoryStore {
        fn list_enabled_rules(&self) -> anyhow::Result<Vec<RoutingRule>> {
            Ok(self.rules.lock().clone())
        }
    }

    fn rule(tag: &str, settings: Value, records: Vec<ClientRecord>) -> RoutingRule {
        RoutingRule {
            id: 1,
            tag: tag.to_string(),
            enabled: true,
            listen: String::new(),
            port: 443,
            protocol: "vless".to_string(),
            settings: settings.to_string(),
            stream_settings: String::new(),
            sniffing: String::new(),
            client_records: records,
        }
    }

    fn synthesizer(store: &Arc<MemoryStore>) -> Synthesizer {
        Synthesizer::new(store.clone(), store.clone(), &Config::default())
    }

    fn client_emails(config: &RelayConfig, tag: &str) -> Vec<String> {
        config
            .inbound(tag)
            .and_then(|i| i.settings.clients.as_ref())
            .map(|clients| clients.iter().filter_map(|c| c.email.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_disabled_client_removed_untracked_client_kept() {
        let store = Arc::new(MemoryStore::default());
        store.rules.lock().push(rule(
            "R1",
            json!({"clients": [{"id": "1", "email": "a@x"}, {"id": "2", "email": "b@x"}], "decryption": "none"}),
            vec![ClientRecord::new("a@x", false)],
        ));

        let config = synthesizer(&store).synthesize().unwrap();

        assert_eq!(client_emails(&config, "R1"), vec!["b@x"]);
        let inbound = config.inbound("R1").unwrap();
        assert_eq!(inbound.settings.extra["decryption"], json!("none"));
        assert_eq!(inbound.port_number(), Some(443));
        assert_eq!(inbound.listen, None);
    }

    #[test]
    fn test_default_template_without_rules_or_credential() {
        let store = Arc::new(MemoryStore::default());

        let config = synthesizer(&store).synthesize().unwrap();

        assert_eq!(config.inbound_port("api"), Some(62789));
        assert!(config.outbound("registration").is_none());
    }

    #[test]
    fn test_malformed_template_aborts() {
        let store = Arc::new(MemoryStore::default());
        store.set(TEMPLATE_KEY, "{ not json").unwrap();

        let err = synthesizer(&store).synthesize().unwrap_err();
        assert!(matches!(err, ControlError::TemplateParse(_)));
    }

    #[test]
    fn test_bad_rule_is_skipped() {
        let store = Arc::new(MemoryStore::default());
        store.rules.lock().push(rule("broken", json!(null), vec![]));
        store.rules.lock()[0].settings = "{oops".to_string();
        store.rules.lock().push(rule("ok", json!({"clients": []}), vec![]));
        store.rules.lock().push(rule("bad-stream", json!({}), vec![]));
        store.rules.lock()[2].stream_settings = "[1, 2".to_string();

        let config = synthesizer(&store).synthesize().unwrap();

        let tags: Vec<_> = config.inbounds.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["api", "ok"]);
    }

    #[test]
    fn test_rule_without_client_list_is_kept() {
        let store = Arc::new(MemoryStore::default());
        let mut dokodemo = rule("dokodemo", json!({"clients": null, "address": "1.1.1.1"}), vec![]);
        dokodemo.protocol = "dokodemo-door".to_string();
        store.rules.lock().push(dokodemo);
        store.rules.lock().push(rule("odd", json!({"clients": 5}), vec![]));

        let config = synthesizer(&store).synthesize().unwrap();

        let tags: Vec<_> = config.inbounds.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["api", "dokodemo", "odd"]);

        let dokodemo = config.inbound("dokodemo").unwrap();
        assert!(dokodemo.settings.clients.is_none());
        assert_eq!(
            serde_json::to_value(&dokodemo.settings).unwrap(),
            json!({"clients": null, "address": "1.1.1.1"})
        );
        assert_eq!(config.inbound("odd").unwrap().settings.extra["clients"], json!(5));
    }

    #[test]
    fn test_inbounds_follow_rule_order() {
        let store = Arc::new(MemoryStore::default());
        for tag in ["c", "a", "b"] {
            store.rules.lock().push(rule(tag, json!({}), vec![]));
        }

        let config = synthesizer(&store).synthesize().unwrap();

        let tags: Vec<_> = config.inbounds.iter().skip(1).map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_stream_settings_stripped_and_tuned() {
        let store = Arc::new(MemoryStore::default());
        let mut r = rule("R1", json!({}), vec![]);
        r.stream_settings = json!({
            "network": "tcp",
            "security": "tls",
            "tlsSettings": {"serverName": "example.com", "settings": {"fingerprint": "chrome"}},
            "externalProxy": [{"dest": "cdn"}],
            "sockopt": {"tcpFastOpen": false}
        })
        .to_string();
        store.rules.lock().push(r);

        let config = synthesizer(&store).synthesize().unwrap();
        let stream = serde_json::to_value(&config.inbound("R1").unwrap().stream_settings).unwrap();

        assert_eq!(
            stream,
            json!({
                "network": "tcp",
                "security": "tls",
                "tlsSettings": {"serverName": "example.com"},
                "sockopt": {"tcpFastOpen": false, "tcpKeepAliveInterval": 30, "tcpNoDelay": true}
            })
        );
    }

    #[test]
    fn test_registration_outbound_from_credential() {
        let store = Arc::new(MemoryStore::default());
        let credential = RegistrationCredential {
            access_token: "T".into(),
            device_id: "D".into(),
            license_key: "L".into(),
            private_key: "PRIVATE".into(),
        };
        credential.save(store.as_ref()).unwrap();
        store
            .set(
                REMOTE_CONFIG_KEY,
                &json!({
                    "config": {
                        "client_id": "AQID",
                        "interface": {"addresses": {"v4": "172.16.0.9", "v6": "fd01::9"}},
                        "peers": [{"public_key": "PEER", "endpoint": {"host": "peer.example:2408"}}]
                    }
                })
                .to_string(),
            )
            .unwrap();

        let config = synthesizer(&store).synthesize().unwrap();

        let Some(Outbound::Wireguard(outbound)) = config.outbound("registration") else {
            panic!("registration outbound missing");
        };
        assert_eq!(outbound.settings.secret_key, "PRIVATE");
        assert_eq!(outbound.settings.address, vec!["172.16.0.9/32", "fd01::9/128"]);
        assert_eq!(outbound.settings.peers[0].public_key, "PEER");
        assert_eq!(outbound.settings.peers[0].endpoint, "peer.example:2408");
        assert_eq!(outbound.settings.reserved, Some(vec![1, 2, 3]));
        assert_eq!(outbound.settings.mtu, 1420);
    }

    #[test]
    fn test_registration_outbound_falls_back_to_defaults() {
        let store = Arc::new(MemoryStore::default());
        store
            .set(
                CREDENTIAL_KEY,
                r#"{"access_token":"T","device_id":"D","license_key":"L","private_key":"K"}"#,
            )
            .unwrap();

        let config = synthesizer(&store).synthesize().unwrap();

        let Some(Outbound::Wireguard(outbound)) = config.outbound("registration") else {
            panic!("registration outbound missing");
        };
        let defaults = RegistrationConfig::default();
        assert_eq!(outbound.settings.address, vec![FALLBACK_ADDRESS]);
        assert_eq!(outbound.settings.peers[0].public_key, defaults.peer_public_key);
        assert_eq!(outbound.settings.peers[0].endpoint, defaults.peer_endpoint);
        assert_eq!(outbound.settings.reserved, None);
    }

    #[test]
    fn test_unchanged_inputs_synthesize_equal_configs() {
        let store = Arc::new(MemoryStore::default());
        store.rules.lock().push(rule("R1", json!({"clients": [{"id": "1", "email": "a@x"}]}), vec![]));
        let synth = synthesizer(&store);

        assert_eq!(synth.synthesize().unwrap(), synth.synthesize().unwrap());
    }
}
