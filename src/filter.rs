//! Client filtering
//!
//! Reduces a rule's raw client list to the clients that are still entitled,
//! minimized to the fields the relay needs.

use crate::config::MissingRecordPolicy;
use crate::schema::ClientEntry;
use crate::store::ClientRecord;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Flow alias accepted by the admin surface but unknown to the relay
const VISION_UDP443_FLOW: &str = "xtls-rprx-vision-udp443";
const VISION_FLOW: &str = "xtls-rprx-vision";

/// Filter `clients` against their usage `records`.
///
/// Order-preserving and infallible: the output never holds more entries than
/// the input, malformed entries are skipped with a warning, and each email
/// appears at most once.
pub fn filter_clients(
    tag: &str,
    clients: &[Value],
    records: &[ClientRecord],
    missing_record: MissingRecordPolicy,
) -> Vec<ClientEntry> {
    // A client is entitled only if none of its records is disabled
    let mut entitled: HashMap<&str, bool> = HashMap::new();
    for record in records {
        let enabled = entitled.entry(record.email.as_str()).or_insert(true);
        *enabled &= record.enabled;
    }

    let mut seen = HashSet::new();
    let mut filtered = Vec::with_capacity(clients.len());

    for (index, raw) in clients.iter().enumerate() {
        let Some(fields) = raw.as_object() else {
            warn!(tag, index, "Skipping client entry that is not an object");
            continue;
        };

        if fields.get("enable").and_then(Value::as_bool) == Some(false) {
            debug!(tag, index, "Skipping disabled client");
            continue;
        }

        let mut entry: ClientEntry = match serde_json::from_value(raw.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(tag, index, error = %e, "Skipping malformed client entry");
                continue;
            }
        };

        let record = entry.email.as_deref().and_then(|email| entitled.get(email));
        match (record, missing_record) {
            (Some(false), _) => {
                info!(
                    tag,
                    email = entry.email.as_deref().unwrap_or_default(),
                    "Removing client due to expiration or traffic limit"
                );
                continue;
            }
            (None, MissingRecordPolicy::Drop) => {
                debug!(tag, index, "Skipping client without usage record");
                continue;
            }
            _ => {}
        }

        if let Some(email) = entry.email.as_deref() {
            if !seen.insert(email.to_owned()) {
                warn!(tag, email, "Skipping duplicate client");
                continue;
            }
        }

        if entry.flow.as_deref() == Some(VISION_UDP443_FLOW) {
            entry.flow = Some(VISION_FLOW.to_string());
        }

        filtered.push(entry);
    }

    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn emails(entries: &[ClientEntry]) -> Vec<&str> {
        entries.iter().filter_map(|e| e.email.as_deref()).collect()
    }

    #[test]
    fn test_disabled_record_removes_client() {
        let clients = vec![
            json!({"id": "1", "email": "a@x"}),
            json!({"id": "2", "email": "b@x"}),
        ];
        let records = vec![ClientRecord::new("a@x", false)];

        let filtered = filter_clients("r1", &clients, &records, MissingRecordPolicy::Keep);

        assert_eq!(emails(&filtered), vec!["b@x"]);
    }

    #[test]
    fn test_missing_record_policy() {
        let clients = vec![json!({"id": "1", "email": "new@x"})];

        let kept = filter_clients("r1", &clients, &[], MissingRecordPolicy::Keep);
        let dropped = filter_clients("r1", &clients, &[], MissingRecordPolicy::Drop);

        assert_eq!(kept.len(), 1);
        assert!(dropped.is_empty());
    }

    #[test]
    fn test_client_enable_false_is_dropped() {
        let clients = vec![
            json!({"id": "1", "email": "a@x", "enable": false}),
            json!({"id": "2", "email": "b@x", "enable": true}),
            json!({"id": "3", "email": "c@x", "enable": "yes"}),
        ];
        let records = vec![ClientRecord::new("a@x", true)];

        let filtered = filter_clients("r1", &clients, &records, MissingRecordPolicy::Keep);

        assert_eq!(emails(&filtered), vec!["b@x", "c@x"]);
    }

    #[test]
    fn test_minimizes_to_allowed_fields() {
        let clients = vec![json!({
            "id": "uuid-1",
            "email": "a@x",
            "flow": "xtls-rprx-vision",
            "limitIp": 2,
            "totalGB": 100,
            "expiryTime": 0,
            "tgId": "",
            "subId": "abc",
            "enable": true
        })];

        let filtered = filter_clients("r1", &clients, &[], MissingRecordPolicy::Keep);

        assert_eq!(
            serde_json::to_value(&filtered).unwrap(),
            json!([{"id": "uuid-1", "email": "a@x", "flow": "xtls-rprx-vision"}])
        );
    }

    #[test]
    fn test_flow_alias_is_normalized() {
        let clients = vec![json!({"id": "1", "email": "a@x", "flow": "xtls-rprx-vision-udp443"})];

        let filtered = filter_clients("r1", &clients, &[], MissingRecordPolicy::Keep);

        assert_eq!(filtered[0].flow.as_deref(), Some("xtls-rprx-vision"));
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let clients = vec![
            json!("not-a-client"),
            json!({"id": 42, "email": "bad@x"}),
            json!({"password": "secret", "email": "ok@x", "method": "aes-128-gcm"}),
        ];

        let filtered = filter_clients("r1", &clients, &[], MissingRecordPolicy::Keep);

        assert_eq!(emails(&filtered), vec!["ok@x"]);
    }

    #[test]
    fn test_duplicate_identity_kept_once() {
        let clients = vec![
            json!({"id": "1", "email": "a@x"}),
            json!({"id": "2", "email": "a@x"}),
            json!({"id": "3"}),
            json!({"id": "4"}),
        ];

        let filtered = filter_clients("r1", &clients, &[], MissingRecordPolicy::Keep);

        let ids: Vec<_> = filtered.iter().filter_map(|e| e.id.as_deref()).collect();
        assert_eq!(ids, vec!["1", "3", "4"]);
    }

    #[test]
    fn test_any_disabled_record_wins() {
        let clients = vec![json!({"id": "1", "email": "a@x"})];
        let records = vec![ClientRecord::new("a@x", true), ClientRecord::new("a@x", false)];

        let filtered = filter_clients("r1", &clients, &records, MissingRecordPolicy::Keep);

        assert!(filtered.is_empty());
    }

    #[test]
    fn test_never_grows_and_never_keeps_disabled() {
        let records: Vec<ClientRecord> = (0..20)
            .map(|i| ClientRecord::new(format!("u{}@x", i), i % 3 != 0))
            .collect();

        for len in 0..20 {
            let clients: Vec<Value> = (0..len)
                .map(|i| json!({"id": i.to_string(), "email": format!("u{}@x", i % 25)}))
                .collect();

            for policy in [MissingRecordPolicy::Keep, MissingRecordPolicy::Drop] {
                let filtered = filter_clients("r", &clients, &records, policy);
                assert!(filtered.len() <= clients.len());
                for entry in &filtered {
                    let email = entry.email.as_deref().unwrap();
                    assert!(!records.iter().any(|r| r.email == email && !r.enabled));
                }
            }
        }
    }
}
