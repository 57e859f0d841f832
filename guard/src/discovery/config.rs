//! Port extraction from proxy configuration documents.
//!
//! Proxy configs (xray, sing-box) nest their listeners arbitrarily deep in
//! objects and arrays. Any key literally named `port` or `listen_port` whose
//! value is an integer in 1-65535 contributes that integer.

use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{GuardError, GuardResult};

const PORT_KEYS: [&str; 2] = ["port", "listen_port"];

/// Visitor over a parsed document
pub trait DocumentVisitor {
    /// Called for every `(key, value)` pair of every object, depth first.
    /// Returns false to skip descending into `value`.
    fn visit_entry(&mut self, key: &str, value: &Value) -> bool;
}

/// Walks `value`, calling the visitor for every object entry at any depth.
pub fn walk(value: &Value, visitor: &mut dyn DocumentVisitor) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if visitor.visit_entry(key, child) {
                    walk(child, visitor);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, visitor);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
}

/// Collects integer values stored under the port keys
#[derive(Debug, Default)]
pub struct PortCollector {
    pub ports: BTreeSet<u16>,
}

impl DocumentVisitor for PortCollector {
    fn visit_entry(&mut self, key: &str, value: &Value) -> bool {
        if PORT_KEYS.contains(&key) {
            if let Some(port) = value
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .filter(|&n| n != 0)
            {
                self.ports.insert(port);
                return false;
            }
        }
        true
    }
}

/// Port numbers found anywhere in `document`.
pub fn ports_in_document(document: &Value) -> BTreeSet<u16> {
    let mut collector = PortCollector::default();
    walk(document, &mut collector);
    collector.ports
}

/// Reads and parses a JSON config file.
pub fn load_document(path: &Path) -> GuardResult<Value> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| GuardError::ConfigParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Port numbers declared in the config file at `path`.
///
/// A missing or malformed file yields an empty set and a warning.
pub fn config_ports(path: &Path) -> BTreeSet<u16> {
    match load_document(path) {
        Ok(document) => {
            let ports = ports_in_document(&document);
            debug!("Config {} declares ports {:?}", path.display(), ports);
            ports
        }
        Err(e) => {
            warn!("Skipping config {}: {e}", path.display());
            BTreeSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_inbounds_example() {
        let doc = json!({"inbounds": [{"listen_port": 443}, {"port": 8080}]});
        assert_eq!(ports_in_document(&doc), BTreeSet::from([443, 8080]));
    }

    #[test]
    fn test_deep_nesting_and_sequences() {
        let doc = json!({
            "log": {"level": "warn"},
            "inbounds": [
                {"type": "vless", "settings": {"fallbacks": [{"dest": 80, "port": 8443}]}},
                [[{"listen_port": 10443}]]
            ],
            "outbounds": [{"server_port": 443}]
        });
        assert_eq!(ports_in_document(&doc), BTreeSet::from([8443, 10443]));
    }

    #[test]
    fn test_non_integer_values_ignored() {
        let doc = json!({
            "a": {"port": "443"},
            "b": {"port": 443.5},
            "c": {"port": true},
            "d": {"port": -1},
            "e": {"port": 70000},
            "f": {"port": 0},
            "g": {"port": null}
        });
        assert!(ports_in_document(&doc).is_empty());
    }

    #[test]
    fn test_port_key_with_object_value_is_descended() {
        let doc = json!({"port": {"listen_port": 9000}});
        assert_eq!(ports_in_document(&doc), BTreeSet::from([9000]));
    }

    #[test]
    fn test_top_level_array() {
        let doc = json!([{"port": 1}, {"port": 65535}]);
        assert_eq!(ports_in_document(&doc), BTreeSet::from([1, 65535]));
    }

    #[test]
    fn test_config_ports_missing_file() {
        assert!(config_ports(Path::new("/nonexistent/portguard/config.json")).is_empty());
    }

    #[test]
    fn test_config_ports_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"inbounds\": [ {\"port\": 443 ").unwrap();
        assert!(config_ports(file.path()).is_empty());

        let err = load_document(file.path()).unwrap_err();
        assert!(matches!(err, GuardError::ConfigParse { .. }));
    }

    #[test]
    fn test_config_ports_is_idempotent() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"inbounds":[{"listen_port":443},{"port":8080}]}"#)
            .unwrap();
        let first = config_ports(file.path());
        let second = config_ports(file.path());
        assert_eq!(first, BTreeSet::from([443, 8080]));
        assert_eq!(first, second);
    }
}
