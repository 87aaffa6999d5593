//! Normalisation of instance configuration maps.
//!
//! The hypervisor returns device settings as flat strings such as
//! `virtio=BC:24:11:2A:7F:01,bridge=vmbr0,tag=10,firewall=1`. These are
//! decomposed into JSON objects so callers can read individual fields.

use serde_json::{Map, Value};

/// Free-text keys that are never decomposed.
pub const EXEMPT_KEYS: &[&str] = &["description", "tags", "sshkeys"];

const TAGS_KEY: &str = "tags";
const NIC_KEY_PREFIX: &str = "net";

/// Parse every entry of a raw configuration map.
///
/// Already-structured values pass through untouched, so parsing the output
/// again yields the same map.
pub fn parse_instance_config(raw: &Map<String, Value>) -> Map<String, Value> {
    raw.iter()
        .map(|(key, value)| (key.clone(), parse_value(key, value)))
        .collect()
}

/// Parse a single configuration value under `key`.
pub fn parse_value(key: &str, value: &Value) -> Value {
    let text = match value {
        Value::String(text) => text,
        other => return other.clone(),
    };

    if key == TAGS_KEY {
        return Value::Array(
            text.split([',', ';'])
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| Value::String(t.to_string()))
                .collect(),
        );
    }

    if EXEMPT_KEYS.contains(&key) {
        return value.clone();
    }

    if text.contains(',') || text.matches('=').count() == 1 {
        return Value::Object(parse_pairs(key, text));
    }

    value.clone()
}

/// Split `a=b,c=d,store:volume` into a map.
fn parse_pairs(key: &str, text: &str) -> Map<String, Value> {
    let is_nic = key.starts_with(NIC_KEY_PREFIX);
    let mut map = Map::new();

    for segment in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Some((sub_key, sub_value)) = segment.split_once('=') {
            if is_nic && is_mac_address(sub_value) {
                // `virtio=<mac>` names the model, `hwaddr=<mac>` on containers
                // is overridden by an explicit `type=` segment.
                map.entry("type")
                    .or_insert_with(|| Value::String(sub_key.to_string()));
                map.insert("mac".to_string(), Value::String(sub_value.to_string()));
            } else {
                map.insert(sub_key.to_string(), Value::String(sub_value.to_string()));
            }
        } else if let Some((sub_key, sub_value)) = segment.split_once(':') {
            map.insert(sub_key.to_string(), Value::String(sub_value.to_string()));
        }
    }

    map
}

/// `XX:XX:XX:XX:XX:XX` or `XX-XX-XX-XX-XX-XX`, hex digits of either case.
pub fn is_mac_address(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 17
        && bytes.iter().enumerate().all(|(i, b)| {
            if i % 3 == 2 {
                *b == b':' || *b == b'-'
            } else {
                b.is_ascii_hexdigit()
            }
        })
}

/// Read a string field from a parsed value.
pub(crate) fn field<'a>(parsed: &'a Value, name: &str) -> Option<&'a str> {
    parsed.get(name).and_then(Value::as_str)
}
