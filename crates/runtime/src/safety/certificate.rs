//! Deterministic verdict certificates
//!
//! A certificate is SHA-256 over the canonical JSON of the evaluated
//! checks. Canonical means object keys sorted ascending and numbers
//! rendered by serde_json's locale-independent formatter, so the same
//! inputs always produce the same hash.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{Certificate, CertificateStatus};

/// Hex digits of the hash carried into the certificate id.
const ID_HASH_LEN: usize = 12;

/// Render a JSON value canonically: keys sorted ascending at every level.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).expect("string serializes"));
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => {
                out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
            }
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the certificate for a set of evaluated checks.
pub fn build_certificate(
    mode: &str,
    checks: &Value,
    status: CertificateStatus,
    integrity_ok: bool,
) -> Certificate {
    let payload = serde_json::json!({
        "mode": mode,
        "checks": checks,
    });
    let hash = sha256_hex(&canonical_json(&payload));
    let certificate_id = format!("{}:{}", mode, &hash[..ID_HASH_LEN]);
    Certificate {
        status,
        certificate_hash: hash,
        certificate_id,
        integrity_ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "m": [3, 1]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":[3,1],"z":true},"b":1}"#);
    }

    #[test]
    fn key_order_does_not_change_the_hash() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn certificate_is_deterministic_and_input_sensitive() {
        let checks = json!([{"id": "C1", "value": 0.5, "limit": 0.8, "ok": true}]);
        let first = build_certificate("robotics-safety", &checks, CertificateStatus::Green, true);
        let second = build_certificate("robotics-safety", &checks, CertificateStatus::Green, true);
        assert_eq!(first.certificate_hash, second.certificate_hash);
        assert_eq!(first.certificate_id, second.certificate_id);
        assert!(first.certificate_id.starts_with("robotics-safety:"));
        assert_eq!(first.certificate_id.len(), "robotics-safety:".len() + 12);

        let changed = json!([{"id": "C1", "value": 0.6, "limit": 0.8, "ok": true}]);
        let third = build_certificate("robotics-safety", &changed, CertificateStatus::Green, true);
        assert_ne!(first.certificate_hash, third.certificate_hash);
    }
}
