//! Input fingerprinting.
//!
//! A fingerprint is the hex SHA-256 of the canonical JSON form of a semantic
//! input. Object keys are sorted recursively before hashing, so two inputs that
//! differ only in property insertion order produce the same fingerprint.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputFingerprint(String);

impl InputFingerprint {
    /// Wrap an already-computed digest (e.g. one read back from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InputFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for InputFingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fingerprint `input` with the default (unsalted) fingerprinter.
pub fn fingerprint<T: Serialize + ?Sized>(input: &T) -> Result<InputFingerprint> {
    Fingerprinter::new().fingerprint(input)
}

/// Produces [`InputFingerprint`]s.
///
/// A salt (for example a prompt-template revision) changes every fingerprint
/// without touching the inputs themselves.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    salt: Option<String>,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self { salt: None }
    }

    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn fingerprint<T: Serialize + ?Sized>(&self, input: &T) -> Result<InputFingerprint> {
        let value = serde_json::to_value(input).map_err(|e| Error::Fingerprint {
            message: e.to_string(),
        })?;
        let canonical = canonical_json(&value);

        let mut hasher = Sha256::new();
        if let Some(ref s) = self.salt {
            hasher.update(s.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(canonical.as_bytes());
        let hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Ok(InputFingerprint(hash))
    }
}

/// Serialize `value` with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for k in keys {
                sorted.insert(k.clone(), sort_keys(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = json!({"studentId": "S1", "chapter": 3, "meta": {"x": 1, "y": [1, 2]}});
        let mut b = Map::new();
        b.insert("meta".into(), json!({"y": [1, 2], "x": 1}));
        b.insert("chapter".into(), json!(3));
        b.insert("studentId".into(), json!("S1"));
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&Value::Object(b)).unwrap());
    }

    #[test]
    fn test_any_value_change_changes_fingerprint() {
        let base = fingerprint(&json!({"studentId": "S1"})).unwrap();
        assert_ne!(base, fingerprint(&json!({"studentId": "S2"})).unwrap());
        assert_ne!(base, fingerprint(&json!({"studentId": "S1", "x": null})).unwrap());
        // Array order is semantic.
        assert_ne!(
            fingerprint(&json!([1, 2])).unwrap(),
            fingerprint(&json!([2, 1])).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let fp = fingerprint(&json!({"a": 1})).unwrap();
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_salt_changes_fingerprint() {
        let input = json!({"subject": "math"});
        let plain = Fingerprinter::new().fingerprint(&input).unwrap();
        let salted = Fingerprinter::new().with_salt("v2").fingerprint(&input).unwrap();
        assert_ne!(plain, salted);
    }

    #[test]
    fn test_typed_input_matches_json_input() {
        #[derive(Serialize)]
        struct Req {
            student_id: &'static str,
            chapter: u32,
        }
        let typed = fingerprint(&Req { student_id: "S1", chapter: 2 }).unwrap();
        let raw = fingerprint(&json!({"chapter": 2, "student_id": "S1"})).unwrap();
        assert_eq!(typed, raw);
    }

    #[test]
    fn test_non_serializable_input_is_fingerprint_error() {
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);
        match fingerprint(&bad) {
            Err(Error::Fingerprint { .. }) => {}
            other => panic!("expected fingerprint error, got {:?}", other),
        }
    }
}
