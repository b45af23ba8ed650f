//! Canonical keys for pattern deduplication.

use serde_json::Value;

/// Derives the key under which reports of the same pattern merge.
pub trait PatternKeyer: Send + Sync {
    fn canonical_key(&self, payload: &Value) -> String;
}

/// Default keyer.
///
/// Prefers an explicit `name` or `template` field. Unnamed payloads are
/// hashed; serde_json renders object keys sorted, so two instances
/// reporting the same structure in different field order get the same key.
#[derive(Debug, Default, Clone, Copy)]
pub struct PayloadKeyer;

impl PayloadKeyer {
    pub fn new() -> Self {
        Self
    }
}

impl PatternKeyer for PayloadKeyer {
    fn canonical_key(&self, payload: &Value) -> String {
        for field in ["name", "template"] {
            if let Some(name) = payload.get(field).and_then(Value::as_str) {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
        blake3::hash(payload.to_string().as_bytes())
            .to_hex()
            .to_string()
    }
}
