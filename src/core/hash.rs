//! Order-independent content hashing of request parameters.

use super::types::ParamsHash;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Computes the idempotency token for a parameter object.
///
/// Object keys are sorted recursively before hashing so two requests that only
/// differ in key order hash equally. Array order is significant.
pub fn params_hash(parameters: &Map<String, Value>) -> ParamsHash {
    let mut hasher = Sha256::new();
    write_canonical(&mut hasher, &Value::Object(parameters.clone()));
    ParamsHash::new(hex::encode(hasher.finalize()))
}

fn write_canonical(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                // Keys go through the JSON encoder so quoting stays unambiguous.
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                write_canonical(hasher, &map[key]);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}
