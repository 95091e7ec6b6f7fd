// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON serialization and content hashing.
//!
//! Canonical form is compact JSON with lexicographically ordered object keys
//! at every nesting level. Content hashes are computed over the canonical
//! form so that re-parsing identical input always yields the same hash,
//! independent of field insertion order.

use sha2::{Digest, Sha256};

/// Serialize a JSON value to its canonical form.
#[must_use]
pub fn to_canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// sha256 of the canonical form of a JSON value, hex-encoded.
#[must_use]
pub fn content_hash(value: &serde_json::Value) -> String {
    sha256_hex(to_canonical_json(value).as_bytes())
}

/// sha256 of raw bytes, hex-encoded.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key serialization cannot fail: a String is always valid JSON.
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
