use serde_json::{Map, Value};

/// Re-encodes `value` with object keys in lexicographic order, recursively.
///
/// `serde_json::Map` is BTreeMap-backed by default (we don't enable the
/// `preserve_order` feature), so it is already key-sorted; this function
/// exists to make that guarantee explicit and independent of feature flags,
/// since the multipart upload path's correctness (spec §4.6) depends on it:
/// MIME part order must match the canonical key order of `_attachments`.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut ordered = Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                ordered.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(ordered)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(&canonicalize(value)).expect("canonical JSON never fails to serialize")
}

/// Returns the `_attachments` keys in the order they appear in the canonical
/// encoding of `properties`, so multipart streaming can pair each MIME part
/// to its JSON entry positionally (spec §4.6).
pub fn attachment_key_order(properties: &Value) -> Vec<String> {
    canonicalize(properties)
        .get("_attachments")
        .and_then(Value::as_object)
        .map(|attachments| attachments.keys().cloned().collect())
        .unwrap_or_default()
}
