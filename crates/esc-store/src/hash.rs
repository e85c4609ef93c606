use sha2::{Digest, Sha256};

/// Serialize `value` to canonical JSON (object keys sorted) and return its
/// SHA-256 hex digest. The Engine's write-through path (spec §4.2: "if
/// `force` is false and the cached value equals the proposed value, skip
/// the round-trip") compares these hashes rather than the raw values so
/// HashMap/Vec field reordering never causes a spurious write.
pub fn compute_desired_hash<T: serde::Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    let canonical = sort_json_keys(v);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{:x}", digest)
}

fn sort_json_keys(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_json_keys(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(sort_json_keys).collect())
        }
        other => other,
    }
}

/// Every field of `delta` that carries a value, alongside its own encoded
/// value and content hash. Used by [`crate::store::StateStore`]
/// implementations to decide, per field, whether a write is a no-op (spec
/// §4.2: "if `force` is false and the cached value equals the proposed
/// value, skip the round-trip").
pub fn delta_present_fields<T: serde::Serialize>(delta: &T) -> Vec<(String, serde_json::Value, String)> {
    let value = serde_json::to_value(delta).unwrap_or(serde_json::Value::Null);
    let mut out = Vec::new();
    if let serde_json::Value::Object(map) = value {
        for (k, v) in map {
            if !v.is_null() {
                let hash = compute_desired_hash(&v);
                out.push((k, v, hash));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn hash_is_stable_across_map_insertion_order() {
        let mut a = HashMap::new();
        a.insert("b", 2);
        a.insert("a", 1);

        let mut b = HashMap::new();
        b.insert("a", 1);
        b.insert("b", 2);

        assert_eq!(compute_desired_hash(&a), compute_desired_hash(&b));
    }

    #[test]
    fn hash_changes_with_content() {
        assert_ne!(compute_desired_hash(&1), compute_desired_hash(&2));
    }

    #[test]
    fn delta_present_fields_skips_nulls() {
        #[derive(serde::Serialize)]
        struct D {
            a: Option<i32>,
            b: Option<i32>,
        }
        let present = delta_present_fields(&D { a: Some(1), b: None });
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].0, "a");
    }
}
