//! The deep-merge primitive used at every layering step of the config resolver.
//!
//! Objects merge key-by-key, recursively; anything else (arrays, scalars, a type change between
//! base and overlay) is a wholesale replacement. This is deliberately simpler than a layered
//! `config`-crate setup that merges typed sources; since the resolved document here is plain
//! `serde_json::Value`, a direct recursive merge over `Value` says the same thing with far less
//! machinery, and keeps the whole pipeline hashable by C10 without round-tripping through a typed
//! intermediate.

use serde_json::Value;

/// Merges `overlay` onto `base` in place.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Reads a dot-delimited path out of a JSON value, creating no intermediate structure.
pub fn get_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Writes a string value at a dot-delimited path inside `value`, creating intermediate objects as
/// needed.
pub fn set_at_path(value: &mut Value, path: &str, new_value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = value;
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().unwrap();
        if i == segments.len() - 1 {
            map.insert(segment.to_string(), new_value.clone());
            return;
        }
        current = map.entry(segment.to_string()).or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_merge_recursively() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": 1});
        let overlay = json!({"a": {"y": 3, "z": 4}, "c": 5});
        deep_merge(&mut base, &overlay);
        assert_eq!(base, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": 1, "c": 5}));
    }

    #[test]
    fn arrays_replace_wholesale() {
        let mut base = json!({"list": [1, 2, 3]});
        let overlay = json!({"list": [9]});
        deep_merge(&mut base, &overlay);
        assert_eq!(base, json!({"list": [9]}));
    }

    #[test]
    fn set_at_path_creates_intermediate_objects() {
        let mut value = json!({});
        set_at_path(&mut value, "modules.foo.config.enabled", json!("true"));
        assert_eq!(
            get_at_path(&value, "modules.foo.config.enabled"),
            Some(&json!("true"))
        );
    }
}
