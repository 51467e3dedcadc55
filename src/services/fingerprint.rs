//! Stable identity of a (source object, transform) pair.

use crate::{errors::MediaResult, models::transform::TransformSpec};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Canonical JSON of a spec: inert fields dropped, object keys sorted at every
/// level, no whitespace.
pub fn canonical_json(spec: &TransformSpec) -> MediaResult<String> {
    let value = serde_json::to_value(spec.canonical())?;
    Ok(sort_keys(value).to_string())
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// SHA-256 over the source id and canonical spec, lowercase hex.
pub fn fingerprint(source_id: Uuid, spec: &TransformSpec) -> MediaResult<String> {
    let canonical = canonical_json(spec)?;
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FIELDS: [(&str, &str); 9] = [
        ("resize", r#"{"width": 120, "height": 80}"#),
        ("rotate", "45"),
        ("crop", r#"{"x": 1, "y": 2, "width": 30, "height": 40}"#),
        ("format", r#""webp""#),
        ("filters", r#"{"grayscale": true, "sepia": true}"#),
        ("flip", "true"),
        ("mirror", "true"),
        ("compress", "60"),
        (
            "watermark",
            r#"{"url": "https://a.test/w.png", "position": "south", "opacity": 0.4}"#,
        ),
    ];

    fn spec_from_order(order: &[usize]) -> TransformSpec {
        let body = order
            .iter()
            .map(|&i| format!("\"{}\": {}", FIELDS[i].0, FIELDS[i].1))
            .collect::<Vec<_>>()
            .join(", ");
        serde_json::from_str(&format!("{{{body}}}")).unwrap()
    }

    #[test]
    fn canonical_json_is_sorted() {
        let spec: TransformSpec =
            serde_json::from_str(r#"{"rotate": 90, "resize": {"height": 2, "width": 1}}"#).unwrap();
        assert_eq!(
            canonical_json(&spec).unwrap(),
            r#"{"resize":{"height":2,"width":1},"rotate":90.0}"#
        );
    }

    #[test]
    fn source_id_participates() {
        let spec = spec_from_order(&[0, 1]);
        let a = fingerprint(Uuid::new_v4(), &spec).unwrap();
        let b = fingerprint(Uuid::new_v4(), &spec).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn different_values_differ() {
        let source = Uuid::new_v4();
        let a: TransformSpec = serde_json::from_str(r#"{"rotate": 90}"#).unwrap();
        let b: TransformSpec = serde_json::from_str(r#"{"rotate": 180}"#).unwrap();
        assert_ne!(
            fingerprint(source, &a).unwrap(),
            fingerprint(source, &b).unwrap()
        );
    }

    #[test]
    fn inert_fields_do_not_change_fingerprint() {
        let source = Uuid::new_v4();
        let a: TransformSpec = serde_json::from_str(r#"{"rotate": 90}"#).unwrap();
        let b: TransformSpec =
            serde_json::from_str(r#"{"rotate": 450, "flip": false, "filters": {}}"#).unwrap();
        assert_eq!(
            fingerprint(source, &a).unwrap(),
            fingerprint(source, &b).unwrap()
        );
    }

    proptest! {
        #[test]
        fn field_order_never_changes_fingerprint(
            order in Just((0..FIELDS.len()).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let source = Uuid::nil();
            let reference = fingerprint(source, &spec_from_order(&(0..FIELDS.len()).collect::<Vec<_>>())).unwrap();
            prop_assert_eq!(fingerprint(source, &spec_from_order(&order)).unwrap(), reference);
        }
    }
}
