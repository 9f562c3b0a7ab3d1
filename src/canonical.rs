//! Canonical JSON preimages for hashing and signing.
//!
//! Every hash on the chain is computed over a canonical rendering of an
//! object: lexicographically ordered keys, no whitespace, UTF-8, no trailing
//! newline. `serde_json`'s default map is a BTreeMap, so serializing a
//! `Map<String, Value>` already yields exactly this form; the helpers here
//! exist so the preimages are built in one place and nowhere else.

use serde_json::{Map, Value};

/// Renders a set of fields as canonical JSON. Keys are sorted by the map
/// itself; the compact serializer emits no whitespace.
pub fn render(fields: Vec<(&str, Value)>) -> String {
    let mut map = Map::new();

    for (key, value) in fields {
        map.insert(key.to_owned(), value);
    }

    serde_json::to_string(&Value::Object(map)).expect("canonical rendering cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_compact() {
        let text = render(vec![
            ("versionNo", json!(1)),
            ("sender", json!("ab")),
            ("outCounter", json!(2)),
        ]);

        assert_eq!(text, r#"{"outCounter":2,"sender":"ab","versionNo":1}"#);
    }

    #[test]
    fn rendering_is_deterministic() {
        let a = render(vec![("b", json!("x")), ("a", json!("y"))]);
        let b = render(vec![("a", json!("y")), ("b", json!("x"))]);

        assert_eq!(a, b);
    }
}
