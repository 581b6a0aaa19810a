use std::collections::BTreeMap;

/// Replaces `${name}` markers with values from `context`.
///
/// Unknown names and unterminated markers are left as-is. Substituted values
/// are never re-scanned.
pub fn substitute(template: &str, context: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let name = &after[..end];
        match context.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Applies [`substitute`] to every string inside a JSON value tree.
pub fn substitute_all(value: &mut serde_json::Value, context: &BTreeMap<String, String>) {
    match value {
        serde_json::Value::String(s) => {
            if s.contains("${") {
                *s = substitute(s, context);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                substitute_all(v, context);
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values_mut() {
                substitute_all(v, context);
            }
        }
        _ => {}
    }
}
