//! `{field}` placeholder substitution.
//!
//! Rendering never fails: a placeholder with no value renders as an empty
//! string so the rest of the message still goes out.

use serde_json::{Map, Value};

/// Render `template` against `fields`.
pub fn render(template: &str, fields: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(['{', '}']) {
            Some(close) if after.as_bytes()[close] == b'}' && is_field_name(&after[..close]) => {
                let name = &after[..close];
                match fields.get(name) {
                    Some(value) => out.push_str(&value_text(value)),
                    None => tracing::debug!("Template field '{name}' missing; rendering empty"),
                }
                rest = &after[close + 1..];
            }
            _ => {
                // Not a placeholder: keep the brace literally.
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_field_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
