//! `{{ name }}` template interpolation.
//!
//! String variables are inserted as-is; any other JSON value is inserted as
//! its JSON text.  Missing names become the empty string.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::workflow::Variables;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}")
        .expect("placeholder pattern is a valid regex")
});

/// Substitute every `{{ name }}` in `template`.
pub fn interpolate(template: &str, variables: &Variables) -> String {
    if !template.contains("{{") {
        return template.to_owned();
    }
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            lookup(variables, &caps[1]).map(render).unwrap_or_default()
        })
        .into_owned()
}

/// Interpolate every string inside `value`, recursing through arrays and
/// objects.  Keys are left alone.
pub fn interpolate_value(value: &Value, variables: &Variables) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate(s, variables)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, variables))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Names referenced by `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_owned())
        .collect()
}

/// Resolve `name`, falling back to a dotted path (`review.score`) when no
/// variable has the literal name.
fn lookup<'a>(variables: &'a Variables, name: &str) -> Option<&'a Value> {
    if let Some(value) = variables.get(name) {
        return Some(value);
    }
    let mut parts = name.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
