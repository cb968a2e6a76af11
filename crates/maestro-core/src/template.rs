//! `{{dotted.path}}` variable substitution.
//!
//! Shared by the API and LLM executors and by the scheduler when it resolves
//! step inputs. Unresolved references are left verbatim.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:(?:\.[A-Za-z0-9_\-]+)|(?:\[\d+\]))*)\s*\}\}")
            .expect("valid template regex")
    })
}

/// Look up a dotted path (`a.b[0].c`, `a.b.0.c`) inside a JSON value.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        // Check for array index: key[0][1]
        let (key, indices) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = match current {
                Value::Object(map) => map.get(key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        for idx in indices.split('[').filter(|s| !s.is_empty()) {
            let idx: usize = idx.trim_end_matches(']').parse().ok()?;
            current = current.as_array()?.get(idx)?;
        }
    }
    Some(current)
}

/// Render a value for insertion into a string template.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{{path}}` in `template` with the value found in `vars`.
pub fn substitute(template: &str, vars: &Value) -> String {
    template_regex()
        .replace_all(template, |caps: &regex::Captures| match lookup_path(vars, &caps[1]) {
            Some(value) => render(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Resolve templates inside an arbitrary JSON value.
///
/// A string consisting of exactly one reference resolves to the referenced
/// value itself (keeping its JSON type); other strings are substituted.
pub fn resolve_value(value: &Value, vars: &Value) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = template_regex().captures(s.trim()) {
                if caps[0].len() == s.trim().len() {
                    if let Some(found) = lookup_path(vars, &caps[1]) {
                        return found.clone();
                    }
                    return value.clone();
                }
            }
            Value::String(substitute(s, vars))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitute_nested_path() {
        let vars = json!({ "user": { "name": "Ada", "langs": ["rust", "ml"] } });
        assert_eq!(
            substitute("Hi {{user.name}}, you like {{ user.langs[0] }}", &vars),
            "Hi Ada, you like rust"
        );
    }

    #[test]
    fn test_unresolved_left_verbatim() {
        let vars = json!({ "a": 1 });
        assert_eq!(substitute("{{a}} and {{missing.key}}", &vars), "1 and {{missing.key}}");
    }

    #[test]
    fn test_non_string_values_are_json_encoded() {
        let vars = json!({ "obj": { "x": 1 }, "flag": true });
        assert_eq!(substitute("{{obj}} {{flag}}", &vars), r#"{"x":1} true"#);
    }

    #[test]
    fn test_lookup_numeric_segment() {
        let vars = json!({ "items": [{ "id": 7 }] });
        assert_eq!(lookup_path(&vars, "items.0.id"), Some(&json!(7)));
        assert_eq!(lookup_path(&vars, "items[0].id"), Some(&json!(7)));
        assert_eq!(lookup_path(&vars, "items[3].id"), None);
    }

    #[test]
    fn test_resolve_value_keeps_types() {
        let vars = json!({ "steps": { "fetch": { "rows": [1, 2, 3] } }, "n": "x" });
        let resolved = resolve_value(
            &json!({ "rows": "{{steps.fetch.rows}}", "label": "n={{n}}", "missing": "{{nope}}" }),
            &vars,
        );
        assert_eq!(resolved["rows"], json!([1, 2, 3]));
        assert_eq!(resolved["label"], json!("n=x"));
        assert_eq!(resolved["missing"], json!("{{nope}}"));
    }
}
