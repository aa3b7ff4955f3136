//! `{{ VAR }}` interpolation against environment variables

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::KvError;

/// Only this field may resolve to an empty variable
const EMPTY_ALLOWED_FIELD: &str = "password";

/// A whole value wrapped in `{{` and `}}`; the name inside is trimmed
static TEMPLATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\{\{(.*)\}\}$").expect("template pattern is valid"));

/// Variable name if `value` is a delimited template.
///
/// Any name is returned, including an empty one, so a malformed placeholder
/// fails the lookup instead of passing through as a literal.
pub fn template_var(value: &str) -> Option<&str> {
    TEMPLATE
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
}

pub fn is_template(value: &str) -> bool {
    template_var(value).is_some()
}

/// Source of variable values used during interpolation
pub trait EnvSource {
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Reads the process environment
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Recursively replace template strings in `value`.
///
/// Returns a new value; the input is left untouched. Errors carry the path of
/// the offending field.
pub fn interpolate(value: &Value, env: &dyn EnvSource) -> Result<Value, KvError> {
    interpolate_field(value, env, false)
}

fn interpolate_field(value: &Value, env: &dyn EnvSource, allow_empty: bool) -> Result<Value, KvError> {
    match value {
        Value::Object(obj) => {
            let mut out = serde_json::Map::with_capacity(obj.len());
            for (key, child) in obj {
                let resolved = interpolate_field(child, env, key == EMPTY_ALLOWED_FIELD)
                    .map_err(|e| e.within(key))?;
                out.insert(key.clone(), resolved);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                interpolate_field(item, env, false).map_err(|e| e.within(&i.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::String(s) => match template_var(s) {
            Some(var) => match env.lookup(var) {
                None => Err(KvError::MissingEnvVar {
                    path: String::new(),
                    var: var.to_string(),
                }),
                Some(resolved) if resolved.is_empty() && !allow_empty => Err(KvError::EmptyEnvVar {
                    path: String::new(),
                    var: var.to_string(),
                }),
                Some(resolved) => Ok(Value::String(resolved)),
            },
            None => Ok(value.clone()),
        },
        other => Ok(other.clone()),
    }
}
