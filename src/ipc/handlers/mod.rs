pub mod actions;
pub mod daemon;
pub mod tasks;

use serde_json::Value;

/// Extract an owned string param.
pub(crate) fn s(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// Extract a borrowed string param.
pub(crate) fn sv<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|v| v.as_str())
}

/// Extract an integer param.
pub(crate) fn n(v: &Value, key: &str) -> Option<i64> {
    v.get(key).and_then(|v| v.as_i64())
}
