use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::metadata::MetaValue;

/// Narrow one settings value to an archive attribute. Booleans become
/// 0/1, `null` has no attribute form, and nested values are kept as
/// their compact JSON text.
pub fn settings_value(value: &Value) -> Option<MetaValue> {
    match value {
        Value::Bool(b) => Some(MetaValue::Int(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(MetaValue::Int(i)),
            None => n.as_f64().map(MetaValue::Float),
        },
        Value::String(s) => Some(MetaValue::Text(s.clone())),
        Value::Null => None,
        Value::Array(_) | Value::Object(_) => Some(MetaValue::Text(value.to_string())),
    }
}

pub fn parse_settings(value: &Value) -> Result<BTreeMap<String, MetaValue>> {
    let object = value
        .as_object()
        .ok_or_else(|| anyhow!("settings log must be a JSON object"))?;
    let mut out = BTreeMap::new();
    for (key, raw) in object {
        match settings_value(raw) {
            Some(v) => {
                out.insert(key.clone(), v);
            }
            None => warn!(key = %key, "skipping null setting"),
        }
    }
    Ok(out)
}

pub fn read_settings_log(path: &Path) -> Result<BTreeMap<String, MetaValue>> {
    let bytes = fs::read(path).with_context(|| format!("read settings log {}", path.display()))?;
    let value: Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("decode settings log {}", path.display()))?;
    parse_settings(&value).with_context(|| format!("settings log {}", path.display()))
}
