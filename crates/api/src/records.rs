//! Conversions between canonical types and store records.
//!
//! Timestamps go through `kcal_core::time` in both directions, so a record read back
//! always yields the same UTC instant that was written.

use anyhow::{anyhow, Context, Result};
use kcal_core::ScalingTarget;
use kcal_persist::Doc;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

pub fn to_doc<T: Serialize>(v: &T) -> Result<Doc> {
    match serde_json::to_value(v).context("encoding record")? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("record must encode as an object, got {}", other)),
    }
}

pub fn from_doc<T: DeserializeOwned>(doc: Doc) -> Result<T> {
    let id = doc.get("id").and_then(Value::as_str).unwrap_or("?").to_string();
    serde_json::from_value(Value::Object(doc)).with_context(|| format!("decoding record {}", id))
}

/// Cached record -> canonical `ScalingTarget`. Counterpart of
/// `kcal_kubehub::scaling_target_from_object`; both apply the same bound normalization.
pub fn scaling_target_from_doc(doc: Doc) -> Result<ScalingTarget> {
    let mut st: ScalingTarget = from_doc(doc)?;
    st.normalize();
    Ok(st)
}
