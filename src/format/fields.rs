//! Usage: Typed accessors over `serde_json::Value` that report malformed fields per format.

use super::{TranslationError, WireFormat};
use serde_json::Value;

/// Field lookup that treats an explicit `null` as absent.
pub(crate) fn field<'a>(obj: &'a Value, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

pub(crate) fn opt_str<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    field(obj, key).and_then(Value::as_str)
}

pub(crate) fn req_str<'a>(
    format: WireFormat,
    obj: &'a Value,
    key: &str,
) -> Result<&'a str, TranslationError> {
    match field(obj, key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(TranslationError::malformed(
            format,
            format!("`{key}` must be a string"),
        )),
        None => Err(TranslationError::malformed(
            format,
            format!("`{key}` is required"),
        )),
    }
}

pub(crate) fn req_array<'a>(
    format: WireFormat,
    obj: &'a Value,
    key: &str,
) -> Result<&'a [Value], TranslationError> {
    match field(obj, key) {
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(TranslationError::malformed(
            format,
            format!("`{key}` must be an array"),
        )),
        None => Err(TranslationError::malformed(
            format,
            format!("`{key}` is required"),
        )),
    }
}

pub(crate) fn opt_array<'a>(
    format: WireFormat,
    obj: &'a Value,
    key: &str,
) -> Result<&'a [Value], TranslationError> {
    match field(obj, key) {
        None => Ok(&[]),
        Some(_) => req_array(format, obj, key),
    }
}

pub(crate) fn opt_u32(
    format: WireFormat,
    obj: &Value,
    key: &str,
) -> Result<Option<u32>, TranslationError> {
    match field(obj, key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| {
                TranslationError::malformed(
                    format,
                    format!("`{key}` must be a non-negative integer"),
                )
            }),
    }
}

pub(crate) fn opt_f64(
    format: WireFormat,
    obj: &Value,
    key: &str,
) -> Result<Option<f64>, TranslationError> {
    match field(obj, key) {
        None => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or_else(|| {
            TranslationError::malformed(format, format!("`{key}` must be a number"))
        }),
    }
}

pub(crate) fn opt_bool(
    format: WireFormat,
    obj: &Value,
    key: &str,
) -> Result<Option<bool>, TranslationError> {
    match field(obj, key) {
        None => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or_else(|| {
            TranslationError::malformed(format, format!("`{key}` must be a boolean"))
        }),
    }
}

pub(crate) fn u64_or_zero(obj: Option<&Value>, key: &str) -> u64 {
    obj.and_then(|o| o.get(key))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

pub(crate) fn opt_u64(obj: Option<&Value>, key: &str) -> Option<u64> {
    obj.and_then(|o| o.get(key)).and_then(Value::as_u64)
}
