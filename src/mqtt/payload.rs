// SPDX-License-Identifier: GPL-3.0-or-later
use serde::Serialize;

/// Encode a value as an MQTT payload.
///
/// Strings are sent as-is rather than as quoted JSON, and `null` is an empty payload. Anything
/// else is encoded as JSON.
pub(super) fn to_payload<T>(value: &T) -> serde_json::Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(value)?;
    if let Some(text) = value.as_str() {
        return Ok(text.as_bytes().to_vec());
    }
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::to_vec(&value)
}
