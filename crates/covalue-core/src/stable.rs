//! Stable JSON encoding.
//!
//! Hashes and ids are computed over JSON with object keys in sorted order,
//! so the same value always produces the same bytes on every peer.
//! `serde_json::Value` keeps objects in a `BTreeMap`, which gives us the
//! ordering for free once a value has gone through it.

use serde::Serialize;

use crate::error::Result;

/// Serialize `value` as compact JSON with sorted object keys.
pub fn stable_stringify<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&value)?)
}

/// Bytes fed into hashes for `value`.
pub fn stable_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    stable_stringify(value).map(String::into_bytes)
}
