use anyhow::Result;
use blake3;
use serde::Serialize;

/// Hex encoded blake3 digest of the JSON encoding of `value`. The bytes do
/// not depend on the compiler or target.
pub fn digest<T: Serialize>(value: &T) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    serde_json::to_writer(&mut hasher, value)?;
    Ok(hasher.finalize().to_hex().to_string())
}
