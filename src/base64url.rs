//! Base64URL Codec
//!
//! Unpadded base64url (RFC 4648 §5) used for every segment of a bearer assertion.

use crate::{ProxyError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Serialize;

/// Encode raw bytes as unpadded base64url text
pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Serialize a value to compact JSON and encode its UTF-8 bytes
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    Ok(encode(json))
}

/// Decode unpadded base64url text
pub fn decode(text: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|e| ProxyError::SerializationError(format!("Invalid base64url: {}", e)))
}
