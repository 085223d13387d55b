use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;
use uuid::Uuid;

/// Prefix of every long device identifier.
pub const DEVICE_PREFIX: &str = "urn:infai:ses:device:";

/// Length of a short identifier: 16 bytes as unpadded base64.
pub const SHORT_ID_LEN: usize = 22;

#[derive(Debug, Error)]
pub enum ShortIdError {
    #[error("malformed identifier {0:?}: {1}")]
    MalformedIdentifier(String, String),
}

/// Compresses `<prefix>:<uuid>` into its 22 character URL-safe token.
pub fn shorten(long_id: &str) -> Result<String, ShortIdError> {
    if long_id.is_empty() {
        return Ok(String::new());
    }
    let raw = long_id.rsplit(':').next().unwrap_or(long_id);
    let uuid = Uuid::try_parse(raw)
        .map_err(|e| ShortIdError::MalformedIdentifier(long_id.to_string(), e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(uuid.as_bytes()))
}

/// Expands a short token back into `<prefix><uuid>`.
///
/// Input that already carries `prefix` is returned unchanged.
pub fn lengthen(short_id: &str, prefix: &str) -> Result<String, ShortIdError> {
    if short_id.is_empty() {
        return Ok(String::new());
    }
    if short_id.contains(prefix) {
        return Ok(short_id.to_string());
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(short_id)
        .map_err(|e| ShortIdError::MalformedIdentifier(short_id.to_string(), e.to_string()))?;
    if bytes.len() < 16 {
        return Err(ShortIdError::MalformedIdentifier(
            short_id.to_string(),
            format!("expected at least 16 bytes, got {}", bytes.len()),
        ));
    }
    let uuid = Uuid::from_slice(&bytes[..16])
        .map_err(|e| ShortIdError::MalformedIdentifier(short_id.to_string(), e.to_string()))?;
    Ok(format!("{}{}", prefix, uuid.hyphenated()))
}

/// Shorthand for [`lengthen`] with the device prefix.
pub fn ensure_long_device_id(short_id: &str) -> Result<String, ShortIdError> {
    lengthen(short_id, DEVICE_PREFIX)
}
