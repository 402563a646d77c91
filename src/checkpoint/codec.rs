//! Text codec for checkpoint files.
//!
//! Layout:
//! ```text
//! MHCHAIN-CHECKPOINT <version>
//! <pretty-printed JSON body>
//! crc32 <8 hex digits over the body bytes>
//! ```

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::PersistenceError;

/// Current codec version.
pub const CODEC_VERSION: u32 = 1;

/// First token of every checkpoint file.
pub const MAGIC: &str = "MHCHAIN-CHECKPOINT";

const CRC_PREFIX: &str = "crc32 ";

fn crc_of(body: &str) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(body.as_bytes());
    hasher.finalize()
}

/// Serializes `value` into a framed text document.
pub fn encode<T: Serialize>(value: &T) -> Result<String, PersistenceError> {
    let body = serde_json::to_string_pretty(value).map_err(|e| PersistenceError::Encode {
        message: format!("serialization failed: {e}"),
    })?;
    let crc = crc_of(&body);
    Ok(format!("{MAGIC} {CODEC_VERSION}\n{body}\n{CRC_PREFIX}{crc:08x}\n"))
}

/// Parses a framed document, verifying magic, version and checksum.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, PersistenceError> {
    let (header, rest) = text.split_once('\n').ok_or_else(|| corrupt("missing header line"))?;
    let version = header
        .strip_prefix(MAGIC)
        .map(str::trim)
        .ok_or_else(|| corrupt(format!("invalid magic: '{header}'")))?;
    if version != CODEC_VERSION.to_string() {
        return Err(corrupt(format!(
            "unsupported codec version: {version} (expected {CODEC_VERSION})"
        )));
    }

    let rest = rest.strip_suffix('\n').unwrap_or(rest);
    let (body, trailer) = rest.rsplit_once('\n').ok_or_else(|| corrupt("missing checksum line"))?;
    let stored = trailer
        .strip_prefix(CRC_PREFIX)
        .and_then(|hex| u32::from_str_radix(hex.trim(), 16).ok())
        .ok_or_else(|| corrupt(format!("malformed checksum line: '{trailer}'")))?;
    let computed = crc_of(body);
    if stored != computed {
        return Err(corrupt(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x}"
        )));
    }

    serde_json::from_str(body).map_err(|e| corrupt(format!("deserialization failed: {e}")))
}

fn corrupt(reason: impl Into<String>) -> PersistenceError {
    PersistenceError::Corrupt { reason: reason.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_simple() {
        let value = vec!["kappa".to_string(), "mu".to_string()];
        let encoded = encode(&value).unwrap();
        assert!(encoded.starts_with("MHCHAIN-CHECKPOINT 1\n"));
        let decoded: Vec<String> = decode(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_detects_corruption() {
        let encoded = encode(&vec![1u64, 2, 3]).unwrap();
        let tampered = encoded.replacen('2', "7", 1);
        let err = decode::<Vec<u64>>(&tampered).unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let err = decode::<Vec<u64>>("<beast>\n[]\ncrc32 0\n").unwrap_err();
        assert!(err.to_string().contains("invalid magic"));
    }

    #[test]
    fn test_rejects_future_version() {
        let encoded = encode(&0u8).unwrap().replacen("CHECKPOINT 1", "CHECKPOINT 9", 1);
        let err = decode::<u8>(&encoded).unwrap_err();
        assert!(err.to_string().contains("unsupported codec version"));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let encoded = encode(&vec![1u64, 2, 3]).unwrap();
        let truncated = &encoded[..encoded.len() / 2];
        assert!(decode::<Vec<u64>>(truncated).is_err());
    }
}
