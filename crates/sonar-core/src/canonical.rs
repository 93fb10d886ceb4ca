use std::fmt::Write as _;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult, ErrorCode};

/// Returns RFC 8785 canonical JSON bytes for a serializable value.
///
/// Every digest in a run document is computed over this form so repeated
/// evaluations of identical state produce byte-identical digests.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> EngineResult<Vec<u8>> {
    serde_jcs::to_vec(value).map_err(|error| {
        EngineError::new(
            ErrorCode::Internal,
            format!("failed to canonicalize json: {error}"),
        )
    })
}

/// Hex-encodes the sha-256 digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut output, "{byte:02x}");
    }
    output
}

/// Digests a serializable value as `sha256:<hex>` over canonical JSON.
pub fn digest_of_value<T: Serialize + ?Sized>(value: &T) -> EngineResult<String> {
    let bytes = canonical_json_bytes(value)?;
    Ok(format!("sha256:{}", sha256_hex(&bytes)))
}

/// Digests raw text as `sha256:<hex>` over its UTF-8 bytes.
pub fn digest_of_str(text: &str) -> String {
    format!("sha256:{}", sha256_hex(text.as_bytes()))
}

/// Derives the stable citation id for a normalized URL.
pub fn cid_for_url(normalized_url: &str) -> String {
    format!("cid_{}", sha256_hex(normalized_url.as_bytes()))
}
