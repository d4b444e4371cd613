//! Content digests for lake objects

use crate::error::{CommonError, Result};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of an object body
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify an object body against the digest recorded for it
pub fn verify_sha256(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_verify_sha256() {
        let digest = sha256_hex(b"breweries");
        assert!(verify_sha256(b"breweries", &digest).is_ok());
        assert!(verify_sha256(b"breweries", &digest.to_uppercase()).is_ok());

        let err = verify_sha256(b"tampered", &digest).unwrap_err();
        assert!(matches!(err, CommonError::ChecksumMismatch { .. }));
    }
}
