//! Bitcoin-compatible hashing
//!
//! Double SHA256 is used for frame checksums and for the trailing integrity
//! hash on persisted flat files.

use sha2::{Digest, Sha256};

/// Calculate Bitcoin double SHA256 hash
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first_hash = Sha256::digest(data);
    let second_hash = Sha256::digest(first_hash);

    let mut result = [0u8; 32];
    result.copy_from_slice(&second_hash);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_sha256_empty_vector() {
        assert_eq!(
            hex::encode(double_sha256(&[])),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_hash_deterministic() {
        let data = b"deterministic test";
        assert_eq!(double_sha256(data), double_sha256(data));
        assert_ne!(double_sha256(data), double_sha256(b"deterministic tesT"));
    }
}
