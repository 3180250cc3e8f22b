//! Payload checksums.

use crate::message::Metadata;
use sha1::{Digest, Sha1};

/// Lowercase hex SHA-1 digest of `payload`.
pub fn checksum(payload: &[u8]) -> String {
    hex::encode(Sha1::digest(payload))
}

/// Outcome of checking a payload against its declared `sha1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    /// No `sha1` declared.
    Undeclared,
    Valid,
    Mismatch { declared: String, actual: String },
}

/// Compare `payload` with the `sha1` declared in `metadata` (case-insensitive).
pub fn verify(metadata: &Metadata, payload: &[u8]) -> Integrity {
    let Some(declared) = metadata.sha1() else {
        return Integrity::Undeclared;
    };
    let actual = checksum(payload);
    if declared.eq_ignore_ascii_case(&actual) {
        Integrity::Valid
    } else {
        Integrity::Mismatch {
            declared: declared.to_string(),
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::keys;

    #[test]
    fn known_digest() {
        assert_eq!(checksum(b"hello"), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }

    #[test]
    fn verify_outcomes() {
        let mut metadata = Metadata::data("text/plain");
        assert_eq!(verify(&metadata, b"hello"), Integrity::Undeclared);

        metadata.insert(keys::SHA1, "AAF4C61DDCC5E8A2DABEDE0F3B482CD9AEA9434D");
        assert_eq!(verify(&metadata, b"hello"), Integrity::Valid);

        assert!(matches!(verify(&metadata, b"hellO"), Integrity::Mismatch { .. }));
    }
}
