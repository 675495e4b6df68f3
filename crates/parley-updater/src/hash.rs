//! Content digests.
//!
//! SHA-256 over in-memory bytes or a readable stream, rendered as 64
//! lowercase hex characters. Comparisons run in constant time so a mismatch
//! position is not observable.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::UpdateError;

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 8192;

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// SHA-256 of `bytes` as lowercase hex.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 of everything readable from `reader`, streamed in fixed chunks.
pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a file on disk.
pub fn digest_file(path: &Path) -> Result<String, UpdateError> {
    let file = File::open(path)?;
    Ok(digest_reader(file)?)
}

/// Case-insensitive digest equality.
pub fn matches(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Whether `s` is a well-formed lowercase SHA-256 hex digest.
pub fn is_digest_hex(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Hash the file at `path` and compare it to `expected`.
///
/// # Errors
///
/// Returns `UpdateError::HashMismatch` when the digests differ, or an IO
/// error if the file cannot be read.
pub fn verify_file(path: &Path, expected: &str) -> Result<(), UpdateError> {
    let actual = digest_file(path)?;

    if !matches(&actual, expected) {
        tracing::error!(
            expected = %expected,
            actual = %actual,
            path = %path.display(),
            "Artifact hash mismatch"
        );
        return Err(UpdateError::HashMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        });
    }

    tracing::debug!(hash = %actual, path = %path.display(), "Artifact hash verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_digest_known_values() {
        assert_eq!(digest(b""), EMPTY_SHA256);
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_reader_matches_digest() {
        let data = vec![7u8; HASH_BUFFER_SIZE * 3 + 17];
        let streamed = digest_reader(std::io::Cursor::new(&data)).unwrap();
        assert_eq!(streamed, digest(&data));
    }

    #[test]
    fn test_matches_is_case_insensitive() {
        assert!(matches(EMPTY_SHA256, &EMPTY_SHA256.to_uppercase()));
        assert!(!matches(EMPTY_SHA256, &EMPTY_SHA256[..63]));
        assert!(!matches(EMPTY_SHA256, &digest(b"x")));
    }

    #[test]
    fn test_is_digest_hex() {
        assert!(is_digest_hex(EMPTY_SHA256));
        assert!(!is_digest_hex(&EMPTY_SHA256.to_uppercase()));
        assert!(!is_digest_hex("abc"));
        assert!(!is_digest_hex(&"g".repeat(64)));
    }

    #[test]
    fn test_verify_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"parley").unwrap();

        verify_file(&path, &digest(b"parley")).unwrap();
        let err = verify_file(&path, EMPTY_SHA256).unwrap_err();
        assert!(matches!(err, UpdateError::HashMismatch { .. }));
    }
}
