//! Content fingerprints for change detection.
//!
//! A fingerprint is the lowercase SHA-256 hex digest of a file's bytes. When
//! the bytes cannot be read, [`fallback_fingerprint`] composes
//! `"{extension}:{byte_size}:{mtime_ns}"` so that every discovered file still
//! has an identity. Two different files with the same extension, size and
//! modification time collide under the fallback; that is an accepted
//! approximation.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

/// SHA-256 hex digest of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Streams a file through SHA-256.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Identity used when the content cannot be read.
pub fn fallback_fingerprint(extension: &str, byte_size: u64, mtime_ns: i64) -> String {
    let ext = if extension.is_empty() {
        "file"
    } else {
        extension
    };
    format!("{}:{}:{}", ext, byte_size, mtime_ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex() {
        let a = hash_bytes(b"hello world");
        assert_eq!(
            a,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(a, hash_bytes(b"hello world"));
    }

    #[test]
    fn file_hash_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"some file body").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"some file body"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(hash_file(&dir.path().join("missing.txt")).is_err());
    }

    #[test]
    fn fallback_composition() {
        assert_eq!(fallback_fingerprint(".pdf", 10, 99), ".pdf:10:99");
        assert_eq!(fallback_fingerprint("", 0, 1), "file:0:1");
    }
}
