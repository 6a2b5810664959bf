//! SHA-512 verification of downloaded artefacts.

use crate::filesystem::FileSystem;
use sha2::{Digest, Sha512};
use std::io::{self, Read};
use std::path::Path;

const READ_CHUNK: usize = 64 * 1024;

/// Stream `path` through SHA-512 and return the lowercase hex digest.
pub fn sha512_file(fs: &dyn FileSystem, path: &Path) -> io::Result<String> {
    let mut reader = fs.open(path)?;
    let mut hasher = Sha512::new();
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether the file at `path` has exactly `size` bytes and hashes to
/// `expected_hex`.
///
/// A size mismatch is decided without reading the file. Read failures count
/// as "not verified".
pub fn verify_file(fs: &dyn FileSystem, path: &Path, size: u64, expected_hex: &str) -> bool {
    match fs.file_size(path) {
        Some(actual) if actual == size => {}
        Some(actual) => {
            tracing::debug!(?path, expected = size, actual, "size mismatch, skipping hash");
            return false;
        }
        None => return false,
    }

    match sha512_file(fs, path) {
        Ok(actual) => {
            let matches = actual.eq_ignore_ascii_case(expected_hex);
            if !matches {
                tracing::warn!(?path, expected = expected_hex, actual = %actual, "checksum mismatch");
            }
            matches
        }
        Err(err) => {
            tracing::warn!(?path, "failed to hash file: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::LocalFs;
    use std::fs;
    use tempfile::tempdir;

    const HELLO_WORLD_SHA512: &str = "309ecc489c12d6eb4cc40f50c902f2b4d0ed77ee511a7c7a9bcd3ca86d4cd86f989dd35bc5ff499670da34255b45b0cfd830e81f605dcf7dc5542e93ae9cd76f";

    #[test]
    fn digest_matches_reference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fixture.txt");
        fs::write(&path, b"hello world").unwrap();

        assert_eq!(sha512_file(&LocalFs, &path).unwrap(), HELLO_WORLD_SHA512);
    }

    #[test]
    fn single_byte_change_changes_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fixture.txt");
        fs::write(&path, b"hello world").unwrap();
        let before = sha512_file(&LocalFs, &path).unwrap();

        fs::write(&path, b"hello worle").unwrap();
        let after = sha512_file(&LocalFs, &path).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn digest_of_multi_chunk_file_matches_one_shot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("large.bin");
        let data: Vec<u8> = (0..(READ_CHUNK * 3 + 17)).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        let expected = hex::encode(Sha512::digest(&data));
        assert_eq!(sha512_file(&LocalFs, &path).unwrap(), expected);
    }

    #[test]
    fn verification_is_case_insensitive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fixture.txt");
        fs::write(&path, b"hello world").unwrap();

        assert!(verify_file(
            &LocalFs,
            &path,
            11,
            &HELLO_WORLD_SHA512.to_ascii_uppercase()
        ));
    }

    #[test]
    fn size_mismatch_is_not_verified() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fixture.txt");
        fs::write(&path, b"hello world").unwrap();

        assert!(!verify_file(&LocalFs, &path, 12, HELLO_WORLD_SHA512));
    }

    #[test]
    fn missing_file_is_not_verified() {
        let dir = tempdir().unwrap();
        assert!(!verify_file(
            &LocalFs,
            &dir.path().join("absent"),
            11,
            HELLO_WORLD_SHA512
        ));
    }
}
