//! Content hashing: the PDF's SHA-256 digest is the storage key.
//!
//! The full 32-byte digest is the database key; the first 16 hex characters
//! prefix every file derived from the manual. Two uploads with identical
//! bytes therefore land on the same rows and the same files, whatever their
//! file names.

use crate::error::GuideError;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Length of the hex prefix used in file names.
pub const KEY_LEN: usize = 16;

const CHUNK_SIZE: usize = 64 * 1024;

/// SHA-256 digest of a PDF's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash an in-memory buffer.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Hash a file by streaming it in chunks on the blocking pool.
    pub async fn of_file(path: &Path) -> Result<Self, GuideError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::of_file_blocking(&path))
            .await
            .map_err(|e| GuideError::Internal(format!("Hash task panicked: {e}")))?
    }

    fn of_file_blocking(path: &Path) -> Result<Self, GuideError> {
        let mut file = std::fs::File::open(path).map_err(|e| GuideError::io(path, e))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).map_err(|e| GuideError::io(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let hash = Self(hasher.finalize().into());
        debug!("Hashed {} → {}", path.display(), hash.key());
        Ok(hash)
    }

    /// Rebuild a hash from its stored bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// Parse a full 64-character hex digest.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        Self::from_bytes(&bytes)
    }

    /// Raw digest, used as the database key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short key prefixing every derived file name.
    pub fn key(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(KEY_LEN);
        hex
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.key())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn known_digest() {
        let h = ContentHash::of_bytes(b"abc");
        assert_eq!(h.to_hex(), ABC_SHA256);
        assert_eq!(h.key(), "ba7816bf8f01cfea");
    }

    #[test]
    fn hex_round_trip_and_rejects_short_input() {
        let h = ContentHash::from_hex(ABC_SHA256).expect("valid hex");
        assert_eq!(h, ContentHash::of_bytes(b"abc"));
        assert!(ContentHash::from_hex("ba7816bf8f01cfea").is_none());
        assert!(ContentHash::from_hex("not hex").is_none());
    }

    #[tokio::test]
    async fn file_hash_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual.pdf");
        // Larger than one chunk so the streaming loop runs more than once.
        let bytes: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &bytes).unwrap();

        let from_file = ContentHash::of_file(&path).await.unwrap();
        assert_eq!(from_file, ContentHash::of_bytes(&bytes));
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let err = ContentHash::of_file(Path::new("/no/such/manual.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, GuideError::Io { .. }));
    }
}
