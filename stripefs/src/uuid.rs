use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, SResult};

/// Length of a file identifier in bytes (a SHA-256 digest).
pub const FILE_ID_LEN: usize = 32;

/// A 32-byte opaque file identifier.
///
/// Derived from a file name by SHA-256, or random for anonymous files.
/// Ordering is plain byte order, which is what the router ring relies on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(#[serde(with = "serde_bytes")] pub [u8; FILE_ID_LEN]);

impl FileId {
    /// Derives the id of a named file.
    pub fn from_name(name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(&digest);
        FileId(id)
    }

    /// Generates a random id.
    pub fn random() -> Self {
        let mut id = [0u8; FILE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        FileId(id)
    }

    pub fn from_slice(bytes: &[u8]) -> SResult<Self> {
        if bytes.len() != FILE_ID_LEN {
            return Err(Error::Value(format!("file id must be {} bytes, got {}", FILE_ID_LEN, bytes.len())));
        }
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(FileId(id))
    }

    pub fn as_bytes(&self) -> &[u8; FILE_ID_LEN] {
        &self.0
    }

    /// URL-safe base64 rendering. `/` becomes `_` so ids can double as
    /// path components and log tokens.
    pub fn encode_base64(&self) -> String {
        base64::encode(self.0).replace('/', "_")
    }

    pub fn decode_base64(encoded: &str) -> SResult<Self> {
        let normalized = encoded.replace('_', "/");
        let bytes = base64::decode(normalized).map_err(|e| Error::Value(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode_base64())
    }
}

impl std::fmt::Debug for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileId({})", self.encode_base64())
    }
}

impl From<[u8; FILE_ID_LEN]> for FileId {
    fn from(bytes: [u8; FILE_ID_LEN]) -> Self {
        FileId(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_name_is_stable() {
        let a = FileId::from_name("hello.txt");
        let b = FileId::from_name("hello.txt");
        assert_eq!(a, b);
        assert_ne!(a, FileId::from_name("other.txt"));
    }

    #[test]
    fn base64_round_trip() {
        let id = FileId::random();
        let encoded = id.encode_base64();
        assert!(!encoded.contains('/'));
        assert_eq!(FileId::decode_base64(&encoded).unwrap(), id);
    }

    #[test]
    fn from_slice_rejects_bad_length() {
        assert!(FileId::from_slice(&[0u8; 16]).is_err());
        assert!(FileId::from_slice(&[0u8; 32]).is_ok());
    }
}
