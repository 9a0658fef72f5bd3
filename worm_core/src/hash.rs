//! Content hashing using SHA-256.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Hash digest size in bytes (SHA-256 produces 256-bit hashes).
pub const HASH_SIZE: usize = 32;

/// A 32-byte SHA-256 content hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; HASH_SIZE]);

impl ContentHash {
    /// Create a hash from raw bytes.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        ContentHash(bytes)
    }

    /// Create a hash from a hex string (64 hex characters).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != HASH_SIZE * 2 {
            return Err(Error::invalid_hash(format!(
                "Expected {} hex characters, got {}",
                HASH_SIZE * 2,
                hex_str.len()
            )));
        }

        let bytes =
            hex::decode(hex_str).map_err(|e| Error::invalid_hash(format!("Invalid hex: {}", e)))?;

        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes);
        Ok(ContentHash(hash))
    }

    /// Convert to lowercase hex string (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for compact display.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// The two shard directory names (`ab`, `cd`) for a hash beginning `abcd`.
    pub fn shards(&self) -> (String, String) {
        (hex::encode(&self.0[..1]), hex::encode(&self.0[1..2]))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Hash raw bytes.
    pub fn hash_bytes(data: &[u8]) -> Self {
        ContentHash(Sha256::digest(data).into())
    }

    /// Hash data from a reader without buffering all of it.
    pub fn hash_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = Sha256::new();
        std::io::copy(&mut reader, &mut hasher)?;
        Ok(ContentHash(hasher.finalize().into()))
    }

    /// Hash a file.
    pub fn hash_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::hash_reader(file)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Streams bytes into a writer while hashing them.
pub(crate) struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: std::io::Write> HashingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consume the writer, returning the inner writer, the hash and the byte count.
    pub(crate) fn finish(self) -> (W, ContentHash, u64) {
        (
            self.inner,
            ContentHash(self.hasher.finalize().into()),
            self.written,
        )
    }
}

impl<W: std::io::Write> std::io::Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_empty() {
        let hash = ContentHash::hash_bytes(b"");
        assert_eq!(
            hash.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_worm123() {
        let hash = ContentHash::hash_bytes(b"WORM123");
        assert_eq!(
            hash.to_hex(),
            "ec1c09ae76ff5d9897c53592f549b79d4f60cabea5037bfcd7bb5cef6cfaff90"
        );
    }

    #[test]
    fn test_hash_reader_matches_bytes() {
        let data = vec![7u8; 3 * 1024 * 1024 + 17];
        let streamed = ContentHash::hash_reader(&data[..]).unwrap();
        assert_eq!(streamed, ContentHash::hash_bytes(&data));
    }

    #[test]
    fn test_hash_from_hex_invalid_length() {
        assert!(ContentHash::from_hex("abcd").is_err());
        assert!(ContentHash::from_hex("").is_err());
    }

    #[test]
    fn test_hash_from_hex_invalid_chars() {
        let invalid = "z".repeat(64);
        assert!(ContentHash::from_hex(&invalid).is_err());
    }

    #[test]
    fn test_shards() {
        let hash = ContentHash::hash_bytes(b"hello world");
        let (first, second) = hash.shards();
        assert_eq!(first, "b9");
        assert_eq!(second, "4d");
        assert_eq!(hash.short(), "b94d27b9");
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = ContentHash::hash_bytes(b"WORM123");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));

        let parsed: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, hash);

        assert!(serde_json::from_str::<ContentHash>("\"not-a-hash\"").is_err());
    }

    #[test]
    fn test_hashing_writer() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"WORM").unwrap();
        writer.write_all(b"123").unwrap();
        let (inner, hash, written) = writer.finish();

        assert_eq!(inner, b"WORM123");
        assert_eq!(written, 7);
        assert_eq!(hash, ContentHash::hash_bytes(b"WORM123"));
    }

    // Property-based tests
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// Hashing the same data always produces the same hash
        #[test]
        fn prop_hash_deterministic(data: Vec<u8>) {
            prop_assert_eq!(ContentHash::hash_bytes(&data), ContentHash::hash_bytes(&data));
        }

        /// Streaming and one-shot hashing agree
        #[test]
        fn prop_reader_agrees_with_bytes(data in prop::collection::vec(any::<u8>(), 0..50_000)) {
            let streamed = ContentHash::hash_reader(&data[..])?;
            prop_assert_eq!(streamed, ContentHash::hash_bytes(&data));
        }

        /// Shard directories are the leading hex of the full hash
        #[test]
        fn prop_shards_prefix_hex(bytes in prop::array::uniform32(any::<u8>())) {
            let hash = ContentHash::from_bytes(bytes);
            let (first, second) = hash.shards();
            let prefix = format!("{}{}", first, second);
            prop_assert!(hash.to_hex().starts_with(&prefix));
        }
    }
}
