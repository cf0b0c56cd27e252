//! Digest & Hashing (C1): streaming SHA-256, the [`Digest`] and [`BlobDescriptor`]
//! types, and [`DigestingWriter`] tee-writers used by the cache and archiver.

use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// An opaque `algorithm:hex` content address. Only `sha256` is produced by
/// this core; equality and hashing are plain string comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub const ALGORITHM: &'static str = "sha256";

    /// Validates `algorithm:hex` shape: algorithm must be `sha256`, hex must
    /// be exactly 64 lowercase hex characters.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| BuildError::Parse(format!("digest missing ':': {}", s)))?;
        if algo != Self::ALGORITHM {
            return Err(BuildError::Parse(format!("unsupported digest algorithm: {}", algo)));
        }
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(BuildError::Parse(format!("invalid sha256 hex in digest: {}", s)));
        }
        Ok(Digest(s))
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        Self::parse(format!("{}:{}", Self::ALGORITHM, hex))
    }

    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form used under the cache's `blobs/` directory: the
    /// digest's hex part is the filename, matching §4.2's layout.
    pub fn cache_filename(&self) -> &str {
        self.hex()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Digest {
    type Err = BuildError;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s.to_string())
    }
}

impl TryFrom<String> for Digest {
    type Error = BuildError;
    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.0
    }
}

/// Size + digest (+ optional media type) describing a blob. Stable for the
/// bytes it describes: hashing the same bytes twice yields an equal descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub size: u64,
    pub digest: Digest,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl BlobDescriptor {
    pub fn new(size: u64, digest: Digest) -> Self {
        Self { size, digest, media_type: None }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    /// Compute a descriptor over a full in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest = Digest::from_hex(&hex::encode(hasher.finalize())).expect("hex digest is always valid");
        BlobDescriptor::new(data.len() as u64, digest)
    }
}

/// Tees everything written through it to an inner async sink while updating
/// a running SHA-256, yielding a [`BlobDescriptor`] on [`DigestingWriter::finish`].
/// Allocation-light: a fixed 32 KiB scratch buffer per writer, no internal
/// buffering of the written bytes themselves.
pub struct DigestingWriter<W> {
    inner: W,
    hasher: Sha256,
    size: u64,
}

impl<W: AsyncWrite + Unpin> DigestingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, hasher: Sha256::new(), size: 0 }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf).await.map_err(|e| BuildError::Io(format!("digesting writer: {}", e)))?;
        self.hasher.update(buf);
        self.size += buf.len() as u64;
        Ok(())
    }

    /// Flushes the inner sink and returns the descriptor for everything written.
    pub async fn finish(mut self) -> Result<BlobDescriptor> {
        self.inner.flush().await.map_err(|e| BuildError::Io(format!("digesting writer flush: {}", e)))?;
        let digest = Digest::from_hex(&hex::encode(self.hasher.finalize())).expect("hex digest is always valid");
        Ok(BlobDescriptor::new(self.size, digest))
    }
}

/// Synchronous counterpart used by the tar archiver, which writes through
/// `std::io::Write` (the `tar`/`flate2` crates are sync).
pub struct SyncDigestingWriter<W> {
    inner: W,
    hasher: Sha256,
    size: u64,
}

impl<W: std::io::Write> SyncDigestingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, hasher: Sha256::new(), size: 0 }
    }

    pub fn finish(self) -> (W, BlobDescriptor) {
        let digest = Digest::from_hex(&hex::encode(self.hasher.clone().finalize())).expect("hex digest is always valid");
        (self.inner, BlobDescriptor::new(self.size, digest))
    }
}

impl<W: std::io::Write> std::io::Write for SyncDigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_digest() {
        let d = Digest::from_hex(&"a".repeat(64)).unwrap();
        assert_eq!(d.as_str(), format!("sha256:{}", "a".repeat(64)));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Digest::from_hex("abc").is_err());
    }

    #[test]
    fn rejects_uppercase() {
        assert!(Digest::parse(format!("sha256:{}", "A".repeat(64))).is_err());
    }

    #[test]
    fn rejects_wrong_algorithm() {
        assert!(Digest::parse(format!("sha512:{}", "a".repeat(64))).is_err());
    }

    #[test]
    fn descriptor_stable_for_same_bytes() {
        let a = BlobDescriptor::of_bytes(b"hello world");
        let b = BlobDescriptor::of_bytes(b"hello world");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn digesting_writer_matches_direct_hash() {
        let mut buf = Vec::new();
        {
            let mut w = DigestingWriter::new(&mut buf);
            w.write_all(b"hello ").await.unwrap();
            w.write_all(b"world").await.unwrap();
            let desc = w.finish().await.unwrap();
            let expected = BlobDescriptor::of_bytes(b"hello world");
            assert_eq!(desc, expected);
        }
        assert_eq!(buf, b"hello world");
    }

    #[test]
    fn sync_digesting_writer_matches_direct_hash() {
        let mut out = Vec::new();
        let mut w = SyncDigestingWriter::new(&mut out);
        use std::io::Write;
        w.write_all(b"payload").unwrap();
        let (_, desc) = w.finish();
        assert_eq!(desc, BlobDescriptor::of_bytes(b"payload"));
    }
}
