//! Blob Cache (C2): a content-addressed on-disk store with atomic writes and
//! a selector index, grounded on the teacher's `image/cache.rs` /
//! `image/cache_manager.rs` JSON-index idiom but redesigned around §4.2's
//! simpler, lock-free contract — presence is defined by the filesystem, not
//! by a mutable in-memory index that itself can drift out of sync.
//!
//! ```text
//! <root>/
//!   layers/<sha256>           (compressed bytes, mode 0644)
//!   selectors/<selector-sha>  (one line: target digest)
//!   tmp/                      (in-progress writes)
//! ```

use crate::digest::{BlobDescriptor, Digest};
use crate::error::{BuildError, Result};
use crate::model::Selector;
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct BlobCache {
    root: PathBuf,
}

/// A cached blob opened for read, with its descriptor already known.
pub struct CachedLayer {
    pub path: PathBuf,
    pub descriptor: BlobDescriptor,
}

impl BlobCache {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["layers", "selectors", "tmp"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self { root })
    }

    fn layer_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("layers").join(digest.cache_filename())
    }

    fn selector_path(&self, selector: &Selector) -> PathBuf {
        self.root.join("selectors").join(selector.as_str())
    }

    pub async fn contains(&self, digest: &Digest) -> bool {
        tokio::fs::metadata(self.layer_path(digest)).await.is_ok()
    }

    /// Opens a cached blob for read. (I1) Re-hashes the file and errors with
    /// `CacheCorrupted` — and deletes the bad file — if it doesn't match its
    /// own name, so a corrupt entry self-heals by forcing re-materialisation.
    pub async fn get(&self, digest: &Digest) -> Result<CachedLayer> {
        let path = self.layer_path(digest);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| BuildError::CacheCorrupted { path: path.clone(), detail: format!("not present: {}", e) })?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| BuildError::CacheCorrupted { path: path.clone(), detail: e.to_string() })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        let computed = Digest::from_hex(&hex::encode(hasher.finalize()))?;
        if &computed != digest {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(BuildError::CacheCorrupted {
                path,
                detail: format!("recomputed digest {} does not match filename {}", computed, digest),
            });
        }

        Ok(CachedLayer { path, descriptor: BlobDescriptor::new(size, digest.clone()) })
    }

    /// Writes `data` to `tmp/<uuid>`, hashing on the fly, then atomically
    /// renames to `layers/<digest>`. Concurrent inserts of the same digest
    /// race the rename (I3); losers discard their temp file — both are valid.
    pub async fn put(&self, data: &[u8]) -> Result<BlobDescriptor> {
        let descriptor = BlobDescriptor::of_bytes(data);
        let final_path = self.layer_path(&descriptor.digest);

        if tokio::fs::metadata(&final_path).await.is_ok() {
            return Ok(descriptor);
        }

        let tmp_path = self.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
        {
            let mut tmp = tokio::fs::File::create(&tmp_path).await?;
            tmp.write_all(data).await?;
            tmp.flush().await?;
        }

        match tokio::fs::rename(&tmp_path, &final_path).await {
            Ok(()) => Ok(descriptor),
            Err(e) if final_path_now_exists(&final_path).await => {
                // Lost the rename race to a concurrent writer of the same digest;
                // the winner's bytes are byte-identical, so this is not an error.
                let _ = tokio::fs::remove_file(&tmp_path).await;
                let _ = e;
                Ok(descriptor)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(BuildError::Io(format!("failed to finalize cache write: {}", e)))
            }
        }
    }

    /// Streams an async reader into the cache, hashing as it goes, without
    /// buffering the whole blob in memory first.
    pub async fn put_stream<R: tokio::io::AsyncRead + Unpin>(&self, mut reader: R) -> Result<BlobDescriptor> {
        let tmp_path = self.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        {
            let mut tmp = tokio::fs::File::create(&tmp_path).await?;
            let mut buf = [0u8; 32 * 1024];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                tmp.write_all(&buf[..n]).await?;
                hasher.update(&buf[..n]);
                size += n as u64;
            }
            tmp.flush().await?;
        }
        let digest = Digest::from_hex(&hex::encode(hasher.finalize()))?;
        let final_path = self.layer_path(&digest);
        match tokio::fs::rename(&tmp_path, &final_path).await {
            Ok(()) => {}
            Err(_) if final_path_now_exists(&final_path).await => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(BuildError::Io(format!("failed to finalize cache write: {}", e)));
            }
        }
        Ok(BlobDescriptor::new(size, digest))
    }

    /// (I2) A selector may only point at a digest currently present.
    pub async fn link_selector(&self, selector: &Selector, digest: &Digest) -> Result<()> {
        if !self.contains(digest).await {
            return Err(BuildError::CacheCorrupted {
                path: self.selector_path(selector),
                detail: format!("refusing to link selector to absent digest {}", digest),
            });
        }
        let tmp_path = self.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
        tokio::fs::write(&tmp_path, digest.as_str()).await?;
        tokio::fs::rename(&tmp_path, self.selector_path(selector)).await?;
        Ok(())
    }

    pub async fn resolve_selector(&self, selector: &Selector) -> Result<Option<Digest>> {
        match tokio::fs::read_to_string(self.selector_path(selector)).await {
            Ok(contents) => {
                let digest = Digest::parse(contents.trim().to_string())?;
                if self.contains(&digest).await {
                    Ok(Some(digest))
                } else {
                    // Selector survived but its target was evicted; treat as a miss.
                    Ok(None)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BuildError::Io(e.to_string())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

async fn final_path_now_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// Computes the selector (stable hash) for a [`crate::model::FileEntriesLayer`]'s
/// source description, used to answer "have I already built this layer"
/// without re-tarring it.
pub fn selector_for(entries: &[crate::model::FileEntry]) -> Selector {
    let mut hasher = Sha256::new();
    let mut sorted: Vec<&crate::model::FileEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.extraction_path.cmp(&b.extraction_path));
    for entry in sorted {
        hasher.update(entry.extraction_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.permissions.to_le_bytes());
        hasher.update(entry.ownership.as_bytes());
        hasher.update([0u8]);
        if let Ok(duration) = entry.mod_time.duration_since(std::time::UNIX_EPOCH) {
            hasher.update(duration.as_secs().to_le_bytes());
        }
        if let Ok(meta) = std::fs::metadata(&entry.source_path) {
            hasher.update(meta.len().to_le_bytes());
        }
        hasher.update(entry.source_path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
    }
    Selector::new(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    async fn tmp_cache() -> (BlobCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(dir.path()).await.unwrap();
        (cache, dir)
    }

    #[tokio::test]
    async fn put_then_contains_is_atomic() {
        let (cache, _dir) = tmp_cache().await;
        let desc = cache.put(b"layer bytes").await.unwrap();
        assert!(cache.contains(&desc.digest).await);
    }

    #[tokio::test]
    async fn get_rejects_corrupted_file() {
        let (cache, dir) = tmp_cache().await;
        let desc = cache.put(b"layer bytes").await.unwrap();
        // Corrupt the stored bytes without changing the filename.
        tokio::fs::write(dir.path().join("layers").join(desc.digest.cache_filename()), b"tampered").await.unwrap();
        let result = cache.get(&desc.digest).await;
        assert!(matches!(result, Err(BuildError::CacheCorrupted { .. })));
        // Self-heals: the bad file is gone afterwards.
        assert!(!cache.contains(&desc.digest).await);
    }

    #[tokio::test]
    async fn selector_roundtrip() {
        let (cache, _dir) = tmp_cache().await;
        let desc = cache.put(b"content").await.unwrap();
        let selector = Selector::new("abc123".to_string());
        cache.link_selector(&selector, &desc.digest).await.unwrap();
        assert_eq!(cache.resolve_selector(&selector).await.unwrap(), Some(desc.digest));
    }

    #[tokio::test]
    async fn selector_cannot_point_at_missing_digest() {
        let (cache, _dir) = tmp_cache().await;
        let missing = Digest::from_hex(&"0".repeat(64)).unwrap();
        let selector = Selector::new("dangling".to_string());
        assert!(cache.link_selector(&selector, &missing).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_put_of_same_digest_is_safe() {
        let (cache, _dir) = tmp_cache().await;
        let mut handles = Vec::new();
        let cache = std::sync::Arc::new(cache);
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.put(b"race me").await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
    }

    #[test]
    fn selector_changes_with_mtime_but_digest_only_depends_on_bytes() {
        let entry_a = crate::model::FileEntry::new("/tmp/does-not-exist-a", "/app/a", 0o644, SystemTime::UNIX_EPOCH, "0:0");
        let entry_b = crate::model::FileEntry::new("/tmp/does-not-exist-a", "/app/a", 0o644, SystemTime::now(), "0:0");
        assert_ne!(selector_for(&[entry_a]), selector_for(&[entry_b]));
    }
}
