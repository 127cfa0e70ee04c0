//! # Tile Blob Storage
//!
//! Byte storage for cached tiles. The cache only ever talks to the
//! [`BlobStore`] trait; [`FsBlobStore`] keeps tiles on disk as
//! `{root}/{zoom}/{x}/{y}.png`, the layout offline map viewers expect.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::key::TileKey;

/// Storage for tile bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Reads a tile. `Ok(None)` if it is not stored.
    async fn read(&self, key: &TileKey) -> io::Result<Option<Bytes>>;

    /// Writes (or overwrites) a tile.
    async fn write(&self, key: &TileKey, data: &[u8]) -> io::Result<()>;

    /// Removes a tile. Removing a missing tile succeeds.
    async fn remove(&self, key: &TileKey) -> io::Result<()>;
}

/// Filesystem-backed blob store.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a tile's file.
    pub fn path_for(&self, key: &TileKey) -> PathBuf {
        self.root
            .join(key.zoom.to_string())
            .join(key.x.to_string())
            .join(format!("{}.png", key.y))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(&self, key: &TileKey) -> io::Result<Option<Bytes>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, key: &TileKey, data: &[u8]) -> io::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write beside the target and rename so readers never see a torn tile.
        let tmp = path.with_extension("png.part");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(tile = %key, bytes = data.len(), "Tile written");
        Ok(())
    }

    async fn remove(&self, key: &TileKey) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub mod fakes {
    //! In-memory blob store for cache tests.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryBlobStore {
        pub blobs: Mutex<HashMap<TileKey, Bytes>>,
        /// Keys whose removal fails with a permission error.
        pub undeletable: Mutex<HashSet<TileKey>>,
        /// Keys whose write fails as if the disk were full.
        pub unwritable: Mutex<HashSet<TileKey>>,
    }

    impl MemoryBlobStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn contains(&self, key: &TileKey) -> bool {
            self.blobs.lock().unwrap().contains_key(key)
        }

        pub fn len(&self) -> usize {
            self.blobs.lock().unwrap().len()
        }

        pub fn forget(&self, key: &TileKey) {
            self.blobs.lock().unwrap().remove(key);
        }

        pub fn make_undeletable(&self, key: TileKey) {
            self.undeletable.lock().unwrap().insert(key);
        }

        pub fn make_unwritable(&self, key: TileKey) {
            self.unwritable.lock().unwrap().insert(key);
        }
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn read(&self, key: &TileKey) -> io::Result<Option<Bytes>> {
            Ok(self.blobs.lock().unwrap().get(key).cloned())
        }

        async fn write(&self, key: &TileKey, data: &[u8]) -> io::Result<()> {
            if self.unwritable.lock().unwrap().contains(key) {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            self.blobs
                .lock()
                .unwrap()
                .insert(*key, Bytes::copy_from_slice(data));
            Ok(())
        }

        async fn remove(&self, key: &TileKey) -> io::Result<()> {
            if self.undeletable.lock().unwrap().contains(key) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only tile"));
            }
            self.blobs.lock().unwrap().remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_layout() {
        let store = FsBlobStore::new("/mnt/ssd/tiles");
        let key = TileKey::new(16, 19295, 24640).unwrap();
        assert_eq!(
            store.path_for(&key),
            PathBuf::from("/mnt/ssd/tiles/16/19295/24640.png")
        );
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());
        let key = TileKey::new(3, 2, 5).unwrap();

        assert!(store.read(&key).await.unwrap().is_none());

        store.write(&key, b"PNG-bytes").await.unwrap();
        assert_eq!(store.read(&key).await.unwrap().unwrap().as_ref(), b"PNG-bytes");
        assert!(!store.path_for(&key).with_extension("png.part").exists());

        store.remove(&key).await.unwrap();
        assert!(store.read(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());
        let key = TileKey::new(1, 0, 0).unwrap();
        assert!(store.remove(&key).await.is_ok());
    }
}
