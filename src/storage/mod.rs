//! Durable blob storage
//!
//! The rest of the service treats storage as an opaque key-value store of
//! binary objects with prefix listing. Keys are relative slash-separated
//! paths (`logos/example_com_direct_1a2b3c4d.png`); the filesystem backend
//! maps them onto a sandboxed directory tree and rejects traversal attempts.

pub mod streaming;

use crate::errors::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Byte stream fed into `write_stream`
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Opaque key-value blob store
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, key: &str) -> StorageResult<bool>;
    async fn read(&self, key: &str) -> StorageResult<Bytes>;
    async fn write(&self, key: &str, data: Bytes) -> StorageResult<()>;
    async fn delete(&self, key: &str) -> StorageResult<()>;
    /// Keys starting with `prefix`, in no particular order.
    async fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;
    /// Atomic-as-possible rename; used by legacy key migration.
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;
    /// Consume a byte stream into `key` without buffering the whole object.
    /// Returns the number of bytes written. A failed stream must not leave
    /// a partial object behind.
    async fn write_stream(&self, key: &str, stream: ByteStream) -> StorageResult<u64>;
}

/// Reject keys that would escape the store or collide with temp files.
fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Filesystem-backed blob store rooted at a single directory
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn new<P: Into<PathBuf>>(root: P) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn ensure_parent(&self, path: &Path, key: &str) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(key, e))?;
        }
        Ok(())
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(&format!(".tmp-{}", Uuid::new_v4().simple()));
        path.with_file_name(name)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(key, e))?)
    }

    async fn read(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn write(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.path_for(key)?;
        self.ensure_parent(&path, key).await?;

        // Write-then-rename so readers never observe a partial object.
        let temp = self.temp_path(&path);
        tokio::fs::write(&temp, &data)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::io(key, e));
        }
        debug!(key = key, bytes = data.len(), "blob written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // Start the walk at the deepest directory the prefix pins down.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            validate_key(dir_part)?;
            self.root.join(dir_part)
        };
        if !tokio::fs::try_exists(&start)
            .await
            .map_err(|e| StorageError::io(prefix, e))?
        {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| StorageError::io(prefix, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::io(prefix, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::io(prefix, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) && !key.contains(".tmp-") {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let from_path = self.path_for(from)?;
        let to_path = self.path_for(to)?;
        self.ensure_parent(&to_path, to).await?;
        match tokio::fs::rename(&from_path, &to_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: from.to_string(),
            }),
            Err(e) => Err(StorageError::io(from, e)),
        }
    }

    async fn write_stream(&self, key: &str, mut stream: ByteStream) -> StorageResult<u64> {
        use futures::StreamExt;

        let path = self.path_for(key)?;
        self.ensure_parent(&path, key).await?;
        let temp = self.temp_path(&path);

        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp).await;
                    warn!(key = key, error = %e, "stream aborted, partial object removed");
                    return Err(StorageError::io(key, e));
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(StorageError::io(key, e));
            }
            written += chunk.len() as u64;
        }

        if let Err(e) = file.flush().await {
            drop(file);
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::io(key, e));
        }
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::io(key, e));
        }
        debug!(key = key, bytes = written, "blob streamed to storage");
        Ok(written)
    }
}

/// In-memory blob store for tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn read(&self, key: &str) -> StorageResult<Bytes> {
        validate_key(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn write(&self, key: &str, data: Bytes) -> StorageResult<()> {
        validate_key(key)?;
        self.objects.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        validate_key(from)?;
        validate_key(to)?;
        let mut objects = self.objects.write().await;
        match objects.remove(from) {
            Some(data) => {
                objects.insert(to.to_string(), data);
                Ok(())
            }
            None => Err(StorageError::NotFound {
                key: from.to_string(),
            }),
        }
    }

    async fn write_stream(&self, key: &str, mut stream: ByteStream) -> StorageResult<u64> {
        use futures::StreamExt;

        validate_key(key)?;
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StorageError::io(key, e))?;
            buffer.extend_from_slice(&chunk);
        }
        let written = buffer.len() as u64;
        self.objects
            .write()
            .await
            .insert(key.to_string(), Bytes::from(buffer));
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let store = MemoryBlobStore::new();
        for key in ["", "/abs", "a/../b", "a//b", "a/./b", "nul\0"] {
            assert!(matches!(
                store.write(key, Bytes::from_static(b"x")).await,
                Err(StorageError::InvalidKey { .. })
            ));
        }
    }

    #[tokio::test]
    async fn fs_store_round_trip_and_prefix_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).await.unwrap();

        store
            .write("logos/example_com_direct_1a2b3c4d.png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        store
            .write("logos/other_com_google_ffee0011.png", Bytes::from_static(b"png2"))
            .await
            .unwrap();
        store
            .write("images/abc.jpg", Bytes::from_static(b"jpg"))
            .await
            .unwrap();

        assert!(store.exists("logos/example_com_direct_1a2b3c4d.png").await.unwrap());
        assert_eq!(
            store.read("images/abc.jpg").await.unwrap(),
            Bytes::from_static(b"jpg")
        );

        let mut keys = store.list_prefix("logos/").await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "logos/example_com_direct_1a2b3c4d.png".to_string(),
                "logos/other_com_google_ffee0011.png".to_string(),
            ]
        );

        let narrowed = store.list_prefix("logos/example_com").await.unwrap();
        assert_eq!(narrowed.len(), 1);
    }

    #[tokio::test]
    async fn fs_rename_moves_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).await.unwrap();

        store
            .write("logos/legacy_direct.png", Bytes::from_static(b"data"))
            .await
            .unwrap();
        store
            .rename("logos/legacy_direct.png", "logos/legacy_direct_0badcafe.png")
            .await
            .unwrap();

        assert!(!store.exists("logos/legacy_direct.png").await.unwrap());
        assert_eq!(
            store.read("logos/legacy_direct_0badcafe.png").await.unwrap(),
            Bytes::from_static(b"data")
        );
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_partial_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).await.unwrap();

        let stream: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"first")),
            Err(std::io::Error::other("connection reset")),
        ])
        .boxed();

        assert!(store.write_stream("images/partial.bin", stream).await.is_err());
        assert!(!store.exists("images/partial.bin").await.unwrap());
        assert!(store.list_prefix("images/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_stream_reports_byte_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).await.unwrap();

        let stream: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ])
        .boxed();

        let written = store.write_stream("images/hello.txt", stream).await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(
            store.read("images/hello.txt").await.unwrap(),
            Bytes::from_static(b"hello world")
        );
    }
}
