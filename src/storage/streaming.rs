//! Streaming writes into blob storage
//!
//! Large response bodies go straight from the network into storage instead
//! of being buffered in memory. A counting adapter enforces the hard size
//! cap mid-stream and aborts the transfer the moment it is crossed, so a
//! lying `Content-Length` cannot balloon the process.

use crate::errors::{StorageError, StorageResult};
use crate::storage::{BlobStore, ByteStream};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Streaming policy + write front-end over a `BlobStore`
#[derive(Clone)]
pub struct StreamingStorage {
    store: Arc<dyn BlobStore>,
    threshold_bytes: u64,
    cap_bytes: u64,
}

impl StreamingStorage {
    pub fn new(store: Arc<dyn BlobStore>, threshold_bytes: u64, cap_bytes: u64) -> Self {
        Self {
            store,
            threshold_bytes,
            cap_bytes,
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Stream when the declared length crosses the threshold. Unknown
    /// lengths take the buffered path, where the cap is still enforced.
    pub fn should_stream(&self, content_length: Option<u64>) -> bool {
        matches!(content_length, Some(len) if len > self.threshold_bytes)
    }

    /// Pipe `stream` into storage under the hard size cap.
    ///
    /// On a cap violation the partial object is already gone (the store
    /// cleans up failed streams) and `SizeCapExceeded` is returned.
    pub async fn store_streamed<S, E>(&self, key: &str, stream: S) -> StorageResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::fmt::Display + Send + Sync + 'static,
    {
        let received = Arc::new(AtomicU64::new(0));
        let capped = Arc::new(AtomicBool::new(false));
        let cap = self.cap_bytes;

        let counted: ByteStream = {
            let received = received.clone();
            let capped = capped.clone();
            stream
                .map(move |chunk| match chunk {
                    Ok(chunk) => {
                        let total = received.fetch_add(chunk.len() as u64, Ordering::SeqCst)
                            + chunk.len() as u64;
                        if total > cap {
                            capped.store(true, Ordering::SeqCst);
                            Err(std::io::Error::other("size cap exceeded"))
                        } else {
                            Ok(chunk)
                        }
                    }
                    Err(e) => Err(std::io::Error::other(e.to_string())),
                })
                .boxed()
        };

        match self.store.write_stream(key, counted).await {
            Ok(written) => {
                debug!(key = key, bytes = written, "streamed write complete");
                Ok(written)
            }
            Err(_) if capped.load(Ordering::SeqCst) => {
                let received = received.load(Ordering::SeqCst);
                warn!(
                    key = key,
                    received = received,
                    cap = cap,
                    "download aborted at size cap"
                );
                Err(StorageError::SizeCapExceeded {
                    key: key.to_string(),
                    received,
                    cap,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Buffered write with the same cap applied up front.
    pub async fn store_buffered(&self, key: &str, data: Bytes) -> StorageResult<u64> {
        let len = data.len() as u64;
        if len > self.cap_bytes {
            return Err(StorageError::SizeCapExceeded {
                key: key.to_string(),
                received: len,
                cap: self.cap_bytes,
            });
        }
        self.store.write(key, data).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    fn storage_with_limits(threshold: u64, cap: u64) -> (StreamingStorage, Arc<MemoryBlobStore>) {
        let store = Arc::new(MemoryBlobStore::new());
        (
            StreamingStorage::new(store.clone(), threshold, cap),
            store,
        )
    }

    fn chunks_of(total: usize, chunk: usize) -> Vec<Result<Bytes, std::io::Error>> {
        let mut out = Vec::new();
        let mut remaining = total;
        while remaining > 0 {
            let size = remaining.min(chunk);
            out.push(Ok(Bytes::from(vec![0u8; size])));
            remaining -= size;
        }
        out
    }

    #[tokio::test]
    async fn threshold_decides_streaming() {
        let (storage, _) = storage_with_limits(5 * 1024 * 1024, 100 * 1024 * 1024);
        assert!(!storage.should_stream(None));
        assert!(!storage.should_stream(Some(5 * 1024 * 1024)));
        assert!(storage.should_stream(Some(5 * 1024 * 1024 + 1)));
        assert!(storage.should_stream(Some(8 * 1024 * 1024)));
    }

    #[tokio::test]
    async fn large_body_streams_in_chunks() {
        // 8 MiB body through a storage configured with the default 5 MiB
        // threshold; delivered in 64 KiB chunks so nothing approaches a
        // whole-body buffer.
        let (storage, store) = storage_with_limits(5 * 1024 * 1024, 100 * 1024 * 1024);
        let body = 8 * 1024 * 1024;

        assert!(storage.should_stream(Some(body as u64)));
        let stream = futures::stream::iter(chunks_of(body, 64 * 1024));
        let written = storage.store_streamed("images/big.bin", stream).await.unwrap();

        assert_eq!(written, body as u64);
        assert_eq!(store.read("images/big.bin").await.unwrap().len(), body);
    }

    #[tokio::test]
    async fn cap_aborts_mid_stream() {
        let (storage, store) = storage_with_limits(1024, 10 * 1024);
        let stream = futures::stream::iter(chunks_of(64 * 1024, 4 * 1024));

        let err = storage
            .store_streamed("images/too-big.bin", stream)
            .await
            .unwrap_err();
        match err {
            StorageError::SizeCapExceeded { received, cap, .. } => {
                assert!(received > cap);
                // Aborted well before the 64 KiB source was consumed.
                assert!(received <= 16 * 1024);
            }
            other => panic!("expected SizeCapExceeded, got {other:?}"),
        }
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn buffered_write_enforces_cap() {
        let (storage, store) = storage_with_limits(1024, 2048);

        let ok = storage
            .store_buffered("images/small.bin", Bytes::from(vec![0u8; 2048]))
            .await;
        assert_eq!(ok.unwrap(), 2048);

        let err = storage
            .store_buffered("images/big.bin", Bytes::from(vec![0u8; 2049]))
            .await;
        assert!(matches!(err, Err(StorageError::SizeCapExceeded { .. })));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn upstream_error_propagates_as_io() {
        let (storage, store) = storage_with_limits(1024, 10 * 1024);
        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data")),
            Err(std::io::Error::other("reset by peer")),
        ]);

        let err = storage.store_streamed("images/x.bin", stream).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
        assert!(store.is_empty().await);
    }
}
