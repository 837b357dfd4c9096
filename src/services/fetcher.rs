//! HTTP asset fetching behind a trait seam
//!
//! The orchestrator only sees `AssetFetcher`, so tests swap the network for
//! a scripted fetcher and the pipeline logic stays fully exercisable
//! offline. The real implementation wraps a shared `reqwest` client.

use crate::errors::{FetchError, FetchResult};
use crate::storage::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::debug;

/// A successful HTTP response, body not yet consumed
pub struct FetchedResponse {
    /// URL after redirects
    pub final_url: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

impl FetchedResponse {
    /// Collect the body into memory, refusing to grow past `cap` bytes.
    pub async fn into_bytes(mut self, cap: u64) -> FetchResult<Bytes> {
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = self.stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Transient {
                url: self.final_url.clone(),
                message: e.to_string(),
            })?;
            if (buffer.len() + chunk.len()) as u64 > cap {
                return Err(FetchError::InvalidAsset {
                    url: self.final_url,
                    reason: format!("body exceeds {cap} byte cap"),
                });
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(buffer))
    }
}

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// GET `url` with a per-request timeout. Non-2xx statuses are errors.
    async fn fetch(&self, url: &str, timeout: Duration) -> FetchResult<FetchedResponse>;
}

/// Production fetcher over a shared `reqwest` client
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration, user_agent: &str) -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::Transient {
                url: String::new(),
                message: format!("client construction failed: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> FetchResult<FetchedResponse> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout {
                        url: url.to_string(),
                        seconds: timeout.as_secs(),
                    }
                } else {
                    FetchError::Transient {
                        url: url.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let content_length = response.content_length();
        debug!(
            url = url,
            content_type = content_type.as_deref().unwrap_or("-"),
            content_length = content_length.unwrap_or(0),
            "fetch started"
        );

        let stream: ByteStream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();

        Ok(FetchedResponse {
            final_url,
            content_type,
            content_length,
            stream,
        })
    }
}

/// Scripted fetcher for tests: maps exact URLs to canned responses and
/// counts every call, so coalescing and fail-fast behavior are observable.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    pub enum MockOutcome {
        Body {
            content_type: String,
            bytes: Bytes,
        },
        Error(fn(&str) -> FetchError),
    }

    #[derive(Default)]
    pub struct MockFetcher {
        routes: Mutex<HashMap<String, Arc<MockOutcome>>>,
        calls: AtomicU64,
        log: Mutex<Vec<String>>,
        /// Artificial per-fetch delay, for coalescing tests
        pub delay: Option<Duration>,
    }

    impl MockFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        /// Add an artificial per-fetch delay, for coalescing tests.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub async fn respond_with(&self, url: &str, content_type: &str, bytes: Bytes) {
            self.routes.lock().await.insert(
                url.to_string(),
                Arc::new(MockOutcome::Body {
                    content_type: content_type.to_string(),
                    bytes,
                }),
            );
        }

        pub async fn fail_with(&self, url: &str, make: fn(&str) -> FetchError) {
            self.routes
                .lock()
                .await
                .insert(url.to_string(), Arc::new(MockOutcome::Error(make)));
        }

        pub fn call_count(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }

        pub async fn requested_urls(&self) -> Vec<String> {
            self.log.lock().await.clone()
        }
    }

    #[async_trait]
    impl AssetFetcher for MockFetcher {
        async fn fetch(&self, url: &str, _timeout: Duration) -> FetchResult<FetchedResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().await.push(url.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let outcome = self.routes.lock().await.get(url).cloned();
            match outcome.as_deref() {
                Some(MockOutcome::Body {
                    content_type,
                    bytes,
                }) => Ok(FetchedResponse {
                    final_url: url.to_string(),
                    content_type: Some(content_type.clone()),
                    content_length: Some(bytes.len() as u64),
                    stream: futures::stream::iter(vec![Ok(bytes.clone())]).boxed(),
                }),
                Some(MockOutcome::Error(make)) => Err(make(url)),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockFetcher;
    use super::*;

    #[tokio::test]
    async fn into_bytes_respects_cap() {
        let fetcher = MockFetcher::new();
        fetcher
            .respond_with("https://a.example/x", "image/png", Bytes::from(vec![0u8; 2048]))
            .await;

        let response = fetcher
            .fetch("https://a.example/x", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(
            response.into_bytes(1024).await,
            Err(FetchError::InvalidAsset { .. })
        ));

        let response = fetcher
            .fetch("https://a.example/x", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.into_bytes(4096).await.unwrap().len(), 2048);
    }

    #[tokio::test]
    async fn unrouted_urls_return_http_404() {
        let fetcher = MockFetcher::new();
        let Err(err) = fetcher
            .fetch("https://missing.example/icon.png", Duration::from_secs(1))
            .await
        else {
            panic!("expected an error for an unrouted url");
        };
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(fetcher.call_count(), 1);
    }
}
