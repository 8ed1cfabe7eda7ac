//! Snapshot store served over HTTP(S), e.g. a public S3/R2 bucket.

use super::{ByteStream, SnapshotStore, INDEX_FILE};
use crate::error::StoreError;
use crate::types::{ByteRange, SnapshotMetadata};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, info};

/// Reads `<base>/<prefix>/index.json` and `<base>/<prefix>/<name>`.
#[derive(Debug, Clone)]
pub struct HttpSnapStore {
    client: Client,
    base: Url,
}

impl HttpSnapStore {
    /// Creates a store rooted at `container` (a base URL) and `prefix`.
    pub fn new(container: &str, prefix: &str) -> Result<Self, StoreError> {
        let mut base = format!("{}/", container.trim_end_matches('/'));
        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() {
            base.push_str(prefix);
            base.push('/');
        }
        let base = Url::parse(&base).map_err(|e| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid store URL {}: {}", base, e),
            ))
        })?;
        Ok(Self {
            client: Client::new(),
            base,
        })
    }

    /// URL of an object inside the prefix.
    pub fn object_url(&self, name: &str) -> Result<Url, StoreError> {
        self.base.join(name).map_err(|e| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid object name {}: {}", name, e),
            ))
        })
    }
}

/// Formats a half-open range as an inclusive HTTP `Range` header value.
fn range_header(range: &ByteRange) -> String {
    format!("bytes={}-{}", range.start, range.end.saturating_sub(1))
}

#[async_trait]
impl SnapshotStore for HttpSnapStore {
    async fn list(&self) -> Result<Vec<SnapshotMetadata>, StoreError> {
        let url = self.object_url(INDEX_FILE)?;
        info!("Retrieving snapshot listing from {}", url);

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            // No backup has been taken under this prefix yet.
            debug!("Snapshot listing not found at {}", url);
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get(&self, name: &str, range: Option<ByteRange>) -> Result<ByteStream, StoreError> {
        let url = self.object_url(name)?;
        let mut request = self.client.get(url.clone());
        if let Some(range) = &range {
            request = request.header(RANGE, range_header(range));
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let expected_status = if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        if status != expected_status {
            return Err(StoreError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        // Verify the advertised length before streaming anything
        if let (Some(range), Some(content_length)) = (&range, response.content_length()) {
            let expected = range.end - range.start;
            if content_length != expected {
                return Err(StoreError::LengthMismatch {
                    name: name.to_string(),
                    expected,
                    actual: content_length,
                });
            }
        }

        Ok(response.bytes_stream().map_err(StoreError::Http).boxed())
    }
}
