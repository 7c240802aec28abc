//! Chunked byte sources for acquisition
//!
//! A [`Fetcher`] opens a URL and hands back a stream of chunks so the
//! pipeline can report byte-level progress and check cancellation between
//! chunks. Local files are read through the same [`FetchResponse`] shape.

use crate::error::AcquisitionError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Stream of encoded byte chunks
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, AcquisitionError>>;

/// Opened transfer
pub struct FetchResponse {
    /// Total size when the source announces it
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub chunks: ChunkStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Remote byte source
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Start a transfer
    ///
    /// # Errors
    /// - `Network` for transport failures and timeouts
    /// - `Server` / `NotFound` for unsuccessful HTTP statuses
    async fn open(&self, url: &str) -> Result<FetchResponse, AcquisitionError>;
}

/// HTTP(S) fetcher backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

const USER_AGENT: &str = concat!("clipdeck/", env!("CARGO_PKG_VERSION"));

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, AcquisitionError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AcquisitionError::internal(e.to_string()))?;
        Ok(Self { client })
    }
}

fn transport_error(err: reqwest::Error) -> AcquisitionError {
    if let Some(status) = err.status() {
        return AcquisitionError::from_status(status.as_u16(), err.to_string());
    }
    if err.is_builder() {
        return AcquisitionError::validation(err.to_string());
    }
    AcquisitionError::network(err.to_string())
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn open(&self, url: &str) -> Result<FetchResponse, AcquisitionError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AcquisitionError::from_status(
                status.as_u16(),
                format!("{} returned {}", url, status),
            ));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(FetchResponse {
            content_length: response.content_length(),
            content_type,
            chunks: response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()).map_err(transport_error))
                .boxed(),
        })
    }
}

/// Read a local file in `chunk_size` pieces
pub async fn open_local(path: &Path, chunk_size: usize) -> Result<FetchResponse, AcquisitionError> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AcquisitionError::not_found(format!("{}: {}", path.display(), e))
        } else {
            AcquisitionError::internal(format!("{}: {}", path.display(), e))
        }
    })?;
    let content_length = file.metadata().await.ok().map(|m| m.len());
    let chunk_size = chunk_size.max(1);

    let chunks = stream::unfold(Some(file), move |state| async move {
        let mut file = state?;
        let mut chunk = vec![0u8; chunk_size];
        match file.read(&mut chunk).await {
            Ok(0) => None,
            Ok(n) => {
                chunk.truncate(n);
                Some((Ok(chunk), Some(file)))
            }
            Err(e) => Some((Err(AcquisitionError::internal(e.to_string())), None)),
        }
    })
    .boxed();

    Ok(FetchResponse {
        content_length,
        content_type: None,
        chunks,
    })
}
