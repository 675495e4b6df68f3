//! Fetching manifests and artifacts.
//!
//! [`ReleaseTransport`] is the seam between the engine and the network. The
//! production implementation, [`HttpTransport`], speaks HTTP(S) through
//! reqwest and reads `file://` locations (development overrides) from disk.
//!
//! Redirects are followed by hand so the hop limit and the https downgrade
//! check live in one testable place ([`RedirectBudget`], [`next_hop`]).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::LOCATION;
use tokio::io::AsyncReadExt;
use url::Url;

use crate::config::NetworkConfig;
use crate::error::UpdateError;

/// Maximum number of redirects followed for one request.
pub const MAX_REDIRECTS: usize = 5;

/// Chunk size for reading local files.
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Stream of body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, UpdateError>>;

/// An opened artifact transfer.
pub struct Download {
    /// Total size if the source announced it
    pub total: Option<u64>,
    /// Body chunks in order
    pub stream: ByteStream,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download").field("total", &self.total).finish_non_exhaustive()
    }
}

/// Source of release bytes.
#[async_trait]
pub trait ReleaseTransport: Send + Sync {
    /// Fetch a small document (the manifest) into memory.
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, UpdateError>;

    /// Open a potentially large artifact for streaming.
    async fn open(&self, url: &Url) -> Result<Download, UpdateError>;
}

/// Counts redirect hops for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectBudget {
    hops: usize,
    max: usize,
}

impl Default for RedirectBudget {
    fn default() -> Self {
        Self::new(MAX_REDIRECTS)
    }
}

impl RedirectBudget {
    pub fn new(max: usize) -> Self {
        Self { hops: 0, max }
    }

    /// Record one more redirect starting from `origin`.
    pub fn follow(&mut self, origin: &Url) -> Result<(), UpdateError> {
        self.hops += 1;
        if self.hops > self.max {
            return Err(UpdateError::TooManyRedirects {
                url: origin.to_string(),
                hops: self.hops,
            });
        }
        Ok(())
    }

    pub fn hops(&self) -> usize {
        self.hops
    }
}

/// Resolve a `Location` header against the current URL.
///
/// A redirect may not leave https.
pub fn next_hop(current: &Url, location: &str) -> Result<Url, UpdateError> {
    let next = current
        .join(location)
        .map_err(|e| UpdateError::transport(current.as_str(), format!("bad redirect location: {e}")))?;
    if current.scheme() == "https" && next.scheme() != "https" {
        return Err(UpdateError::transport(
            current.as_str(),
            format!("refusing redirect to {} URL", next.scheme()),
        ));
    }
    Ok(next)
}

/// HTTP(S) and local file transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    manifest_timeout: Duration,
    download_timeout: Duration,
}

impl HttpTransport {
    pub fn new(network: &NetworkConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(network.connect_timeout())
            .read_timeout(network.read_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(format!("parley-updater/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpdateError::ConfigError(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            manifest_timeout: network.manifest_timeout(),
            download_timeout: network.download_timeout(),
        })
    }

    async fn get(&self, url: &Url, timeout: Duration) -> Result<reqwest::Response, UpdateError> {
        let mut budget = RedirectBudget::default();
        let mut current = url.clone();

        loop {
            tracing::debug!(url = %current, "GET");
            let response = self.client.get(current.clone()).timeout(timeout).send().await?;
            let status = response.status();

            if status.is_redirection() {
                let Some(location) = response.headers().get(LOCATION) else {
                    return Err(UpdateError::HttpStatus {
                        url: current.to_string(),
                        status: status.as_u16(),
                    });
                };
                let location = location.to_str().map_err(|_| {
                    UpdateError::transport(current.as_str(), "redirect location is not valid text")
                })?;
                budget.follow(url)?;
                current = next_hop(&current, location)?;
                continue;
            }

            if !status.is_success() {
                return Err(UpdateError::HttpStatus {
                    url: current.to_string(),
                    status: status.as_u16(),
                });
            }

            if budget.hops() > 0 {
                tracing::debug!(url = %url, hops = budget.hops(), "Followed redirects");
            }
            return Ok(response);
        }
    }
}

#[async_trait]
impl ReleaseTransport for HttpTransport {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, UpdateError> {
        if url.scheme() == "file" {
            let path = local_path(url)?;
            return tokio::fs::read(&path)
                .await
                .map_err(|e| UpdateError::transport(url.as_str(), e.to_string()));
        }

        let response = self.get(url, self.manifest_timeout).await?;
        let bytes = response.bytes().await?;
        tracing::debug!(url = %url, bytes = bytes.len(), "Fetched document");
        Ok(bytes.to_vec())
    }

    async fn open(&self, url: &Url) -> Result<Download, UpdateError> {
        if url.scheme() == "file" {
            return open_local(url).await;
        }

        let response = self.get(url, self.download_timeout).await?;
        Ok(Download {
            total: response.content_length(),
            stream: response.bytes_stream().map_err(UpdateError::from).boxed(),
        })
    }
}

fn local_path(url: &Url) -> Result<std::path::PathBuf, UpdateError> {
    url.to_file_path()
        .map_err(|_| UpdateError::transport(url.as_str(), "not a local file path"))
}

async fn open_local(url: &Url) -> Result<Download, UpdateError> {
    let location = url.to_string();
    let path = local_path(url)?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| UpdateError::transport(location.as_str(), e.to_string()))?;
    let total = file.metadata().await.ok().map(|m| m.len());

    let chunks = stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), file)))
    });

    Ok(Download {
        total,
        stream: chunks
            .map_err(move |e| UpdateError::transport(location.as_str(), e.to_string()))
            .boxed(),
    })
}
