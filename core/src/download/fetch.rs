//! Network seam used by the download coordinator.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Why a fetch produced no image bytes.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server responded with status {0}")]
    Status(StatusCode),
    #[error("response body was empty")]
    EmptyBody,
}

/// Source of image bytes for absolute URIs.
///
/// Implementations must be safe to share between download tasks. Any error is treated as a miss by
/// the caller; nothing is retried.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self, uri: &Url) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

impl<T: Fetcher> Fetcher for Arc<T> {
    fn fetch(&self, uri: &Url) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        (**self).fetch(uri)
    }
}

/// [`Fetcher`] issuing plain HTTP GET requests.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Build a client with the given per-request timeout and user agent.
    pub fn new(timeout: Duration, user_agent: &str) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Reuse an existing client, e.g. one shared with the rest of an application.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, uri: &Url) -> Result<Vec<u8>, FetchError> {
        debug!(target: "download::http", url = %uri, "fetching");

        let response = self.client.get(uri.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(target: "download::http", status = %status, url = %uri, "unexpected status");
            return Err(FetchError::Status(status));
        }

        let data = response.bytes().await?.to_vec();
        if data.is_empty() {
            return Err(FetchError::EmptyBody);
        }

        debug!(target: "download::http", size = data.len(), url = %uri, "fetched");
        Ok(data)
    }
}
