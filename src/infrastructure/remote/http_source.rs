//! JSON documents fetched over HTTP.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::domain::ports::BusinessSource;

/// Failure of an HTTP fetch.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The request could not be sent or the body not read.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("{url} answered {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// Response status.
        status: StatusCode,
    },
}

/// Business source fetching `V` as JSON; the parameter is the document URL.
pub struct HttpJsonSource<V> {
    client: Client,
    _value: PhantomData<fn() -> V>,
}

impl<V> HttpJsonSource<V> {
    /// Creates a source with its own HTTP client.
    ///
    /// # Errors
    /// Returns error if HTTP client creation fails.
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Creates a source sharing an existing client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self {
            client,
            _value: PhantomData,
        }
    }
}

#[async_trait]
impl<V> BusinessSource for HttpJsonSource<V>
where
    V: Serialize + DeserializeOwned + Send + 'static,
{
    type Parameter = String;
    type Value = V;
    type FetchError = RemoteError;
    type ParseError = serde_json::Error;

    fn compute_uri(&self, url: &String) -> String {
        url.clone()
    }

    async fn fetch(&self, url: &String) -> Result<Bytes, RemoteError> {
        debug!(url = %url, "Fetching document");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                url: url.clone(),
                status,
            });
        }
        Ok(response.bytes().await?)
    }

    fn parse(&self, _url: &String, bytes: &[u8]) -> Result<V, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    fn serialize(&self, value: &V) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(value).map(Bytes::from)
    }
}
