//! [`HttpClient`] implementations for the Codecov uploader.
//!
//! Unlike the clients shipped with `opentelemetry-http`, these hand non-2xx
//! responses back unchanged, so a rejected upload can be told apart from one
//! that never reached the server.
#![cfg_attr(
    not(any(feature = "reqwest-blocking-client", feature = "reqwest-client")),
    allow(unused_imports)
)]
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use opentelemetry::otel_debug;
use opentelemetry_http::{HttpClient, HttpError};

/// Blocking reqwest client, usable from the batch span processor's own thread.
#[cfg(feature = "reqwest-blocking-client")]
#[derive(Clone, Debug)]
pub struct BlockingReqwestClient {
    inner: reqwest::blocking::Client,
}

#[cfg(feature = "reqwest-blocking-client")]
impl BlockingReqwestClient {
    /// Build a client whose requests time out after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(BlockingReqwestClient {
            inner: reqwest::blocking::Client::builder()
                .timeout(timeout)
                .build()?,
        })
    }
}

#[cfg(feature = "reqwest-blocking-client")]
impl From<reqwest::blocking::Client> for BlockingReqwestClient {
    fn from(inner: reqwest::blocking::Client) -> Self {
        BlockingReqwestClient { inner }
    }
}

#[cfg(feature = "reqwest-blocking-client")]
#[async_trait]
impl HttpClient for BlockingReqwestClient {
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        otel_debug!(name: "BlockingReqwestClient.Send");
        let request = request.try_into()?;
        let mut response = self.inner.execute(request)?;
        let headers = std::mem::take(response.headers_mut());
        let mut http_response = Response::builder()
            .status(response.status())
            .body(response.bytes()?)?;
        *http_response.headers_mut() = headers;

        Ok(http_response)
    }
}

/// Async reqwest client. Needs a tokio runtime around the export call.
#[cfg(feature = "reqwest-client")]
#[derive(Clone, Debug)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

#[cfg(feature = "reqwest-client")]
impl ReqwestClient {
    /// Build a client whose requests time out after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(ReqwestClient {
            inner: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[cfg(feature = "reqwest-client")]
impl From<reqwest::Client> for ReqwestClient {
    fn from(inner: reqwest::Client) -> Self {
        ReqwestClient { inner }
    }
}

#[cfg(feature = "reqwest-client")]
#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        otel_debug!(name: "ReqwestClient.Send");
        let request = request.try_into()?;
        let mut response = self.inner.execute(request).await?;
        let headers = std::mem::take(response.headers_mut());
        let mut http_response = Response::builder()
            .status(response.status())
            .body(response.bytes().await?)?;
        *http_response.headers_mut() = headers;

        Ok(http_response)
    }
}

/// The client used when none is configured explicitly.
#[allow(unreachable_code)]
pub(crate) fn default_client(timeout: Duration) -> Option<std::sync::Arc<dyn HttpClient>> {
    #[cfg(feature = "reqwest-blocking-client")]
    {
        return BlockingReqwestClient::with_timeout(timeout)
            .ok()
            .map(|client| std::sync::Arc::new(client) as std::sync::Arc<dyn HttpClient>);
    }
    #[cfg(feature = "reqwest-client")]
    {
        return ReqwestClient::with_timeout(timeout)
            .ok()
            .map(|client| std::sync::Arc::new(client) as std::sync::Arc<dyn HttpClient>);
    }
    let _ = timeout;
    None
}
