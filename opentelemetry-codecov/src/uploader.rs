//! # Codecov upload protocol
//!
//! Uploads happen in two phases. First the run is announced to the API, which
//! answers with a one-time, pre-signed storage location; then the batch is
//! written there.
//!
//! ```ascii
//!   POST {endpoint}/profiling/uploads   {"profiling": code}   ──> {"raw_upload_location": url}
//!   PUT  {raw_upload_location}          {"spans": [..], "untracked": [..]}
//! ```
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{Method, Request, Response, Uri};
use opentelemetry::otel_debug;
use opentelemetry_http::HttpClient;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;
use crate::model::UploadBody;

const UPLOADS_PATH: &str = "/profiling/uploads";
const VERSIONS_PATH: &str = "/profiling/versions";

#[derive(Serialize)]
struct UploadRequest<'a> {
    profiling: &'a str,
}

#[derive(Deserialize)]
struct UploadLocation {
    raw_upload_location: String,
}

/// Body of the startup version registration.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct VersionRequest<'a> {
    pub(crate) version_identifier: &'a str,
    pub(crate) environment: &'a str,
    pub(crate) code: &'a str,
}

#[derive(Clone)]
pub(crate) struct Uploader {
    client: Arc<dyn HttpClient>,
    endpoint: String,
    repository_token: String,
}

impl fmt::Debug for Uploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uploader")
            .field("client", &self.client)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// `endpoint` is the API base, e.g. `https://api.codecov.io`.
    pub(crate) fn new(
        client: Arc<dyn HttpClient>,
        endpoint: impl Into<String>,
        repository_token: impl Into<String>,
    ) -> Self {
        let endpoint: String = endpoint.into();
        Uploader {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            repository_token: repository_token.into(),
        }
    }

    /// Run both upload phases for `body`.
    pub(crate) async fn upload(&self, code: &str, body: &UploadBody) -> Result<(), UploadError> {
        let location = self.request_location(code).await?;
        otel_debug!(name: "Uploader.LocationReceived");

        let request = Request::builder()
            .method(Method::PUT)
            .uri(location)
            .header(CONTENT_TYPE, "application/json")
            .body(Bytes::from(serde_json::to_vec(body)?))?;
        self.send(request).await?;
        Ok(())
    }

    /// Announce a deployed version of the code.
    pub(crate) async fn register_version(
        &self,
        version: &VersionRequest<'_>,
    ) -> Result<(), UploadError> {
        let request = self.api_request(VERSIONS_PATH, serde_json::to_vec(version)?)?;
        self.send(request).await?;
        Ok(())
    }

    async fn request_location(&self, code: &str) -> Result<Uri, UploadError> {
        let request = self.api_request(
            UPLOADS_PATH,
            serde_json::to_vec(&UploadRequest { profiling: code })?,
        )?;
        let response = self.send(request).await?;

        let location: UploadLocation = serde_json::from_slice(response.body())
            .map_err(|err| UploadError::MalformedResponse(err.to_string()))?;
        location
            .raw_upload_location
            .parse()
            .map_err(|err: http::uri::InvalidUri| UploadError::MalformedResponse(err.to_string()))
    }

    fn api_request(&self, path: &str, body: Vec<u8>) -> Result<Request<Bytes>, UploadError> {
        Ok(Request::builder()
            .method(Method::POST)
            .uri(format!("{}{}", self.endpoint, path))
            .header(CONTENT_TYPE, "application/json")
            .header(
                AUTHORIZATION,
                format!("Repotoken {}", self.repository_token),
            )
            .body(Bytes::from(body))?)
    }

    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, UploadError> {
        let method = request.method().clone();
        let response = self
            .client
            .send_bytes(request)
            .await
            .map_err(UploadError::Transport)?;

        if !response.status().is_success() {
            otel_debug!(
                name: "Uploader.RequestRejected",
                method = method.to_string(),
                status = response.status().as_u16()
            );
            return Err(UploadError::Protocol {
                status: response.status(),
                body: String::from_utf8_lossy(response.body()).into_owned(),
            });
        }
        Ok(response)
    }
}
