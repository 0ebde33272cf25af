use std::io;
use std::path::PathBuf;

use opentelemetry_http::HttpError;
use opentelemetry_sdk::error::OTelSdkError;

/// Errors raised while configuring or installing the codecov pipeline.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No http client implementation found. User should provide one or enable features.
    #[error("http client must be set, users can enable the reqwest features to use an http client implementation within the crate")]
    NoHttpClient,

    /// No coverage sink configured.
    #[error("a coverage sink must be set, either explicitly or through CODECOV_COVERAGE_DIR")]
    NoCoverageSink,

    /// The endpoint provided is invalid.
    #[error("invalid endpoint uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// A sampling rate was not a number.
    #[error("invalid rate for {name}: {value}")]
    InvalidRate {
        /// Configuration field the rate was given for.
        name: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// Uploading requires a repository token.
    #[error("a repository token is required to upload coverage")]
    MissingRepositoryToken,

    /// The capture timeout thread could not be started.
    #[error("failed to spawn the capture watchdog: {0}")]
    WatchdogSpawn(#[source] io::Error),
}

/// Failure to turn a coverage sink flush into a per-request coverage delta.
///
/// These never leave the span processor: the request is exported without
/// coverage.
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    /// A stop found zero or several new artifacts instead of exactly one.
    #[error("expected exactly one new coverage artifact, found {found}")]
    Integrity {
        /// Number of artifacts that appeared during the flush.
        found: usize,
    },

    /// Listing, flushing, reading or removing artifacts failed.
    #[error("coverage sink i/o failed: {0}")]
    Io(#[from] io::Error),

    /// The artifact was not a readable coverage document.
    #[error("malformed coverage artifact {path}: {source}")]
    Malformed {
        /// The offending artifact.
        path: PathBuf,
        /// Parser failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Failure to map byte ranges onto source lines.
#[derive(thiserror::Error, Debug)]
pub enum MappingError {
    /// A source file referenced by coverage could not be read.
    #[error("cannot read source file {path}: {source}")]
    FileAccess {
        /// The source file.
        path: PathBuf,
        /// Underlying i/o failure.
        #[source]
        source: io::Error,
    },
}

/// Failure of either phase of the upload.
#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    /// Network, DNS, TLS or timeout failure. Retrying the export may succeed.
    #[error("upload transport failed: {0}")]
    Transport(#[source] HttpError),

    /// The backend answered with a non-success status.
    #[error("upload rejected with status {status}: {body}")]
    Protocol {
        /// Status returned by the backend.
        status: http::StatusCode,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The backend answered 2xx but without a usable upload location.
    #[error("unusable upload response: {0}")]
    MalformedResponse(String),

    /// The request could not be built.
    #[error("failed to build upload request: {0}")]
    Request(#[from] http::Error),

    /// The batch could not be serialized.
    #[error("failed to serialize upload body: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UploadError {
    /// Whether retrying the whole export may succeed.
    ///
    /// Only transport failures are retryable; anything the backend actively
    /// rejected most likely points at bad credentials or configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Transport(_))
    }
}

impl From<UploadError> for OTelSdkError {
    fn from(err: UploadError) -> Self {
        let kind = if err.is_retryable() {
            "retryable"
        } else {
            "not retryable"
        };
        OTelSdkError::InternalFailure(format!("codecov export failed ({kind}): {err}"))
    }
}
