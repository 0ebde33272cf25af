//! # OpenTelemetry Codecov Exporter
//!
//! Correlates the code executed while serving a request with the span of
//! that request, and uploads both to Codecov so the backend can tell which
//! lines real traffic actually runs.
//!
//! Coverage counters of a runtime are process-wide. Every so often one span
//! is elected capture owner: the counters are reset when it starts and
//! flushed into an artifact when it ends, so the artifact holds exactly the
//! code run during that request. The exporter maps the artifact's byte ranges
//! onto source lines and attaches them to the span before uploading.
//!
//! ```ascii
//!   span start ──> CoverageSpanProcessor ──> CaptureCoordinator ──> CoverageStore.start_capture
//!   span end   ──> CoverageSpanProcessor ──> CaptureCoordinator ──> CoverageStore.stop_and_save
//!   export     ──> CodecovExporter ──> CoverageStore.pop ──> CoverageMapper ──> upload
//! ```
//!
//! ## Quickstart
//!
//! ```no_run
//! use opentelemetry::trace::{Tracer, TracerProvider as _};
//! use opentelemetry_codecov::{CodecovConfig, DirectorySink};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
//!     let config = CodecovConfig::from_env()
//!         .with_repository_token("repository-token")
//!         .with_code("build-1234")
//!         .with_sample_rate(0.05)?;
//!
//!     let provider = opentelemetry_codecov::new_pipeline()
//!         .with_config(config)
//!         // Whatever makes the runtime write its counters out.
//!         .with_coverage_sink(DirectorySink::new("/tmp/coverage", || Ok(())))
//!         .install_batch()?;
//!
//!     provider.tracer("my-service").in_span("GET /users", |_cx| {
//!         // Request handling here...
//!     });
//!
//!     provider.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! [`new_pipeline`] starts from [`CodecovConfig::from_env`], which reads:
//!
//! | variable | meaning | default |
//! |---|---|---|
//! | `CODECOV_REPOSITORY_TOKEN` | upload token | required |
//! | `CODECOV_SAMPLE_RATE` | probability a span captures coverage | `0.1` |
//! | `CODECOV_UNTRACKED_EXPORT_RATE` | probability a span without coverage is uploaded | `0.0` |
//! | `CODECOV_ENDPOINT` | API base or hostname | `https://api.codecov.io` |
//! | `CODECOV_CODE` | build or run identifier | empty |
//! | `CODECOV_ENVIRONMENT` | deployment environment | unset |
//! | `CODECOV_VERSION_IDENTIFIER` | version announced at startup | unset |
//! | `CODECOV_ALLOWED_SPAN_KINDS` | comma separated span kinds allowed to capture | all |
//! | `CODECOV_EXPORT_TIMEOUT` | upload timeout in milliseconds | `10000` |
//! | `CODECOV_CAPTURE_TIMEOUT` | release a capture after this many milliseconds | never |
//! | `CODECOV_COVERAGE_DIR` | coverage artifact directory, else `NODE_V8_COVERAGE` | unset |
//!
//! ## Wiring by hand
//!
//! [`CodecovPipelineBuilder::build`] hands out the [`CoverageSpanProcessor`]
//! and the [`CodecovExporter`] separately. Register the processor *before*
//! whatever processor runs the exporter.
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod client;
mod config;
mod coordinator;
mod error;
mod exporter;
mod mapper;
mod model;
mod pipeline;
mod processor;
mod sampler;
mod sink;
mod store;
mod uploader;
mod v8;

#[cfg(feature = "reqwest-blocking-client")]
pub use client::BlockingReqwestClient;
#[cfg(feature = "reqwest-client")]
pub use client::ReqwestClient;
pub use config::CodecovConfig;
pub use coordinator::{CaptureCoordinator, CaptureWatchdog};
pub use error::{CaptureError, Error, MappingError, UploadError};
pub use exporter::{CodecovExporter, ExportSummary};
pub use mapper::{CoverageMapper, LineIndexCache, ProcessedCoverage};
pub use pipeline::{new_pipeline, CodecovPipeline, CodecovPipelineBuilder};
pub use processor::CoverageSpanProcessor;
pub use sampler::{CaptureSampler, RateSampler};
pub use sink::{CoverageSink, DirectorySink};
pub use store::{CoverageStore, DEFAULT_MAX_PENDING};
pub use v8::{parse_document, PathFilter, RawCoverageRange, DEFAULT_DEPENDENCY_DIRS};
