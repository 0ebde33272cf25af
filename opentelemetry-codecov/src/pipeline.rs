use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use http::Uri;
use opentelemetry::{global, otel_info, otel_warn};
use opentelemetry_http::HttpClient;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::client::default_client;
use crate::config::CodecovConfig;
use crate::coordinator::CaptureCoordinator;
use crate::error::Error;
use crate::exporter::CodecovExporter;
use crate::mapper::{CoverageMapper, LineIndexCache};
use crate::processor::CoverageSpanProcessor;
use crate::sampler::{CaptureSampler, RateSampler};
use crate::sink::{CoverageSink, DirectorySink};
use crate::store::{CoverageStore, DEFAULT_MAX_PENDING};
use crate::uploader::{Uploader, VersionRequest};
use crate::v8::PathFilter;

type FlushFn = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

/// Create a new Codecov pipeline builder, configured from the environment.
///
/// The default [`PathFilter`] only drops dependency directories. Whatever
/// instrumentation code runs inside the request (a tracing shim, a
/// middleware written for this exporter) shows up in its coverage too;
/// exclude it with [`PathFilter::with_excluded_fragment`] and
/// [`CodecovPipelineBuilder::with_path_filter`].
pub fn new_pipeline() -> CodecovPipelineBuilder {
    CodecovPipelineBuilder::default()
}

/// Builder wiring a [`CoverageSpanProcessor`] and a [`CodecovExporter`]
/// around one shared coverage store.
pub struct CodecovPipelineBuilder {
    config: CodecovConfig,
    client: Option<Arc<dyn HttpClient>>,
    sink: Option<Arc<dyn CoverageSink>>,
    flush: Option<FlushFn>,
    filter: PathFilter,
    source_root: Option<PathBuf>,
    line_cache: Option<Arc<LineIndexCache>>,
    max_pending: usize,
}

impl Default for CodecovPipelineBuilder {
    fn default() -> Self {
        CodecovPipelineBuilder {
            config: CodecovConfig::from_env(),
            client: None,
            sink: None,
            flush: None,
            filter: PathFilter::default(),
            source_root: None,
            line_cache: None,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl fmt::Debug for CodecovPipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecovPipelineBuilder")
            .field("config", &self.config)
            .field("client", &self.client)
            .field("sink", &self.sink)
            .field("filter", &self.filter)
            .field("source_root", &self.source_root)
            .field("max_pending", &self.max_pending)
            .finish_non_exhaustive()
    }
}

impl CodecovPipelineBuilder {
    /// Replace the configuration read from the environment.
    pub fn with_config(mut self, config: CodecovConfig) -> Self {
        self.config = config;
        self
    }

    /// Assign client implementation
    pub fn with_http_client<T: HttpClient + 'static>(mut self, client: T) -> Self {
        self.client = Some(Arc::new(client));
        self
    }

    /// Use `sink` as the coverage runtime.
    pub fn with_coverage_sink<S: CoverageSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Flush hook of the runtime writing into the configured coverage
    /// directory. Ignored when a sink is set with
    /// [`with_coverage_sink`](Self::with_coverage_sink).
    pub fn with_coverage_flush<F>(mut self, flush: F) -> Self
    where
        F: Fn() -> io::Result<()> + Send + Sync + 'static,
    {
        self.flush = Some(Box::new(flush));
        self
    }

    /// Which coverage paths are reported.
    ///
    /// Replaces the default filter, so keep the dependency directories in
    /// the new one when they should still be dropped.
    pub fn with_path_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Report source files relative to `root`.
    pub fn with_source_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.source_root = Some(root.into());
        self
    }

    /// Share a line index cache between pipelines.
    pub fn with_line_cache(mut self, cache: Arc<LineIndexCache>) -> Self {
        self.line_cache = Some(cache);
        self
    }

    /// Keep at most `max` saved captures waiting for export.
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    /// Build the processor and exporter, registering the version first when
    /// configured to.
    pub fn build(self) -> Result<CodecovPipeline, Error> {
        let config = self.config;
        let client = self
            .client
            .or_else(|| default_client(config.export_timeout))
            .ok_or(Error::NoHttpClient)?;
        let token = config
            .repository_token
            .clone()
            .ok_or(Error::MissingRepositoryToken)?;
        config.endpoint.parse::<Uri>()?;

        let sink = match (self.sink, self.flush, &config.coverage_dir) {
            (Some(sink), _, _) => sink,
            (None, Some(flush), Some(dir)) => {
                Arc::new(DirectorySink::new(dir.clone(), flush)) as Arc<dyn CoverageSink>
            }
            _ => return Err(Error::NoCoverageSink),
        };

        let store =
            Arc::new(CoverageStore::new(sink, self.filter).with_max_pending(self.max_pending));
        let coordinator = Arc::new(CaptureCoordinator::new(
            CaptureSampler::new(config.sample_rate, config.allowed_span_kinds.clone()),
            store.clone(),
        ));
        let mut processor = CoverageSpanProcessor::new(coordinator);
        if let Some(timeout) = config.capture_timeout {
            processor = processor
                .with_capture_timeout(timeout)
                .map_err(Error::WatchdogSpawn)?;
        }

        let mut mapper = CoverageMapper::new(self.line_cache.unwrap_or_default());
        if let Some(root) = self.source_root {
            mapper = mapper.with_source_root(root);
        }

        let uploader = Uploader::new(client, config.endpoint.clone(), token);
        if config.register_version {
            register_version(&uploader, &config);
        }

        let exporter = CodecovExporter::new(
            store,
            mapper,
            uploader,
            config.code.clone(),
            RateSampler::new(config.untracked_export_rate),
        );

        Ok(CodecovPipeline {
            processor,
            exporter,
        })
    }

    /// Install a provider exporting every span as soon as it ends.
    pub fn install_simple(self) -> Result<SdkTracerProvider, Error> {
        let CodecovPipeline {
            processor,
            exporter,
        } = self.build()?;
        let provider = SdkTracerProvider::builder()
            .with_span_processor(processor)
            .with_simple_exporter(exporter)
            .build();
        global::set_tracer_provider(provider.clone());
        Ok(provider)
    }

    /// Install a provider exporting spans in batches from a background
    /// thread.
    pub fn install_batch(self) -> Result<SdkTracerProvider, Error> {
        let CodecovPipeline {
            processor,
            exporter,
        } = self.build()?;
        let provider = SdkTracerProvider::builder()
            .with_span_processor(processor)
            .with_batch_exporter(exporter)
            .build();
        global::set_tracer_provider(provider.clone());
        Ok(provider)
    }
}

/// The two halves of a Codecov pipeline.
///
/// The processor must be registered on the provider before the span
/// processor driving the exporter, so coverage is saved by the time a span
/// reaches the exporter.
#[derive(Debug)]
pub struct CodecovPipeline {
    /// Decides which span captures coverage.
    pub processor: CoverageSpanProcessor,
    /// Uploads spans and their coverage.
    pub exporter: CodecovExporter,
}

fn register_version(uploader: &Uploader, config: &CodecovConfig) {
    let (Some(version_identifier), Some(environment)) =
        (&config.version_identifier, &config.environment)
    else {
        return;
    };
    if config.code.is_empty() {
        return;
    }

    let request = VersionRequest {
        version_identifier,
        environment,
        code: &config.code,
    };
    match futures_executor::block_on(uploader.register_version(&request)) {
        Ok(()) => {
            otel_info!(
                name: "CodecovPipeline.VersionRegistered",
                version = version_identifier.to_string(),
                environment = environment.to_string()
            );
        }
        Err(err) => {
            otel_warn!(
                name: "CodecovPipeline.VersionRegistrationFailed",
                version = version_identifier.to_string(),
                error = err.to_string()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::ScriptedSink;
    use crate::uploader::tests::MockClient;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{Request, Response};
    use opentelemetry_http::HttpError;

    /// Forwards to a shared [`MockClient`] so the test can inspect it.
    #[derive(Debug)]
    struct SharedClient(Arc<MockClient>);

    #[async_trait]
    impl HttpClient for SharedClient {
        async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            self.0.send_bytes(request).await
        }
    }

    fn config() -> CodecovConfig {
        CodecovConfig::default()
            .with_repository_token("token")
            .with_endpoint("https://api.codecov.test")
            .with_code("run-1")
    }

    #[test]
    fn missing_token_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let result = new_pipeline()
            .with_config(CodecovConfig::default())
            .with_http_client(SharedClient(Arc::new(MockClient::default())))
            .with_coverage_sink(ScriptedSink::new(tmp.path()))
            .build();
        assert!(matches!(result, Err(Error::MissingRepositoryToken)));
    }

    #[test]
    fn missing_sink_is_rejected() {
        let result = new_pipeline()
            .with_config(config())
            .with_http_client(SharedClient(Arc::new(MockClient::default())))
            .build();
        assert!(matches!(result, Err(Error::NoCoverageSink)));
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let result = new_pipeline()
            .with_config(config().with_endpoint("https://bad host"))
            .with_http_client(SharedClient(Arc::new(MockClient::default())))
            .with_coverage_sink(ScriptedSink::new(tmp.path()))
            .build();
        assert!(matches!(result, Err(Error::InvalidUri(_))));
    }

    #[test]
    fn flush_hook_uses_the_configured_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = new_pipeline()
            .with_config(config().with_coverage_dir(tmp.path()))
            .with_http_client(SharedClient(Arc::new(MockClient::default())))
            .with_coverage_flush(|| Ok(()))
            .build()
            .unwrap();
        assert!(pipeline.processor.coordinator().owner().is_none());
    }

    #[test]
    fn registers_version_when_fully_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let client = Arc::new(MockClient::default());
        client.respond(500, "unavailable");

        // A failed registration never aborts the build.
        new_pipeline()
            .with_config(
                config()
                    .with_environment("production")
                    .with_version_identifier("v1"),
            )
            .with_http_client(SharedClient(client.clone()))
            .with_coverage_sink(ScriptedSink::new(tmp.path()))
            .build()
            .unwrap();

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].uri().path(), "/profiling/versions");
    }

    #[test]
    fn skips_registration_without_a_version() {
        let tmp = tempfile::tempdir().unwrap();
        let client = Arc::new(MockClient::default());

        new_pipeline()
            .with_config(config().with_environment("production"))
            .with_http_client(SharedClient(client.clone()))
            .with_coverage_sink(ScriptedSink::new(tmp.path()))
            .build()
            .unwrap();
        assert!(client.requests().is_empty());
    }
}
