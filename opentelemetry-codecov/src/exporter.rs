use std::fmt;
use std::sync::Arc;

use opentelemetry::{otel_debug, otel_warn};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{SpanData, SpanExporter};

use crate::error::UploadError;
use crate::mapper::CoverageMapper;
use crate::model::{CodecovPayload, UploadBody, UploadSpan};
use crate::sampler::RateSampler;
use crate::store::CoverageStore;
use crate::uploader::Uploader;

/// Outcome of one export call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportSummary {
    /// Spans uploaded with coverage attached.
    pub tracked: usize,
    /// Spans without coverage selected for upload.
    pub untracked: usize,
    /// Spans without coverage left out of the upload.
    pub dropped: usize,
}

/// Exports finished spans, with any coverage saved for them, to Codecov.
pub struct CodecovExporter {
    store: Arc<CoverageStore>,
    mapper: CoverageMapper,
    uploader: Uploader,
    code: String,
    untracked: RateSampler,
}

impl fmt::Debug for CodecovExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecovExporter")
            .field("uploader", &self.uploader)
            .field("code", &self.code)
            .field("untracked_rate", &self.untracked.rate())
            .finish_non_exhaustive()
    }
}

impl CodecovExporter {
    pub(crate) fn new(
        store: Arc<CoverageStore>,
        mapper: CoverageMapper,
        uploader: Uploader,
        code: String,
        untracked: RateSampler,
    ) -> Self {
        CodecovExporter {
            store,
            mapper,
            uploader,
            code,
            untracked,
        }
    }

    /// Upload `batch`, then remove whatever artifacts the coverage sink left
    /// behind.
    ///
    /// A batch in which every span ends up dropped succeeds without any
    /// network activity.
    pub async fn export_batch(&self, batch: Vec<SpanData>) -> Result<ExportSummary, UploadError> {
        let result = self.upload(batch).await;

        match self.store.purge_artifacts() {
            Ok(0) => {}
            Ok(removed) => {
                otel_debug!(name: "CodecovExporter.ArtifactsPurged", removed = removed);
            }
            Err(err) => {
                otel_warn!(name: "CodecovExporter.PurgeFailed", error = err.to_string());
            }
        }

        result
    }

    async fn upload(&self, batch: Vec<SpanData>) -> Result<ExportSummary, UploadError> {
        let (body, summary) = self.partition(batch)?;
        if body.is_empty() {
            return Ok(summary);
        }

        self.uploader.upload(&self.code, &body).await?;
        otel_debug!(
            name: "CodecovExporter.Uploaded",
            tracked = summary.tracked,
            untracked = summary.untracked,
            dropped = summary.dropped
        );
        Ok(summary)
    }

    fn partition(&self, batch: Vec<SpanData>) -> Result<(UploadBody, ExportSummary), UploadError> {
        let mut body = UploadBody::default();
        let mut summary = ExportSummary::default();

        for span in batch {
            if let Some(payload) = self.coverage_for(&span)? {
                body.spans.push(UploadSpan::new(&span, Some(payload)));
                summary.tracked += 1;
            } else if self.untracked.sample() {
                body.untracked.push(UploadSpan::new(&span, None));
                summary.untracked += 1;
            } else {
                summary.dropped += 1;
            }
        }

        Ok((body, summary))
    }

    fn coverage_for(&self, span: &SpanData) -> Result<Option<CodecovPayload>, UploadError> {
        let span_id = span.span_context.span_id();
        let Some(ranges) = self.store.pop(span_id) else {
            return Ok(None);
        };

        match self.mapper.process(&ranges) {
            Ok(processed) => Ok(Some(CodecovPayload::new(&processed)?)),
            Err(err) => {
                otel_warn!(
                    name: "CodecovExporter.MappingFailed",
                    span_id = span_id.to_string(),
                    error = err.to_string()
                );
                Ok(None)
            }
        }
    }
}

impl SpanExporter for CodecovExporter {
    async fn export(&self, batch: Vec<SpanData>) -> OTelSdkResult {
        self.export_batch(batch).await.map(|_| ()).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::LineIndexCache;
    use crate::sink::CoverageSink;
    use crate::store::tests::{document_for, ScriptedSink};
    use crate::uploader::tests::{MockClient, LOCATION};
    use crate::v8::PathFilter;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use futures_executor::block_on;
    use opentelemetry::trace::{Span as _, SpanKind, Tracer as _, TracerProvider as _};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
    use std::fs;
    use std::path::{Path, PathBuf};

    struct Fixture {
        _tmp: tempfile::TempDir,
        source: PathBuf,
        sink: Arc<ScriptedSink>,
        store: Arc<CoverageStore>,
        client: Arc<MockClient>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let source = tmp.path().join("handler.js");
            fs::write(&source, "abcd\nefgh\nijkl\n").unwrap();
            let sink = Arc::new(ScriptedSink::new(&tmp.path().join("coverage")));
            let store = Arc::new(CoverageStore::new(sink.clone(), PathFilter::default()));
            Fixture {
                _tmp: tmp,
                source,
                sink,
                store,
                client: Arc::new(MockClient::default()),
            }
        }

        fn exporter(&self, untracked_rate: f64) -> CodecovExporter {
            CodecovExporter::new(
                self.store.clone(),
                CoverageMapper::new(Arc::new(LineIndexCache::new()))
                    .with_source_root(self.source.parent().unwrap()),
                Uploader::new(self.client.clone(), "https://api.codecov.test", "token"),
                "run-1".to_string(),
                RateSampler::new(untracked_rate),
            )
        }

        fn capture(&self, span: &SpanData, path: &Path) {
            let span_id = span.span_context.span_id();
            self.store.start_capture(span_id).unwrap();
            self.sink
                .set_document(document_for(path, &[(0, 14, 1), (5, 9, 7)]));
            self.store.stop_and_save(span_id).unwrap();
        }
    }

    fn finished_spans(count: usize) -> Vec<SpanData> {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = provider.tracer("codecov-test");
        for i in 0..count {
            tracer
                .span_builder(format!("GET /items/{i}"))
                .with_kind(SpanKind::Server)
                .start(&tracer)
                .end();
        }
        exporter.get_finished_spans().unwrap()
    }

    fn put_body(client: &MockClient) -> serde_json::Value {
        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        serde_json::from_slice(requests[1].body()).unwrap()
    }

    #[test]
    fn empty_batch_makes_no_requests() {
        let fixture = Fixture::new();
        let summary = block_on(fixture.exporter(1.0).export_batch(Vec::new())).unwrap();
        assert_eq!(summary, ExportSummary::default());
        assert!(fixture.client.requests().is_empty());
    }

    #[test]
    fn spans_without_coverage_are_dropped_at_rate_zero() {
        let fixture = Fixture::new();
        let summary = block_on(fixture.exporter(0.0).export_batch(finished_spans(3))).unwrap();
        assert_eq!(
            summary,
            ExportSummary {
                tracked: 0,
                untracked: 0,
                dropped: 3
            }
        );
        assert!(fixture.client.requests().is_empty());
    }

    #[test]
    fn tracked_and_untracked_spans_are_split() {
        let fixture = Fixture::new();
        fixture.client.respond(200, LOCATION).respond(200, "");
        let spans = finished_spans(2);
        fixture.capture(&spans[0], &fixture.source);

        let summary = block_on(fixture.exporter(1.0).export_batch(spans.clone())).unwrap();
        assert_eq!(
            summary,
            ExportSummary {
                tracked: 1,
                untracked: 1,
                dropped: 0
            }
        );

        let body = put_body(&fixture.client);
        let tracked = &body["spans"][0];
        assert_eq!(
            tracked["spanId"],
            spans[0].span_context.span_id().to_string()
        );
        assert_eq!(tracked["kind"], "SERVER");
        assert_eq!(tracked["codecov"]["type"], "bytes");

        let decoded = STANDARD
            .decode(tracked["codecov"]["coverage"].as_str().unwrap())
            .unwrap();
        let coverage: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(
            coverage,
            serde_json::json!({"coverage": {"handler.js": {"1": 1, "2": 7, "3": 1}}})
        );

        let untracked = &body["untracked"][0];
        assert_eq!(
            untracked["spanId"],
            spans[1].span_context.span_id().to_string()
        );
        assert!(untracked.get("codecov").is_none());
    }

    #[test]
    fn unreadable_source_exports_span_without_coverage() {
        let fixture = Fixture::new();
        let spans = finished_spans(1);
        let missing = fixture.source.with_file_name("deleted.js");
        fixture.capture(&spans[0], &missing);

        let summary = block_on(fixture.exporter(0.0).export_batch(spans)).unwrap();
        assert_eq!(summary.tracked, 0);
        assert_eq!(summary.dropped, 1);
        assert_eq!(fixture.store.pending(), 0);
    }

    #[test]
    fn artifacts_are_purged_even_when_upload_fails() {
        let fixture = Fixture::new();
        fixture.client.respond(403, "forbidden");
        fixture.sink.flush().unwrap();
        let artifacts = fixture.sink.artifact_dir().to_path_buf();
        assert_eq!(fs::read_dir(&artifacts).unwrap().count(), 1);

        let err = block_on(fixture.exporter(1.0).export_batch(finished_spans(1))).unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(fs::read_dir(&artifacts).unwrap().count(), 0);
    }

    #[test]
    fn sdk_export_reports_failures_as_results() {
        let fixture = Fixture::new();
        fixture.client.fail("dns error");

        let result = block_on(SpanExporter::export(
            &fixture.exporter(1.0),
            finished_spans(1),
        ));
        match result {
            Err(opentelemetry_sdk::error::OTelSdkError::InternalFailure(message)) => {
                assert!(message.contains("(retryable)"), "{message}");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
