use std::sync::Arc;
use std::time::Duration;

use opentelemetry::trace::Span as _;
use opentelemetry::Context;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};

use crate::coordinator::{CaptureCoordinator, CaptureWatchdog};

/// A [`SpanProcessor`] deciding which request captures coverage.
///
/// It only saves coverage; exporting is left to a span processor running
/// [`CodecovExporter`](crate::CodecovExporter). Register this processor
/// *before* the exporting one so coverage is saved by the time the span is
/// queued for export.
#[derive(Debug)]
pub struct CoverageSpanProcessor {
    coordinator: Arc<CaptureCoordinator>,
    watchdog: Option<CaptureWatchdog>,
}

impl CoverageSpanProcessor {
    /// Create a processor driving `coordinator`.
    pub fn new(coordinator: Arc<CaptureCoordinator>) -> Self {
        CoverageSpanProcessor {
            coordinator,
            watchdog: None,
        }
    }

    /// Force-release captures whose span has not ended after `timeout`.
    pub fn with_capture_timeout(mut self, timeout: Duration) -> std::io::Result<Self> {
        self.watchdog = Some(CaptureWatchdog::spawn(self.coordinator.clone(), timeout)?);
        Ok(self)
    }

    /// The coordinator behind this processor.
    pub fn coordinator(&self) -> &Arc<CaptureCoordinator> {
        &self.coordinator
    }
}

impl SpanProcessor for CoverageSpanProcessor {
    fn on_start(&self, span: &mut Span, _cx: &Context) {
        // Unsampled spans never reach an exporter, so their coverage would
        // never be popped.
        if !span.span_context().is_sampled() {
            return;
        }
        let span_id = span.span_context().span_id();
        self.coordinator
            .on_start(span_id, || span.exported_data().map(|data| data.span_kind));
    }

    fn on_end(&self, span: SpanData) {
        self.coordinator.on_end(span.span_context.span_id());
    }

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        if let Some(watchdog) = &self.watchdog {
            watchdog.shutdown();
        }
        Ok(())
    }
}
