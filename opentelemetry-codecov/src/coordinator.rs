//! # Span Coverage Coordinator
//!
//! Coverage counters are process-wide, so only one request at a time can be
//! correlated with them. The coordinator holds a single-slot owner value: the
//! id of the span currently capturing, or `0` when nobody is.
//!
//! ```ascii
//!   on_start(a)  ── slot empty, sampled ──> CAS 0 -> a ──> start capture
//!   on_start(b)  ── slot held ───────────> no-op (b is never profiled)
//!   on_end(b)    ── b != a ──────────────> no-op
//!   on_end(a)    ── a == a ──────────────> stop + save, then clear slot
//! ```
//!
//! Losing the race for the slot is a fast no-op, never a wait. Holding the
//! slot always means the span is tracked: the sampling draw happens before
//! acquisition, and a failed capture start gives the slot back immediately.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use opentelemetry::trace::{SpanId, SpanKind};
use opentelemetry::{otel_debug, otel_warn};

use crate::sampler::CaptureSampler;
use crate::store::CoverageStore;

const EMPTY: u64 = 0;

fn slot_value(span_id: SpanId) -> u64 {
    u64::from_be_bytes(span_id.to_bytes())
}

/// Gates coverage capture to one span at a time.
#[derive(Debug)]
pub struct CaptureCoordinator {
    owner: AtomicU64,
    sampler: CaptureSampler,
    store: Arc<CoverageStore>,
}

impl CaptureCoordinator {
    /// Create a coordinator starting and stopping captures on `store`.
    pub fn new(sampler: CaptureSampler, store: Arc<CoverageStore>) -> Self {
        CaptureCoordinator {
            owner: AtomicU64::new(EMPTY),
            sampler,
            store,
        }
    }

    /// The sampler deciding capture ownership.
    pub fn sampler(&self) -> &CaptureSampler {
        &self.sampler
    }

    /// The store captures are saved into.
    pub fn store(&self) -> &Arc<CoverageStore> {
        &self.store
    }

    /// The span currently owning the capture, if any.
    pub fn owner(&self) -> Option<SpanId> {
        match self.owner.load(Ordering::Acquire) {
            EMPTY => None,
            value => Some(SpanId::from_bytes(value.to_be_bytes())),
        }
    }

    /// Handle a span start. Returns `true` if the span became the capture
    /// owner.
    ///
    /// `kind` is only evaluated when the sampler filters on span kinds and the
    /// slot is free.
    pub fn on_start<F>(&self, span_id: SpanId, kind: F) -> bool
    where
        F: FnOnce() -> Option<SpanKind>,
    {
        let value = slot_value(span_id);
        if value == EMPTY || self.owner.load(Ordering::Acquire) != EMPTY {
            return false;
        }

        let kind = if self.sampler.filters_kinds() {
            kind()
        } else {
            None
        };
        if !self.sampler.should_sample(kind.as_ref()) {
            return false;
        }

        if self
            .owner
            .compare_exchange(EMPTY, value, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another span won the slot between the load and the exchange.
            return false;
        }

        if let Err(err) = self.store.start_capture(span_id) {
            otel_warn!(
                name: "CaptureCoordinator.StartCaptureFailed",
                span_id = span_id.to_string(),
                error = err.to_string()
            );
            self.release(value);
            return false;
        }

        otel_debug!(
            name: "CaptureCoordinator.CaptureOwnerAcquired",
            span_id = span_id.to_string()
        );
        true
    }

    /// Handle a span end. Returns `true` if the span was the capture owner.
    ///
    /// The slot is cleared whether or not the capture could be saved.
    pub fn on_end(&self, span_id: SpanId) -> bool {
        let value = slot_value(span_id);
        if value == EMPTY || self.owner.load(Ordering::Acquire) != value {
            return false;
        }

        if let Err(err) = self.store.stop_and_save(span_id) {
            otel_warn!(
                name: "CaptureCoordinator.StopCaptureFailed",
                span_id = span_id.to_string(),
                error = err.to_string()
            );
        }

        if !self.release(value) {
            // The watchdog gave the slot away while we were stopping, so the
            // sink may already hold another request's counters.
            let _ = self.store.pop(span_id);
            otel_debug!(
                name: "CaptureCoordinator.StaleCaptureDiscarded",
                span_id = span_id.to_string()
            );
        }
        true
    }

    /// Release the slot if `span_id` still holds it, dropping whatever was
    /// saved for it. Used to recover from spans that never end.
    pub fn force_release(&self, span_id: SpanId) -> bool {
        let value = slot_value(span_id);
        if value == EMPTY || !self.release(value) {
            return false;
        }
        let _ = self.store.pop(span_id);
        otel_warn!(
            name: "CaptureCoordinator.CaptureForceReleased",
            span_id = span_id.to_string()
        );
        true
    }

    fn release(&self, value: u64) -> bool {
        self.owner
            .compare_exchange(value, EMPTY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

enum WatchdogMessage {
    Shutdown,
}

/// Background thread releasing captures held for longer than a timeout.
///
/// The watchdog never runs inside the span callbacks. It polls the owner slot
/// and force-releases an owner it has seen continuously for `timeout`.
#[derive(Debug)]
pub struct CaptureWatchdog {
    sender: SyncSender<WatchdogMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CaptureWatchdog {
    /// Spawn a watchdog over `coordinator`.
    pub fn spawn(coordinator: Arc<CaptureCoordinator>, timeout: Duration) -> std::io::Result<Self> {
        let poll_interval = (timeout / 4).max(Duration::from_millis(10));
        let (sender, receiver) = sync_channel(1);

        let handle = thread::Builder::new()
            .name("CodecovCaptureWatchdog".to_string())
            .spawn(move || {
                let mut seen: Option<(SpanId, Instant)> = None;
                loop {
                    match receiver.recv_timeout(poll_interval) {
                        Ok(WatchdogMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            break
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                    }

                    seen = match (coordinator.owner(), seen) {
                        (None, _) => None,
                        (Some(owner), Some((held, since))) if owner == held => {
                            if since.elapsed() >= timeout {
                                coordinator.force_release(owner);
                                None
                            } else {
                                Some((held, since))
                            }
                        }
                        (Some(owner), _) => Some((owner, Instant::now())),
                    };
                }
            })?;

        Ok(CaptureWatchdog {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the thread and wait for it. Calling it again is a no-op.
    pub fn shutdown(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = self.sender.try_send(WatchdogMessage::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
