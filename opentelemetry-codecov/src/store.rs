//! # Coverage Store
//!
//! Wraps the coverage sink into a start / stop / pop API keyed by span id.
//!
//! A capture is the window between [`CoverageStore::start_capture`] and
//! [`CoverageStore::stop_and_save`]. Starting flushes the sink and throws the
//! result away so counters start from zero; stopping flushes again and must
//! find exactly one new artifact, which is the delta of the request.
//!
//! Only the capture owner (see [`CaptureCoordinator`]) starts and stops
//! captures. The pending map is shared with the exporter, which pops entries
//! for other span ids concurrently.
//!
//! A saved capture whose span never reaches the exporter (the export queue
//! was full, or the exporter was shut down first) is never popped. The map
//! therefore holds at most [`DEFAULT_MAX_PENDING`] entries, dropping the
//! oldest one to make room.
//!
//! [`CaptureCoordinator`]: crate::CaptureCoordinator
use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use opentelemetry::otel_debug;
use opentelemetry::trace::SpanId;

use crate::error::CaptureError;
use crate::sink::{self, CoverageSink};
use crate::v8::{self, PathFilter, RawCoverageRange};

/// Default bound on captures waiting for export.
pub const DEFAULT_MAX_PENDING: usize = 1024;

#[derive(Debug, Default)]
struct Pending {
    entries: HashMap<SpanId, (u64, Vec<RawCoverageRange>)>,
    next_seq: u64,
}

impl Pending {
    /// Insert under `span_id`, evicting the oldest entries beyond `max`.
    /// Returns the span ids evicted.
    fn insert(
        &mut self,
        span_id: SpanId,
        ranges: Vec<RawCoverageRange>,
        max: usize,
    ) -> Vec<SpanId> {
        let mut evicted = Vec::new();
        self.entries.remove(&span_id);
        while !self.entries.is_empty() && self.entries.len() >= max {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (seq, _))| *seq)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    self.entries.remove(&id);
                    evicted.push(id);
                }
                None => break,
            }
        }
        if max > 0 {
            self.entries.insert(span_id, (self.next_seq, ranges));
            self.next_seq += 1;
        }
        evicted
    }
}

/// Raw coverage of the requests that have ended but are not exported yet.
#[derive(Debug)]
pub struct CoverageStore {
    sink: Arc<dyn CoverageSink>,
    filter: PathFilter,
    max_pending: usize,
    pending: Mutex<Pending>,
    // Held while a capture flushes and reads the sink directory.
    capture: Mutex<()>,
}

impl CoverageStore {
    /// Create a store over `sink`, keeping only sources accepted by `filter`.
    pub fn new(sink: Arc<dyn CoverageSink>, filter: PathFilter) -> Self {
        CoverageStore {
            sink,
            filter,
            max_pending: DEFAULT_MAX_PENDING,
            pending: Mutex::new(Pending::default()),
            capture: Mutex::new(()),
        }
    }

    /// Keep at most `max` saved captures waiting for export. Zero disables
    /// saving altogether.
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    /// Reset the sink so the next [`stop_and_save`](Self::stop_and_save)
    /// only sees what executes from now on.
    pub fn start_capture(&self, span_id: SpanId) -> Result<(), CaptureError> {
        let _capture = self.lock_capture();
        self.sink.flush()?;
        let discarded = sink::remove_artifacts(self.sink.artifact_dir())?;
        otel_debug!(
            name: "CoverageStore.CaptureStarted",
            span_id = span_id.to_string(),
            discarded_artifacts = discarded
        );
        Ok(())
    }

    /// Flush the sink, parse the single new artifact and keep its ranges
    /// under `span_id`. Returns the number of ranges saved.
    ///
    /// Nothing is stored when the flush did not produce exactly one artifact.
    pub fn stop_and_save(&self, span_id: SpanId) -> Result<usize, CaptureError> {
        let _capture = self.lock_capture();
        let dir = self.sink.artifact_dir();
        let before = sink::list_artifacts(dir)?;
        self.sink.flush()?;
        let after = sink::list_artifacts(dir)?;

        let mut fresh = after.difference(&before);
        let artifact = match (fresh.next(), fresh.next()) {
            (Some(artifact), None) => artifact,
            _ => {
                return Err(CaptureError::Integrity {
                    found: after.difference(&before).count(),
                })
            }
        };

        let parsed = v8::read_artifact(artifact, &self.filter);
        // The artifact belongs to this capture whatever its content; leave a
        // clean directory for the next one.
        match fs::remove_file(artifact) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let ranges = parsed?;
        let saved = ranges.len();

        let evicted = self
            .lock_pending()
            .insert(span_id, ranges, self.max_pending);
        for id in evicted {
            otel_debug!(
                name: "CoverageStore.PendingEvicted",
                span_id = id.to_string(),
                max_pending = self.max_pending
            );
        }
        otel_debug!(
            name: "CoverageStore.CaptureSaved",
            span_id = span_id.to_string(),
            ranges = saved
        );
        Ok(saved)
    }

    /// Remove and return the coverage saved for `span_id`, if any.
    pub fn pop(&self, span_id: SpanId) -> Option<Vec<RawCoverageRange>> {
        self.lock_pending()
            .entries
            .remove(&span_id)
            .map(|(_, ranges)| ranges)
    }

    /// Number of captures waiting to be exported.
    pub fn pending(&self) -> usize {
        self.lock_pending().entries.len()
    }

    /// Delete every artifact left in the sink directory.
    ///
    /// Does nothing while a capture is flushing, since its artifact is not
    /// read yet. Returns the number of artifacts removed.
    pub fn purge_artifacts(&self) -> io::Result<usize> {
        let _capture = match self.capture.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                otel_debug!(name: "CoverageStore.PurgeSkipped");
                return Ok(0);
            }
        };
        sink::remove_artifacts(self.sink.artifact_dir())
    }

    fn lock_capture(&self) -> MutexGuard<'_, ()> {
        self.capture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        // The map stays consistent across a panicking holder: every critical
        // section is a single insert or remove.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
