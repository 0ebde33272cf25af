//! # Coverage sinks
//!
//! A coverage sink is the runtime facility that accumulates execution
//! counters and, when flushed, writes them out as an artifact file into a
//! directory, resetting the counters. The V8 engine behind `NODE_V8_COVERAGE`
//! is the reference example: each `takeCoverage()` writes one JSON document.
//!
//! The crate only ever flushes the sink, enumerates and reads its artifacts,
//! and deletes them.
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// The runtime coverage facility.
pub trait CoverageSink: Send + Sync + fmt::Debug {
    /// Write the counters gathered since the previous flush into a new
    /// artifact inside [`artifact_dir`](CoverageSink::artifact_dir) and reset
    /// them.
    fn flush(&self) -> io::Result<()>;

    /// Directory the artifacts are written to.
    fn artifact_dir(&self) -> &Path;
}

type FlushFn = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

/// A sink backed by a directory and a host-provided flush hook.
///
/// The hook is whatever makes the runtime dump its counters, e.g. a call into
/// an embedded JavaScript engine's `takeCoverage`.
pub struct DirectorySink {
    dir: PathBuf,
    flush: FlushFn,
}

impl DirectorySink {
    /// Create a sink writing into `dir`, flushed by `flush`.
    pub fn new<P, F>(dir: P, flush: F) -> Self
    where
        P: Into<PathBuf>,
        F: Fn() -> io::Result<()> + Send + Sync + 'static,
    {
        DirectorySink {
            dir: dir.into(),
            flush: Box::new(flush),
        }
    }
}

impl fmt::Debug for DirectorySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectorySink")
            .field("dir", &self.dir)
            .finish()
    }
}

impl CoverageSink for DirectorySink {
    fn flush(&self) -> io::Result<()> {
        (self.flush)()
    }

    fn artifact_dir(&self) -> &Path {
        &self.dir
    }
}

/// Regular files currently present in `dir`. A missing directory is empty:
/// runtimes usually create it lazily on the first flush.
pub(crate) fn list_artifacts(dir: &Path) -> io::Result<BTreeSet<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(err),
    };

    let mut artifacts = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            artifacts.insert(entry.path());
        }
    }
    Ok(artifacts)
}

/// Delete every artifact in `dir`, returning how many were removed. Files that
/// disappear concurrently are not an error.
pub(crate) fn remove_artifacts(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for path in list_artifacts(dir)? {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_lists_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = list_artifacts(&tmp.path().join("not-created-yet")).unwrap();
        assert!(artifacts.is_empty());
    }

    #[test]
    fn lists_files_only_and_removes_them() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("coverage-1.json"), "{}").unwrap();
        fs::write(tmp.path().join("coverage-2.json"), "{}").unwrap();
        fs::create_dir(tmp.path().join("nested")).unwrap();

        assert_eq!(list_artifacts(tmp.path()).unwrap().len(), 2);
        assert_eq!(remove_artifacts(tmp.path()).unwrap(), 2);
        assert!(list_artifacts(tmp.path()).unwrap().is_empty());
        assert!(tmp.path().join("nested").is_dir());
    }

    #[test]
    fn directory_sink_invokes_hook() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        let sink = DirectorySink::new(tmp.path(), move || {
            fs::write(dir.join("coverage.json"), "{\"result\":[]}")
        });

        sink.flush().unwrap();
        assert_eq!(sink.artifact_dir(), tmp.path());
        assert_eq!(list_artifacts(tmp.path()).unwrap().len(), 1);
    }
}
