//! V8 coverage artifacts.
//!
//! The documents written by `NODE_V8_COVERAGE` (and by the inspector's
//! `Profiler.takePreciseCoverage`) look like:
//!
//! ```json
//! {"result": [{"scriptId": "42", "url": "file:///app/index.js", "functions": [
//!     {"functionName": "", "isBlockCoverage": true,
//!      "ranges": [{"startOffset": 0, "endOffset": 120, "count": 1}]}]}]}
//! ```
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use url::Url;

use crate::error::CaptureError;

/// Default dependency directory names whose sources are never reported.
pub const DEFAULT_DEPENDENCY_DIRS: &[&str] = &["node_modules"];

/// A byte range of a source file with the number of times it executed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawCoverageRange {
    /// Absolute path of the source file.
    pub path: PathBuf,
    /// First byte of the range.
    pub start_offset: usize,
    /// Last byte of the range.
    pub end_offset: usize,
    /// Execution count.
    pub count: u64,
}

#[derive(Debug, Deserialize)]
struct CoverageDocument {
    #[serde(default)]
    result: Vec<ScriptCoverage>,
}

#[derive(Debug, Deserialize)]
struct ScriptCoverage {
    url: String,
    #[serde(default)]
    functions: Vec<FunctionCoverage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionCoverage {
    #[serde(default)]
    is_block_coverage: bool,
    #[serde(default)]
    ranges: Vec<CoverageRange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoverageRange {
    start_offset: usize,
    end_offset: usize,
    count: u64,
}

/// Decides which scripts of an artifact belong to the application.
///
/// The default filter drops [`DEFAULT_DEPENDENCY_DIRS`] only. The code that
/// instruments the application runs inside every captured request, so its
/// own sources need [`PathFilter::with_excluded_fragment`].
#[derive(Clone, Debug)]
pub struct PathFilter {
    dependency_dirs: Vec<String>,
    excluded_fragments: Vec<String>,
}

impl Default for PathFilter {
    fn default() -> Self {
        PathFilter {
            dependency_dirs: DEFAULT_DEPENDENCY_DIRS
                .iter()
                .map(|dir| dir.to_string())
                .collect(),
            excluded_fragments: Vec::new(),
        }
    }
}

impl PathFilter {
    /// Replace the dependency directory names. Any path with a component
    /// equal to one of them is excluded.
    pub fn with_dependency_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    /// Exclude any path containing `fragment`, typically the location of the
    /// instrumentation shim itself.
    pub fn with_excluded_fragment<S: Into<String>>(mut self, fragment: S) -> Self {
        self.excluded_fragments.push(fragment.into());
        self
    }

    /// Whether coverage for `path` should be kept.
    pub fn accepts(&self, path: &Path) -> bool {
        let in_dependency_dir = path.components().any(|component| match component {
            Component::Normal(name) => self
                .dependency_dirs
                .iter()
                .any(|dir| name == dir.as_str()),
            _ => false,
        });
        if in_dependency_dir {
            return false;
        }

        let display = path.to_string_lossy();
        !self
            .excluded_fragments
            .iter()
            .any(|fragment| display.contains(fragment.as_str()))
    }
}

/// Parse a coverage document into the ranges of application sources.
///
/// Only `file://` scripts are considered, and only functions carrying block
/// coverage contribute ranges.
pub fn parse_document(json: &[u8], filter: &PathFilter) -> serde_json::Result<Vec<RawCoverageRange>> {
    let document: CoverageDocument = serde_json::from_slice(json)?;

    let mut ranges = Vec::new();
    for script in document.result {
        let Some(path) = file_path(&script.url) else {
            continue;
        };
        if !filter.accepts(&path) {
            continue;
        }
        for function in script.functions.iter().filter(|f| f.is_block_coverage) {
            ranges.extend(function.ranges.iter().map(|range| RawCoverageRange {
                path: path.clone(),
                start_offset: range.start_offset,
                end_offset: range.end_offset,
                count: range.count,
            }));
        }
    }
    Ok(ranges)
}

/// Read and parse one artifact file.
pub(crate) fn read_artifact(
    path: &Path,
    filter: &PathFilter,
) -> Result<Vec<RawCoverageRange>, CaptureError> {
    let bytes = fs::read(path)?;
    parse_document(&bytes, filter).map_err(|source| CaptureError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn file_path(url: &str) -> Option<PathBuf> {
    let url = Url::parse(url).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{"result": [
        {"scriptId": "1", "url": "file:///srv/app/server.js", "functions": [
            {"functionName": "", "isBlockCoverage": true, "ranges": [
                {"startOffset": 0, "endOffset": 120, "count": 1},
                {"startOffset": 40, "endOffset": 60, "count": 0}]},
            {"functionName": "lazy", "isBlockCoverage": false, "ranges": [
                {"startOffset": 70, "endOffset": 90, "count": 0}]}]},
        {"scriptId": "2", "url": "file:///srv/app/node_modules/express/index.js", "functions": [
            {"functionName": "", "isBlockCoverage": true, "ranges": [
                {"startOffset": 0, "endOffset": 10, "count": 3}]}]},
        {"scriptId": "3", "url": "node:internal/modules/cjs/loader", "functions": [
            {"functionName": "", "isBlockCoverage": true, "ranges": [
                {"startOffset": 0, "endOffset": 10, "count": 3}]}]}
    ]}"#;

    #[test]
    fn keeps_application_block_ranges() {
        let ranges = parse_document(DOCUMENT.as_bytes(), &PathFilter::default()).unwrap();
        assert_eq!(
            ranges,
            vec![
                RawCoverageRange {
                    path: PathBuf::from("/srv/app/server.js"),
                    start_offset: 0,
                    end_offset: 120,
                    count: 1,
                },
                RawCoverageRange {
                    path: PathBuf::from("/srv/app/server.js"),
                    start_offset: 40,
                    end_offset: 60,
                    count: 0,
                },
            ]
        );
    }

    #[test]
    fn excluded_fragment_drops_instrumentation_sources() {
        let filter = PathFilter::default().with_excluded_fragment("/srv/app/server");
        let ranges = parse_document(DOCUMENT.as_bytes(), &filter).unwrap();
        assert!(ranges.is_empty());
    }

    #[test]
    fn dependency_dirs_match_whole_components() {
        let filter = PathFilter::default();
        assert!(!filter.accepts(Path::new("/app/node_modules/x.js")));
        assert!(filter.accepts(Path::new("/app/my_node_modules_notes/x.js")));

        let vendored = PathFilter::default().with_dependency_dirs(["vendor"]);
        assert!(!vendored.accepts(Path::new("/app/vendor/lib.js")));
        assert!(vendored.accepts(Path::new("/app/node_modules/x.js")));
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(parse_document(b"not json", &PathFilter::default()).is_err());
        assert!(parse_document(b"{}", &PathFilter::default())
            .unwrap()
            .is_empty());
    }
}
