//! # Coverage Mapper
//!
//! Turns byte-offset ranges into line hit counts.
//!
//! Per-file work is memoized in a [`LineIndexCache`]: the line lengths of a
//! source file, and the lines spanned by each `(file, start, end)` range seen
//! so far. Source files are assumed not to change while the process runs, so
//! entries are never evicted; the key space is bounded by the application's
//! own sources.
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;

use crate::error::MappingError;
use crate::v8::RawCoverageRange;

type RangeKey = (PathBuf, usize, usize);

/// Memoized line layout of source files.
#[derive(Debug, Default)]
pub struct LineIndexCache {
    lengths: RwLock<HashMap<PathBuf, Arc<[usize]>>>,
    lines: Mutex<HashMap<RangeKey, Arc<[u32]>>>,
}

impl LineIndexCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files whose line lengths are cached.
    pub fn cached_files(&self) -> usize {
        self.lengths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Per-file line hit counts, keyed by file then 1-based line number.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ProcessedCoverage(BTreeMap<String, BTreeMap<u32, u64>>);

impl ProcessedCoverage {
    /// Hit count recorded for `line` of `file`.
    pub fn get(&self, file: &str, line: u32) -> Option<u64> {
        self.0.get(file).and_then(|lines| lines.get(&line)).copied()
    }

    /// Line counts of one file.
    pub fn file(&self, file: &str) -> Option<&BTreeMap<u32, u64>> {
        self.0.get(file)
    }

    /// Files with coverage.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `true` if no file has coverage.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, BTreeMap<u32, u64>>> for ProcessedCoverage {
    fn from(files: BTreeMap<String, BTreeMap<u32, u64>>) -> Self {
        ProcessedCoverage(files)
    }
}

/// Maps raw ranges to [`ProcessedCoverage`].
#[derive(Clone, Debug)]
pub struct CoverageMapper {
    cache: Arc<LineIndexCache>,
    source_root: Option<PathBuf>,
}

impl CoverageMapper {
    /// Create a mapper memoizing into `cache`.
    pub fn new(cache: Arc<LineIndexCache>) -> Self {
        CoverageMapper {
            cache,
            source_root: None,
        }
    }

    /// Report files under `root` relative to it.
    pub fn with_source_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.source_root = Some(root.into());
        self
    }

    /// Byte length of every line of `path`, newline included.
    pub fn line_lengths(&self, path: &Path) -> Result<Arc<[usize]>, MappingError> {
        if let Some(lengths) = self
            .cache
            .lengths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            return Ok(lengths.clone());
        }

        let bytes = fs::read(path).map_err(|source| MappingError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        let lengths: Arc<[usize]> = bytes
            .split_inclusive(|b| *b == b'\n')
            .map(<[u8]>::len)
            .collect();

        self.cache
            .lengths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_path_buf())
            .or_insert_with(|| lengths.clone());
        Ok(lengths)
    }

    /// Ordered 1-based lines whose bytes intersect `[start, end]`.
    pub fn offset_range_to_lines(
        &self,
        path: &Path,
        start: usize,
        end: usize,
    ) -> Result<Arc<[u32]>, MappingError> {
        let key = (path.to_path_buf(), start, end);
        if let Some(lines) = self
            .cache
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(lines.clone());
        }

        let lengths = self.line_lengths(path)?;
        let mut lines = Vec::new();
        let mut line_start = 0;
        for (index, len) in lengths.iter().enumerate() {
            if line_start > end {
                break;
            }
            let line_end = line_start + len;
            if line_end > start {
                lines.push(index as u32 + 1);
            }
            line_start = line_end;
        }
        let lines: Arc<[u32]> = lines.into();

        self.cache
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, lines.clone());
        Ok(lines)
    }

    /// Collapse raw ranges into per-line counts.
    ///
    /// Ranges of a file are applied by ascending start and, for equal starts,
    /// descending end, so an enclosing range is always written before the
    /// ranges nested in it and the most specific count wins.
    pub fn process(&self, ranges: &[RawCoverageRange]) -> Result<ProcessedCoverage, MappingError> {
        let mut by_file: BTreeMap<&Path, Vec<&RawCoverageRange>> = BTreeMap::new();
        for range in ranges {
            by_file.entry(range.path.as_path()).or_default().push(range);
        }

        let mut processed = BTreeMap::new();
        for (path, mut file_ranges) in by_file {
            file_ranges.sort_by(|a, b| {
                a.start_offset
                    .cmp(&b.start_offset)
                    .then_with(|| b.end_offset.cmp(&a.end_offset))
            });

            let mut counts = BTreeMap::new();
            for range in file_ranges {
                for line in self
                    .offset_range_to_lines(path, range.start_offset, range.end_offset)?
                    .iter()
                {
                    counts.insert(*line, range.count);
                }
            }
            processed.insert(self.report_name(path), counts);
        }
        Ok(ProcessedCoverage(processed))
    }

    fn report_name(&self, path: &Path) -> String {
        self.source_root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}
