//! Chunk descriptors and the chunk plan.
//!
//! A chunk is one unit of transferable data: a metric-store time slice or a
//! columnar-store row range. The plan enumerates all chunks for a transfer in
//! a fixed order; workers draw from it concurrently.

use crate::error::{DumpError, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Which remote store a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// The numeric time-series store (VictoriaMetrics-compatible).
    VictoriaMetrics,
    /// The columnar analytic store holding QAN rows (ClickHouse-compatible).
    ClickHouse,
}

impl SourceKind {
    /// Directory of this source's chunks inside the archive.
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::VictoriaMetrics => "vm",
            Self::ClickHouse => "ch",
        }
    }

    /// Parse from an archive directory name.
    #[must_use]
    pub fn from_dir_name(s: &str) -> Option<Self> {
        match s {
            "vm" => Some(Self::VictoriaMetrics),
            "ch" => Some(Self::ClickHouse),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Immutable record identifying one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub source: SourceKind,
    /// Monotonic per-source index, assigned at plan time.
    pub index: u32,
    /// Half-open `[start, end)` window. Always set for metric-store chunks.
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Row offset into the windowed query (columnar-store only).
    pub row_offset: Option<u64>,
    /// Maximum rows in this chunk (columnar-store only).
    pub row_limit: Option<u64>,
    /// File extension inside the archive, chosen by the adapter.
    pub extension: &'static str,
}

impl ChunkDescriptor {
    /// Relative path of this chunk inside the archive.
    #[must_use]
    pub fn filename(&self) -> String {
        format!("{}/{}.{}", self.source.dir_name(), self.index, self.extension)
    }

    /// Reconstruct a descriptor from an archive entry path, e.g. `vm/3.bin`.
    ///
    /// Windows and row bounds are not encoded in filenames; import does not
    /// need them.
    pub fn from_filename(name: &str) -> Result<Self> {
        let bad = || DumpError::Format { reason: format!("unexpected entry in dump: {name}") };

        let (dir, file) = name.split_once('/').ok_or_else(bad)?;
        let source = SourceKind::from_dir_name(dir).ok_or_else(bad)?;
        let (stem, ext) = file.rsplit_once('.').ok_or_else(bad)?;
        let index: u32 = stem.parse().map_err(|_| bad())?;

        let extension = match (source, ext) {
            (SourceKind::VictoriaMetrics, "bin") => "bin",
            (SourceKind::VictoriaMetrics, "json") => "json",
            (SourceKind::ClickHouse, "tsv") => "tsv",
            _ => return Err(bad()),
        };

        Ok(Self {
            source,
            index,
            start: None,
            end: None,
            row_offset: None,
            row_limit: None,
            extension,
        })
    }
}

/// Finite, ordered pool of chunk descriptors.
///
/// Descriptors are stored metric-store first, then columnar-store, each by
/// ascending index. `next` hands them out in that order; it is safe to call
/// from any number of workers.
#[derive(Debug)]
pub struct ChunkPlan {
    chunks: Vec<ChunkDescriptor>,
    cursor: AtomicUsize,
}

impl ChunkPlan {
    /// Build a plan from per-source descriptor lists.
    ///
    /// Indices must be dense (`0..N-1`) per source; the constructor checks
    /// this because the archive layout depends on it.
    pub fn new(mut chunks: Vec<ChunkDescriptor>) -> Result<Self> {
        chunks.sort_by_key(|c| (c.source != SourceKind::VictoriaMetrics, c.index));

        for kind in [SourceKind::VictoriaMetrics, SourceKind::ClickHouse] {
            for (expected, chunk) in chunks.iter().filter(|c| c.source == kind).enumerate() {
                if chunk.index as usize != expected {
                    return Err(DumpError::Config {
                        reason: format!(
                            "chunk plan for {kind} is not dense: expected index {expected}, got {}",
                            chunk.index
                        ),
                    });
                }
            }
        }

        Ok(Self { chunks, cursor: AtomicUsize::new(0) })
    }

    /// Draw the next descriptor, or `None` when the plan is exhausted.
    pub fn next(&self) -> Option<ChunkDescriptor> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.chunks.get(i).cloned()
    }

    /// Total number of descriptors in the plan.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
