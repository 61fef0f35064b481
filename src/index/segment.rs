//! Segment metadata
//!
//! Segments are immutable units of indexed documents. The engine only reads
//! their metadata for stats and ordering; generation numbers increase
//! monotonically and define segment age.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata for a single segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// Generation number, monotonically increasing.
    pub generation: u64,

    /// Number of live documents.
    pub num_docs: usize,

    /// Number of documents marked deleted.
    pub deleted_docs: usize,

    /// Whether the segment is part of the last durable commit.
    pub committed: bool,

    /// Whether the segment is visible to the current point-in-time reader.
    pub search: bool,

    /// Whether the segment was sealed in compound form.
    pub compound: bool,

    /// Estimated size of the segment in bytes.
    pub size_in_bytes: u64,

    /// Merge identifier, set while the segment participates in an
    /// in-progress merge and cleared on completion or failure.
    pub merge_id: Option<u64>,

    /// Per-component memory breakdown; only populated for verbose listings.
    pub ram_breakdown: Option<HashMap<String, u64>>,
}

/// Aggregate segment statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentsStats {
    pub count: u64,
    pub memory_in_bytes: u64,
}
