//! Engine operations and their outcomes
//!
//! An operation carries the document payload plus everything the version
//! check needs: the requested version, the version semantics and the origin
//! of the write. The engine never mutates an operation; each write returns
//! an outcome with the assigned version and the created/found flag.

use serde::{Deserialize, Serialize};

/// Wildcard requested version: matches whatever version is current.
pub const MATCH_ANY: u64 = 0;

// ============================================================================
// Version semantics
// ============================================================================

/// How a requested version is checked and how the new version is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionType {
    /// Server-assigned, monotonically increasing. An explicit requested
    /// version is a compare-and-set: it must name the current version
    /// exactly.
    Internal,
    /// Caller-assigned. The requested version must be strictly greater than
    /// the current version and becomes the new version verbatim.
    External,
}

impl VersionType {
    /// Version-check a primary-origin write against the current version.
    ///
    /// `current` is the key's current version including tombstones, `None`
    /// when the key has never been seen.
    pub fn validate(self, current: Option<u64>, requested: u64) -> bool {
        match self {
            VersionType::Internal => requested == MATCH_ANY || current == Some(requested),
            VersionType::External => match current {
                Some(v) => requested > v,
                None => requested >= 1,
            },
        }
    }

    /// The version assigned to a write that passed [`validate`].
    ///
    /// [`validate`]: VersionType::validate
    pub fn next_version(self, current: Option<u64>, requested: u64) -> u64 {
        match self {
            VersionType::Internal => current.map_or(1, |v| v + 1),
            VersionType::External => requested,
        }
    }
}

// ============================================================================
// Origin
// ============================================================================

/// Provenance of a write, governing version-check strictness.
///
/// Primary writes are subject to conflict checks and version assignment.
/// Replica and recovery writes carry a version already assigned upstream;
/// only monotonicity is checked, which makes replay idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Primary,
    Replica,
    Recovery,
}

impl Origin {
    pub fn is_primary(self) -> bool {
        matches!(self, Origin::Primary)
    }
}

// ============================================================================
// Document
// ============================================================================

/// A parsed document as handed to the engine: a unique key plus opaque
/// source bytes. The source is nullable because a merge may discard stored
/// source for documents that only live in the translog window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doc {
    pub uid: String,
    pub routing: Option<String>,
    pub timestamp: Option<i64>,
    pub ttl: Option<i64>,
    pub source: Option<Vec<u8>>,
}

impl Doc {
    pub fn new(uid: impl Into<String>, source: impl Into<Vec<u8>>) -> Self {
        Self {
            uid: uid.into(),
            routing: None,
            timestamp: None,
            ttl: None,
            source: Some(source.into()),
        }
    }

    pub fn with_routing(mut self, routing: impl Into<String>) -> Self {
        self.routing = Some(routing.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

// ============================================================================
// Write operations
// ============================================================================

/// Create a document; fails if a live document already exists under the key.
#[derive(Debug, Clone)]
pub struct Create {
    pub doc: Doc,
    pub version: u64,
    pub version_type: VersionType,
    pub origin: Origin,
}

impl Create {
    pub fn new(doc: Doc) -> Self {
        Self {
            doc,
            version: MATCH_ANY,
            version_type: VersionType::Internal,
            origin: Origin::Primary,
        }
    }

    pub fn versioned(doc: Doc, version: u64, version_type: VersionType, origin: Origin) -> Self {
        Self {
            doc,
            version,
            version_type,
            origin,
        }
    }
}

/// Create-or-update a document.
#[derive(Debug, Clone)]
pub struct Index {
    pub doc: Doc,
    pub version: u64,
    pub version_type: VersionType,
    pub origin: Origin,
}

impl Index {
    pub fn new(doc: Doc) -> Self {
        Self {
            doc,
            version: MATCH_ANY,
            version_type: VersionType::Internal,
            origin: Origin::Primary,
        }
    }

    pub fn versioned(doc: Doc, version: u64, version_type: VersionType, origin: Origin) -> Self {
        Self {
            doc,
            version,
            version_type,
            origin,
        }
    }
}

/// Delete a document by key. Deleting an absent key is accepted; it still
/// records a tombstone so external version monotonicity survives.
#[derive(Debug, Clone)]
pub struct Delete {
    pub uid: String,
    pub version: u64,
    pub version_type: VersionType,
    pub origin: Origin,
}

impl Delete {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            version: MATCH_ANY,
            version_type: VersionType::Internal,
            origin: Origin::Primary,
        }
    }

    pub fn versioned(
        uid: impl Into<String>,
        version: u64,
        version_type: VersionType,
        origin: Origin,
    ) -> Self {
        Self {
            uid: uid.into(),
            version,
            version_type,
            origin,
        }
    }
}

/// Point lookup by key.
#[derive(Debug, Clone)]
pub struct Get {
    pub uid: String,
    /// Realtime gets consult the version map first and may serve unflushed
    /// writes straight from the translog; non-realtime gets only see what
    /// the latest refreshed reader sees.
    pub realtime: bool,
}

impl Get {
    pub fn new(uid: impl Into<String>, realtime: bool) -> Self {
        Self {
            uid: uid.into(),
            realtime,
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Outcome of a create or index operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// The version assigned to the write.
    pub version: u64,
    /// True iff no live document existed under the key immediately before.
    pub created: bool,
}

/// Outcome of a delete operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub version: u64,
    /// True iff a live document was actually removed.
    pub found: bool,
}

/// Result of a get.
#[derive(Debug, Clone)]
pub struct GetResult {
    exists: bool,
    version: u64,
    source: Option<Vec<u8>>,
    from_reader: bool,
}

impl GetResult {
    pub(crate) fn not_found() -> Self {
        Self {
            exists: false,
            version: 0,
            source: None,
            from_reader: false,
        }
    }

    pub(crate) fn from_translog(version: u64, source: Option<Vec<u8>>) -> Self {
        Self {
            exists: true,
            version,
            source,
            from_reader: false,
        }
    }

    pub(crate) fn from_reader(version: u64, source: Option<Vec<u8>>) -> Self {
        Self {
            exists: true,
            version,
            source,
            from_reader: true,
        }
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn source(&self) -> Option<&[u8]> {
        self.source.as_deref()
    }

    /// True when the result was served by a point-in-time reader rather
    /// than the translog.
    pub fn served_by_reader(&self) -> bool {
        self.from_reader
    }
}

// ============================================================================
// Tests
// ============================================================================
