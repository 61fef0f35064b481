//! Strata: per-shard versioned segment store engine
//!
//! A storage engine that turns a stream of document-level write operations
//! (create, index, delete, get) into a durable, versioned,
//! near-real-time-searchable segment store:
//!
//! - optimistic per-key version control with internal (server-assigned) and
//!   external (caller-assigned) versioning
//! - an append-only translog with read-once snapshots and a three-phase
//!   snapshot+replay recovery protocol
//! - an engine lifecycle state machine (new, started, failed, closed)
//! - refresh/flush/merge coordination reconciling in-memory visibility with
//!   on-disk durability

pub mod engine;
pub mod index;
pub mod merge;
pub mod ops;
pub mod recovery;
pub mod settings;
pub mod store;
pub mod translog;
pub mod version;

// Re-export main types
pub use engine::{Engine, FlushType, Searcher, WriterConfig};
pub use index::segment::{Segment, SegmentsStats};
pub use index::{IndexWriter, ReaderSnapshot, SnapshotIndexCommit, StoredDoc};
pub use merge::{MergeListener, MergeScheduler, OngoingMerge};
pub use ops::{Create, Delete, Doc, Get, GetResult, Index, Origin, VersionType, MATCH_ANY};
pub use recovery::{RecoveryHandler, RecoverySteps};
pub use settings::{EngineSettings, SettingsService};
pub use store::{Store, StoreRef};
pub use translog::{Location, Translog, TranslogSnapshot};

/// Engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("version conflict: current [{current:?}], requested [{requested}]")]
    VersionConflict { current: Option<u64>, requested: u64 },

    #[error("document already exists: [{uid}]")]
    DocumentAlreadyExists { uid: String },

    #[error("engine already started")]
    AlreadyStarted,

    #[error("flush not allowed: {0}")]
    FlushNotAllowed(String),

    #[error("engine is closed")]
    EngineClosed,

    #[error("store is closed")]
    StoreClosed,

    #[error("engine creation failed: {source}")]
    CreationFailure {
        #[source]
        source: Box<EngineError>,
    },

    #[error("recovery already running")]
    RecoveryInProgress,

    #[error("recovery failed in phase {phase}: {source}")]
    RecoveryFailure {
        phase: u8,
        #[source]
        source: Box<EngineError>,
    },

    #[error("index corruption: {0}")]
    Corruption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Whether this error, or any error in its source chain, indicates
    /// index corruption.
    pub fn is_corruption(&self) -> bool {
        match self {
            EngineError::Corruption(_) => true,
            EngineError::CreationFailure { source } => source.is_corruption(),
            EngineError::RecoveryFailure { source, .. } => source.is_corruption(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
