use std::fmt::{
    self,
    Display,
};

use common::types::{
    IndexName,
    IndexedFields,
    Timestamp,
};
use errors::ErrorCode;
use serde::{
    Deserialize,
    Serialize,
};
use uuid::Uuid;

/// Identifier of one index-construction task. Unique across the node's
/// lifetime; allocated from the runtime's RNG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(Uuid);

impl BuildId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The ordered phases of an index build. Phases execute strictly in order; a
/// phase is re-entered only by resuming from a checkpoint taken within it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum IndexBuildPhase {
    Setup,
    CollectionScan,
    BulkLoad,
    Commit,
}

impl Display for IndexBuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Setup => "setup",
            Self::CollectionScan => "collection_scan",
            Self::BulkLoad => "bulk_load",
            Self::Commit => "commit",
        };
        write!(f, "{s}")
    }
}

/// Externally visible lifecycle state of a build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildState {
    Running,
    Suspended {
        resume_from: IndexBuildPhase,
    },
    Done,
    Aborted {
        /// Classification of the abort cause, if the error carried one.
        /// `None` means an internal failure.
        code: Option<ErrorCode>,
        short_msg: String,
    },
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted { .. })
    }
}

/// Snapshot of a build's progress, readable without blocking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildStatus {
    /// The phase the build is in, was suspended in, or finished with.
    pub phase: IndexBuildPhase,
    pub state: BuildState,
}

impl BuildStatus {
    pub fn new() -> Self {
        Self {
            phase: IndexBuildPhase::Setup,
            state: BuildState::Running,
        }
    }
}

impl Default for BuildStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable description of one build, fixed at `start_build`.
#[derive(Clone, Debug)]
pub struct BuildMetadata {
    pub id: BuildId,
    pub index_name: IndexName,
    pub fields: IndexedFields,
    pub created_ts: Timestamp,
}
