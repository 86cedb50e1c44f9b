use std::fmt::{
    self,
    Display,
};

use async_trait::async_trait;
use common::types::Timestamp;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    document::DocumentId,
    metadata::{
        BuildId,
        IndexBuildPhase,
    },
};

/// Per-build checkpoint sequence number. Strictly increasing; resumption
/// always picks the highest-sequence checkpoint that is still valid.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CheckpointSeq(u64);

impl CheckpointSeq {
    pub fn new(seq: u64) -> Self {
        Self(seq)
    }
}

impl Display for CheckpointSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phase-specific resumable progress.
///
/// Each marker records a `reference_ts`: the maximum last-modified marker of
/// any document the recorded progress depends on. A rollback to stable
/// timestamp `S` may revert every revision above `S`, so a checkpoint is safe
/// to resume from iff `reference_ts <= S`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressMarker {
    /// No data dependencies yet; never invalidated by rollback.
    Setup,
    CollectionScan {
        /// Last scanned position; a resumed scan continues strictly after it.
        cursor: Option<DocumentId>,
        docs_scanned: u64,
        reference_ts: Timestamp,
    },
    BulkLoad {
        /// Length of the sorted prefix that has been durably flushed.
        keys_flushed: u64,
        reference_ts: Timestamp,
    },
    /// Scan and sort complete. Commit is never resumed mid-way; it re-runs
    /// from the flushed state in its entirety.
    Commit { reference_ts: Timestamp },
}

impl ProgressMarker {
    pub fn phase(&self) -> IndexBuildPhase {
        match self {
            Self::Setup => IndexBuildPhase::Setup,
            Self::CollectionScan { .. } => IndexBuildPhase::CollectionScan,
            Self::BulkLoad { .. } => IndexBuildPhase::BulkLoad,
            Self::Commit { .. } => IndexBuildPhase::Commit,
        }
    }

    pub fn reference_ts(&self) -> Timestamp {
        match self {
            Self::Setup => Timestamp::MIN,
            Self::CollectionScan { reference_ts, .. }
            | Self::BulkLoad { reference_ts, .. }
            | Self::Commit { reference_ts } => *reference_ts,
        }
    }
}

/// A durable snapshot of build progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub build_id: BuildId,
    pub phase: IndexBuildPhase,
    pub progress: ProgressMarker,
    pub seq: CheckpointSeq,
}

/// Durable, versioned record of build progress.
///
/// `save` is synchronous with respect to durability: it does not return until
/// the checkpoint is guaranteed to survive a crash. Calls for different
/// builds must not block each other; calls for the same build are serialized.
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    async fn save(
        &self,
        build_id: BuildId,
        progress: ProgressMarker,
    ) -> anyhow::Result<CheckpointSeq>;

    /// The highest-sequence checkpoint for the build whose `reference_ts` is
    /// at or below `stable_ts`. `None` means no checkpoint survived and the
    /// build cannot be resumed from stored progress.
    async fn latest_valid(
        &self,
        build_id: BuildId,
        stable_ts: Timestamp,
    ) -> anyhow::Result<Option<Checkpoint>>;

    /// Remove all checkpoints for the build. Idempotent; called on commit and
    /// abort.
    async fn purge(&self, build_id: BuildId) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct BuildCheckpoints {
    next_seq: u64,
    checkpoints: Vec<Checkpoint>,
}

impl BuildCheckpoints {
    fn append(&mut self, build_id: BuildId, progress: ProgressMarker) -> CheckpointSeq {
        let seq = CheckpointSeq::new(self.next_seq);
        self.next_seq += 1;
        self.checkpoints.push(Checkpoint {
            build_id,
            phase: progress.phase(),
            progress,
            seq,
        });
        seq
    }

    fn latest_valid(&self, stable_ts: Timestamp) -> Option<Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|cp| cp.progress.reference_ts() <= stable_ts)
            .cloned()
    }
}

pub use self::file_store::FileCheckpointStore;
#[cfg(any(test, feature = "testing"))]
pub use self::test_store::TestCheckpointStore;

#[cfg(any(test, feature = "testing"))]
mod test_store {
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{
                AtomicU32,
                Ordering,
            },
            Arc,
        },
    };

    use async_trait::async_trait;
    use common::types::Timestamp;
    use parking_lot::Mutex;

    use super::{
        BuildCheckpoints,
        Checkpoint,
        CheckpointSeq,
        CheckpointStore,
        ProgressMarker,
    };
    use crate::metadata::BuildId;

    /// In-memory checkpoint store for tests, with injectable save failures.
    #[derive(Clone, Default)]
    pub struct TestCheckpointStore {
        builds: Arc<Mutex<BTreeMap<BuildId, BuildCheckpoints>>>,
        failures_remaining: Arc<AtomicU32>,
    }

    impl TestCheckpointStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `failures` saves fail, simulating storage faults.
        pub fn fail_saves(&self, failures: u32) {
            self.failures_remaining.store(failures, Ordering::SeqCst);
        }

        pub fn checkpoint_count(&self, build_id: BuildId) -> usize {
            self.builds
                .lock()
                .get(&build_id)
                .map(|b| b.checkpoints.len())
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl CheckpointStore for TestCheckpointStore {
        async fn save(
            &self,
            build_id: BuildId,
            progress: ProgressMarker,
        ) -> anyhow::Result<CheckpointSeq> {
            let failures = self.failures_remaining.load(Ordering::SeqCst);
            if failures > 0
                && self
                    .failures_remaining
                    .compare_exchange(failures, failures - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                anyhow::bail!("synthetic checkpoint write failure");
            }
            let mut builds = self.builds.lock();
            Ok(builds.entry(build_id).or_default().append(build_id, progress))
        }

        async fn latest_valid(
            &self,
            build_id: BuildId,
            stable_ts: Timestamp,
        ) -> anyhow::Result<Option<Checkpoint>> {
            let builds = self.builds.lock();
            Ok(builds
                .get(&build_id)
                .and_then(|b| b.latest_valid(stable_ts)))
        }

        async fn purge(&self, build_id: BuildId) -> anyhow::Result<()> {
            self.builds.lock().remove(&build_id);
            Ok(())
        }
    }
}

mod file_store {
    use std::{
        collections::BTreeMap,
        fs,
        io::Write,
        path::PathBuf,
        sync::Arc,
    };

    use anyhow::Context;
    use async_trait::async_trait;
    use common::types::Timestamp;
    use parking_lot::Mutex;

    use super::{
        BuildCheckpoints,
        Checkpoint,
        CheckpointSeq,
        CheckpointStore,
        ProgressMarker,
    };
    use crate::metadata::BuildId;

    /// Durable checkpoint store: one JSON file per build, replaced atomically
    /// via write + fsync + rename so a crash never leaves a torn record.
    #[derive(Clone)]
    pub struct FileCheckpointStore {
        dir: PathBuf,
        // Serializes same-build operations without blocking other builds.
        locks: Arc<Mutex<BTreeMap<BuildId, Arc<tokio::sync::Mutex<()>>>>>,
    }

    impl FileCheckpointStore {
        pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
            let dir = dir.into();
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create checkpoint dir {dir:?}"))?;
            Ok(Self {
                dir,
                locks: Arc::new(Mutex::new(BTreeMap::new())),
            })
        }

        fn build_lock(&self, build_id: BuildId) -> Arc<tokio::sync::Mutex<()>> {
            self.locks.lock().entry(build_id).or_default().clone()
        }

        fn path(&self, build_id: BuildId) -> PathBuf {
            self.dir.join(format!("{build_id}.json"))
        }

        fn load(&self, build_id: BuildId) -> anyhow::Result<BuildCheckpoints> {
            let path = self.path(build_id);
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(BuildCheckpoints::default());
                },
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {path:?}"));
                },
            };
            serde_json::from_str(&contents)
                .with_context(|| format!("Corrupt checkpoint file {path:?}"))
        }

        fn persist(&self, build_id: BuildId, checkpoints: &BuildCheckpoints) -> anyhow::Result<()> {
            let path = self.path(build_id);
            let tmp_path = self.dir.join(format!("{build_id}.json.tmp"));
            let contents = serde_json::to_vec(checkpoints)?;
            {
                let mut file = fs::File::create(&tmp_path)
                    .with_context(|| format!("Failed to create {tmp_path:?}"))?;
                file.write_all(&contents)?;
                file.sync_all()?;
            }
            fs::rename(&tmp_path, &path)
                .with_context(|| format!("Failed to publish {path:?}"))?;
            // The rename itself must be durable before save returns.
            fs::File::open(&self.dir)?.sync_all()?;
            Ok(())
        }
    }

    #[async_trait]
    impl CheckpointStore for FileCheckpointStore {
        async fn save(
            &self,
            build_id: BuildId,
            progress: ProgressMarker,
        ) -> anyhow::Result<CheckpointSeq> {
            let lock = self.build_lock(build_id);
            let _guard = lock.lock().await;
            let this = self.clone();
            tokio::task::spawn_blocking(move || {
                let mut checkpoints = this.load(build_id)?;
                let seq = checkpoints.append(build_id, progress);
                this.persist(build_id, &checkpoints)?;
                Ok(seq)
            })
            .await?
        }

        async fn latest_valid(
            &self,
            build_id: BuildId,
            stable_ts: Timestamp,
        ) -> anyhow::Result<Option<Checkpoint>> {
            let lock = self.build_lock(build_id);
            let _guard = lock.lock().await;
            let this = self.clone();
            tokio::task::spawn_blocking(move || {
                Ok(this.load(build_id)?.latest_valid(stable_ts))
            })
            .await?
        }

        async fn purge(&self, build_id: BuildId) -> anyhow::Result<()> {
            let lock = self.build_lock(build_id);
            let _guard = lock.lock().await;
            let this = self.clone();
            tokio::task::spawn_blocking(move || {
                match fs::remove_file(this.path(build_id)) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e).context("Failed to remove checkpoint file"),
                }
            })
            .await?
        }
    }
}

#[cfg(test)]
mod tests {
    use common::types::Timestamp;
    use uuid::Uuid;

    use crate::{
        checkpoints::{
            CheckpointSeq,
            CheckpointStore,
            FileCheckpointStore,
            ProgressMarker,
            TestCheckpointStore,
        },
        document::DocumentId,
        metadata::{
            BuildId,
            IndexBuildPhase,
        },
    };

    fn build_id(n: u128) -> BuildId {
        BuildId::new(Uuid::from_u128(n))
    }

    fn scan_marker(cursor: u64, reference_ts: u64) -> ProgressMarker {
        ProgressMarker::CollectionScan {
            cursor: Some(DocumentId::new(cursor)),
            docs_scanned: cursor,
            reference_ts: Timestamp::new(reference_ts),
        }
    }

    #[tokio::test]
    async fn test_sequences_are_strictly_increasing() -> anyhow::Result<()> {
        let store = TestCheckpointStore::new();
        let build = build_id(1);
        let s0 = store.save(build, ProgressMarker::Setup).await?;
        let s1 = store.save(build, scan_marker(1, 1)).await?;
        let s2 = store.save(build, scan_marker(2, 2)).await?;
        assert!(s0 < s1 && s1 < s2);

        // Independent builds have independent sequences.
        let other = store.save(build_id(2), ProgressMarker::Setup).await?;
        assert_eq!(other, CheckpointSeq::new(0));
        Ok(())
    }

    #[tokio::test]
    async fn test_latest_valid_respects_stable_ts() -> anyhow::Result<()> {
        let store = TestCheckpointStore::new();
        let build = build_id(1);
        store.save(build, ProgressMarker::Setup).await?;
        store.save(build, scan_marker(1, 1)).await?;
        store.save(build, scan_marker(4, 4)).await?;

        // Everything valid: pick the newest.
        let cp = store.latest_valid(build, Timestamp::MAX).await?.unwrap();
        assert_eq!(cp.progress, scan_marker(4, 4));

        // Rollback to ts=2 invalidates the newest; fall back to cursor 1.
        let cp = store.latest_valid(build, Timestamp::new(2)).await?.unwrap();
        assert_eq!(cp.progress, scan_marker(1, 1));

        // Rollback below every scanned revision leaves only Setup.
        let cp = store.latest_valid(build, Timestamp::MIN).await?.unwrap();
        assert_eq!(cp.progress, ProgressMarker::Setup);
        assert_eq!(cp.phase, IndexBuildPhase::Setup);
        Ok(())
    }

    #[tokio::test]
    async fn test_purge_is_idempotent() -> anyhow::Result<()> {
        let store = TestCheckpointStore::new();
        let build = build_id(1);
        store.save(build, ProgressMarker::Setup).await?;
        store.purge(build).await?;
        store.purge(build).await?;
        assert!(store.latest_valid(build, Timestamp::MAX).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_save_failures() -> anyhow::Result<()> {
        let store = TestCheckpointStore::new();
        let build = build_id(1);
        store.fail_saves(2);
        assert!(store.save(build, ProgressMarker::Setup).await.is_err());
        assert!(store.save(build, ProgressMarker::Setup).await.is_err());
        store.save(build, ProgressMarker::Setup).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let build = build_id(7);
        {
            let store = FileCheckpointStore::new(dir.path())?;
            store.save(build, ProgressMarker::Setup).await?;
            store.save(build, scan_marker(2, 2)).await?;
        }

        // A new store over the same directory sees the same checkpoints.
        let store = FileCheckpointStore::new(dir.path())?;
        let cp = store.latest_valid(build, Timestamp::MAX).await?.unwrap();
        assert_eq!(cp.progress, scan_marker(2, 2));
        assert_eq!(cp.seq, CheckpointSeq::new(1));

        // And appends continue the sequence.
        let seq = store.save(build, scan_marker(3, 3)).await?;
        assert_eq!(seq, CheckpointSeq::new(2));

        store.purge(build).await?;
        store.purge(build).await?;
        assert!(store.latest_valid(build, Timestamp::MAX).await?.is_none());
        Ok(())
    }
}
