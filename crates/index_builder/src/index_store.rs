use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
};

use common::types::{
    IndexName,
    IndexedFields,
};
use parking_lot::Mutex;

use crate::{
    document::{
        DocumentId,
        IndexEntry,
    },
    metadata::BuildId,
};

/// Node-local index storage.
///
/// Holds two kinds of state:
/// - a staging area per build: key chunks spilled during the collection scan
///   and the sorted prefix flushed during bulk load. Staged writes are keyed
///   by `(key, document)` with overwrite semantics, so re-spilling or
///   re-flushing after a resume is a no-op rather than a duplicate;
/// - the committed registry, installed atomically and idempotently.
#[derive(Clone)]
pub struct IndexStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    staged: BTreeMap<BuildId, StagedBuild>,
    committed: BTreeMap<IndexName, CommittedIndex>,
}

#[derive(Default)]
struct StagedBuild {
    /// Scan output. A `BTreeSet` keyed by `(key, id)` makes re-spills after a
    /// resume overwrite instead of duplicate.
    spilled: BTreeSet<IndexEntry>,
    /// The durably flushed prefix of the sorted key set.
    flushed: Vec<IndexEntry>,
}

#[derive(Clone)]
pub struct CommittedIndex {
    pub fields: IndexedFields,
    pub entries: Vec<IndexEntry>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Clear all staged state for a build. Called on `Setup` so a restarted
    /// build never sees progress from an invalidated attempt.
    pub fn reset_stage(&self, build_id: BuildId) {
        let mut inner = self.inner.lock();
        inner.staged.insert(build_id, StagedBuild::default());
    }

    /// Discard staged state past a resumed scan position: spilled entries
    /// after the cursor may reference revisions the rollback reverted, and
    /// any flushed prefix is stale once the scan re-runs.
    pub fn truncate_stage_to_cursor(&self, build_id: BuildId, cursor: Option<DocumentId>) {
        let mut inner = self.inner.lock();
        let staged = inner.staged.entry(build_id).or_default();
        match cursor {
            Some(cursor) => staged.spilled.retain(|entry| entry.id <= cursor),
            None => staged.spilled.clear(),
        }
        staged.flushed.clear();
    }

    /// Stage a chunk of extracted index entries from the collection scan.
    pub fn spill_chunk(&self, build_id: BuildId, entries: Vec<IndexEntry>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let staged = inner.staged.entry(build_id).or_default();
        staged.spilled.extend(entries);
        Ok(())
    }

    /// The full spilled key set, in sorted order.
    pub fn spilled(&self, build_id: BuildId) -> Vec<IndexEntry> {
        let inner = self.inner.lock();
        inner
            .staged
            .get(&build_id)
            .map(|s| s.spilled.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn flushed_len(&self, build_id: BuildId) -> u64 {
        let inner = self.inner.lock();
        inner
            .staged
            .get(&build_id)
            .map(|s| s.flushed.len() as u64)
            .unwrap_or(0)
    }

    /// Flush a chunk of the sorted key set starting at `offset`. Offsets at
    /// or before the current flushed length overwrite the overlap, so
    /// repeating a flush after an ill-timed interruption converges instead of
    /// duplicating.
    pub fn flush_sorted_chunk(
        &self,
        build_id: BuildId,
        offset: u64,
        chunk: Vec<IndexEntry>,
    ) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let staged = inner.staged.entry(build_id).or_default();
        let offset = offset as usize;
        anyhow::ensure!(
            offset <= staged.flushed.len(),
            "flush at offset {offset} would leave a gap (flushed {})",
            staged.flushed.len(),
        );
        staged.flushed.truncate(offset);
        staged.flushed.extend(chunk);
        Ok(staged.flushed.len() as u64)
    }

    pub fn flushed(&self, build_id: BuildId) -> Vec<IndexEntry> {
        let inner = self.inner.lock();
        inner
            .staged
            .get(&build_id)
            .map(|s| s.flushed.clone())
            .unwrap_or_default()
    }

    /// Atomically install the committed index. Overwrites any previous
    /// version of the same index, which is what makes re-running an
    /// interrupted commit idempotent.
    pub fn install(
        &self,
        name: IndexName,
        fields: IndexedFields,
        entries: Vec<IndexEntry>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner
            .committed
            .insert(name, CommittedIndex { fields, entries });
        Ok(())
    }

    /// Remove all staged state for a build. Called after commit finalizes and
    /// on abort.
    pub fn drop_stage(&self, build_id: BuildId) {
        let mut inner = self.inner.lock();
        inner.staged.remove(&build_id);
    }

    pub fn committed(&self, name: &IndexName) -> Option<CommittedIndex> {
        let inner = self.inner.lock();
        inner.committed.get(name).cloned()
    }
}

impl Default for IndexStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::{
        document::{
            DocumentId,
            IndexEntry,
            IndexKey,
            IndexKeyValue,
        },
        index_store::IndexStore,
        metadata::BuildId,
    };

    fn entry(key: i64, id: u64) -> IndexEntry {
        IndexEntry {
            key: IndexKey(vec![IndexKeyValue::Int(key)]),
            id: DocumentId::new(id),
        }
    }

    #[test]
    fn test_spill_is_idempotent() -> anyhow::Result<()> {
        let store = IndexStore::new();
        let build = BuildId::new(Uuid::from_u128(1));
        store.spill_chunk(build, vec![entry(2, 2), entry(1, 1)])?;
        // Re-spilling the same documents after a resume changes nothing.
        store.spill_chunk(build, vec![entry(1, 1)])?;
        assert_eq!(store.spilled(build), vec![entry(1, 1), entry(2, 2)]);
        Ok(())
    }

    #[test]
    fn test_flush_overlap_converges() -> anyhow::Result<()> {
        let store = IndexStore::new();
        let build = BuildId::new(Uuid::from_u128(1));
        assert_eq!(
            store.flush_sorted_chunk(build, 0, vec![entry(1, 1), entry(2, 2)])?,
            2,
        );
        // A resumed bulk load whose checkpoint lagged the flush re-flushes
        // from offset 1; the overlap overwrites.
        assert_eq!(
            store.flush_sorted_chunk(build, 1, vec![entry(2, 2), entry(3, 3)])?,
            3,
        );
        assert_eq!(
            store.flushed(build),
            vec![entry(1, 1), entry(2, 2), entry(3, 3)],
        );
        // A gap is a bug.
        assert!(store.flush_sorted_chunk(build, 5, vec![entry(9, 9)]).is_err());
        Ok(())
    }

    #[test]
    fn test_install_overwrites() -> anyhow::Result<()> {
        let store = IndexStore::new();
        let name: common::types::IndexName = "messages.by_a".parse()?;
        let fields: common::types::IndexedFields = vec!["a".parse()?].try_into()?;
        store.install(name.clone(), fields.clone(), vec![entry(1, 1)])?;
        store.install(name.clone(), fields, vec![entry(1, 1)])?;
        let committed = store.committed(&name).unwrap();
        assert_eq!(committed.entries, vec![entry(1, 1)]);
        Ok(())
    }

    #[test]
    fn test_truncate_discards_untrusted_stage() -> anyhow::Result<()> {
        let store = IndexStore::new();
        let build = BuildId::new(Uuid::from_u128(1));
        store.spill_chunk(build, vec![entry(1, 1), entry(2, 2), entry(3, 3)])?;
        store.flush_sorted_chunk(build, 0, vec![entry(1, 1)])?;

        store.truncate_stage_to_cursor(build, Some(DocumentId::new(2)));
        assert_eq!(store.spilled(build), vec![entry(1, 1), entry(2, 2)]);
        assert_eq!(store.flushed_len(build), 0);

        store.truncate_stage_to_cursor(build, None);
        assert!(store.spilled(build).is_empty());
        Ok(())
    }
}
