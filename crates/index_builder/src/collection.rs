use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use async_trait::async_trait;
use common::types::{
    TableName,
    Timestamp,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::document::{
    Document,
    DocumentId,
};

/// Read access to collection data, as exposed by the storage layer.
///
/// The contract the build engine depends on:
/// - `scan_after` returns documents in `DocumentId` order, which is stable
///   across calls, so a scan can resume deterministically from a cursor;
/// - every document carries a last-modified marker comparable with the
///   rollback subsystem's stable timestamps;
/// - `changes_since` exposes revisions after a marker so commit can fold in
///   writes that landed while the build was scanning or loading.
#[async_trait]
pub trait CollectionReader: Send + Sync + 'static {
    /// Up to `limit` documents with ids strictly greater than `cursor`, in id
    /// order. `None` starts from the beginning of the table.
    async fn scan_after(
        &self,
        table: &TableName,
        cursor: Option<DocumentId>,
        limit: usize,
    ) -> anyhow::Result<Vec<Document>>;

    /// Documents whose last-modified marker is strictly greater than `ts`.
    async fn changes_since(
        &self,
        table: &TableName,
        ts: Timestamp,
    ) -> anyhow::Result<Vec<Document>>;

    /// Number of documents currently in the table.
    async fn count(&self, table: &TableName) -> anyhow::Result<u64>;

    /// The storage layer's current timestamp high-water mark.
    async fn latest_ts(&self) -> anyhow::Result<Timestamp>;
}

/// In-memory collection store with the rollback semantics of the replica-set
/// storage layer: a logical clock stamps every write, and `rollback_to`
/// reverts every revision above a stable timestamp.
#[derive(Clone)]
pub struct InMemoryCollection {
    inner: Arc<Mutex<Inner>>,
    docs_scanned: Arc<AtomicU64>,
}

struct Inner {
    tables: BTreeMap<TableName, BTreeMap<DocumentId, Document>>,
    next_id: u64,
    clock: u64,
}

impl InMemoryCollection {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                tables: BTreeMap::new(),
                next_id: 1,
                clock: 0,
            })),
            docs_scanned: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn insert(
        &self,
        table: &TableName,
        value: JsonValue,
    ) -> anyhow::Result<(DocumentId, Timestamp)> {
        let mut inner = self.inner.lock();
        let id = DocumentId::new(inner.next_id);
        inner.next_id += 1;
        inner.clock += 1;
        let ts = Timestamp::new(inner.clock);
        let document = Document::new(id, ts, value)?;
        inner
            .tables
            .entry(table.clone())
            .or_default()
            .insert(id, document);
        Ok((id, ts))
    }

    /// Replace a document's value, bumping its last-modified marker. The
    /// document keeps its id and thus its scan position.
    pub fn update(
        &self,
        table: &TableName,
        id: DocumentId,
        value: JsonValue,
    ) -> anyhow::Result<Timestamp> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let ts = Timestamp::new(inner.clock);
        let document = Document::new(id, ts, value)?;
        let not_found =
            || ErrorMetadata::not_found("DocumentNotFound", format!("No document {id} in {table}"));
        let Some(docs) = inner.tables.get_mut(table) else {
            anyhow::bail!(not_found());
        };
        anyhow::ensure!(docs.contains_key(&id), not_found());
        docs.insert(id, document);
        Ok(ts)
    }

    /// Revert every revision with a last-modified marker strictly above
    /// `stable_ts`, as the rollback subsystem does. Returns the number of
    /// documents reverted.
    pub fn rollback_to(&self, stable_ts: Timestamp) -> usize {
        let mut inner = self.inner.lock();
        let mut reverted = 0;
        for docs in inner.tables.values_mut() {
            let before = docs.len();
            docs.retain(|_, doc| doc.ts() <= stable_ts);
            reverted += before - docs.len();
        }
        reverted
    }

    /// Total number of documents handed out by `scan_after` since this
    /// collection was created. Used by tests asserting exactly-once scans.
    pub fn docs_scanned(&self) -> u64 {
        self.docs_scanned.load(Ordering::SeqCst)
    }

    /// The clock's current value, without going through the async reader.
    pub fn current_ts(&self) -> Timestamp {
        Timestamp::new(self.inner.lock().clock)
    }

    /// Snapshot of a table's contents, without touching the scan counter.
    pub fn all_docs(&self, table: &TableName) -> Vec<Document> {
        let inner = self.inner.lock();
        inner
            .tables
            .get(table)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryCollection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CollectionReader for InMemoryCollection {
    async fn scan_after(
        &self,
        table: &TableName,
        cursor: Option<DocumentId>,
        limit: usize,
    ) -> anyhow::Result<Vec<Document>> {
        let inner = self.inner.lock();
        let lower = match cursor {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let docs: Vec<Document> = inner
            .tables
            .get(table)
            .map(|docs| {
                docs.range((lower, Bound::Unbounded))
                    .take(limit)
                    .map(|(_, doc)| doc.clone())
                    .collect()
            })
            .unwrap_or_default();
        self.docs_scanned
            .fetch_add(docs.len() as u64, Ordering::SeqCst);
        Ok(docs)
    }

    async fn changes_since(
        &self,
        table: &TableName,
        ts: Timestamp,
    ) -> anyhow::Result<Vec<Document>> {
        let inner = self.inner.lock();
        Ok(inner
            .tables
            .get(table)
            .map(|docs| {
                docs.values()
                    .filter(|doc| doc.ts() > ts)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, table: &TableName) -> anyhow::Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.tables.get(table).map(BTreeMap::len).unwrap_or(0) as u64)
    }

    async fn latest_ts(&self) -> anyhow::Result<Timestamp> {
        let inner = self.inner.lock();
        Ok(Timestamp::new(inner.clock))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::collection::{
        CollectionReader,
        InMemoryCollection,
    };

    #[tokio::test]
    async fn test_scan_order_is_stable_across_cursors() -> anyhow::Result<()> {
        let collection = InMemoryCollection::new();
        let table = "messages".parse()?;
        for i in 0..5 {
            collection.insert(&table, json!({"a": i}))?;
        }
        let first = collection.scan_after(&table, None, 2).await?;
        assert_eq!(first.len(), 2);
        let rest = collection
            .scan_after(&table, Some(first[1].id()), 10)
            .await?;
        assert_eq!(rest.len(), 3);
        assert!(first[1].id() < rest[0].id());
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_reverts_only_recent_revisions() -> anyhow::Result<()> {
        let collection = InMemoryCollection::new();
        let table = "messages".parse()?;
        let (_, ts1) = collection.insert(&table, json!({"a": 1}))?;
        let (id2, _) = collection.insert(&table, json!({"a": 2}))?;
        collection.update(&table, id2, json!({"a": 20}))?;

        assert_eq!(collection.rollback_to(ts1), 1);
        assert_eq!(collection.count(&table).await?, 1);
        assert!(collection.changes_since(&table, ts1).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_bumps_last_modified() -> anyhow::Result<()> {
        let collection = InMemoryCollection::new();
        let table = "messages".parse()?;
        let (id, ts) = collection.insert(&table, json!({"a": 1}))?;
        let ts2 = collection.update(&table, id, json!({"a": 2}))?;
        assert!(ts2 > ts);
        let changed = collection.changes_since(&table, ts).await?;
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id(), id);
        Ok(())
    }
}
