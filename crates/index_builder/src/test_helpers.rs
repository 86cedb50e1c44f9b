//! Shared fixtures for engine tests.

use std::{
    sync::Arc,
    time::Duration,
};

use common::{
    pause::{
        PauseClient,
        PauseController,
    },
    runtime::testing::TestRuntime,
    types::{
        IndexName,
        IndexedFields,
        TableName,
        Timestamp,
    },
};
use serde_json::json;

use crate::{
    checkpoints::TestCheckpointStore,
    collection::InMemoryCollection,
    coordinator::{
        BuildConfig,
        BuildCoordinator,
    },
    document::{
        DocumentId,
        IndexEntry,
    },
    interrupt::InterruptController,
    metadata::BuildId,
};

pub fn test_table() -> TableName {
    "messages".parse().expect("static table name is valid")
}

pub fn test_index_name() -> IndexName {
    "messages.by_a".parse().expect("static index name is valid")
}

pub fn test_fields() -> IndexedFields {
    vec!["a".parse().expect("static field path is valid")]
        .try_into()
        .expect("static field list is valid")
}

/// A configuration with single-document chunks and millisecond backoffs, so
/// tests drive every chunk boundary deterministically and fail fast.
pub fn small_config() -> BuildConfig {
    BuildConfig {
        scan_chunk_size: 1,
        bulk_flush_chunk_size: 2,
        sleep_time: Duration::ZERO,
        checkpoint_max_retries: 3,
        checkpoint_initial_backoff: Duration::from_millis(1),
        checkpoint_max_backoff: Duration::from_millis(5),
        interrupt_timeout: Duration::from_secs(5),
        build_initial_backoff: Duration::from_millis(1),
        build_max_backoff: Duration::from_millis(10),
        max_failures: 8,
        restart_on_invalid: true,
    }
}

pub struct EngineFixtures {
    pub rt: TestRuntime,
    pub collection: InMemoryCollection,
    pub checkpoints: TestCheckpointStore,
    pub coordinator: BuildCoordinator<TestRuntime>,
    pub controller: InterruptController<TestRuntime>,
}

impl EngineFixtures {
    /// Fixtures with no registered pause points: every pause label continues
    /// immediately.
    pub fn new() -> Self {
        Self::with_client(PauseClient::new(), small_config())
    }

    pub fn with_config(config: BuildConfig) -> Self {
        Self::with_client(PauseClient::new(), config)
    }

    /// Fixtures plus a controller holding the given breakpoints. Every hit of
    /// a registered label blocks until the test unpauses it.
    pub fn with_pause(labels: &[&'static str]) -> (Self, PauseController) {
        Self::with_pause_and_config(labels, small_config())
    }

    pub fn with_pause_and_config(
        labels: &[&'static str],
        config: BuildConfig,
    ) -> (Self, PauseController) {
        let (controller, client) = PauseController::new(labels.iter().copied());
        (Self::with_client(client, config), controller)
    }

    fn with_client(pause: PauseClient, config: BuildConfig) -> Self {
        let rt = TestRuntime::new();
        let collection = InMemoryCollection::new();
        let checkpoints = TestCheckpointStore::new();
        let coordinator = BuildCoordinator::with_config(
            rt.clone(),
            Arc::new(collection.clone()),
            Arc::new(checkpoints.clone()),
            pause,
            config,
        );
        let controller = coordinator.interrupt_controller();
        Self {
            rt,
            collection,
            checkpoints,
            coordinator,
            controller,
        }
    }

    /// Insert documents `{"a": 1} .. {"a": n}`, returning ids and timestamps.
    pub fn add_documents(&self, n: i64) -> anyhow::Result<Vec<(DocumentId, Timestamp)>> {
        (1..=n)
            .map(|i| self.collection.insert(&test_table(), json!({"a": i})))
            .collect()
    }

    pub async fn start_default_build(&self) -> anyhow::Result<BuildId> {
        self.coordinator
            .start_build(test_index_name(), test_fields())
            .await
    }

    /// The index entries the committed index must contain given the
    /// collection's current contents.
    pub fn expected_entries(&self) -> Vec<IndexEntry> {
        let mut entries: Vec<IndexEntry> = self
            .collection
            .all_docs(&test_table())
            .iter()
            .map(|doc| IndexEntry {
                key: doc.index_key(&test_fields()),
                id: doc.id(),
            })
            .collect();
        entries.sort();
        entries
    }

    /// Assert the committed index exactly reflects the collection's current
    /// contents.
    pub fn assert_index_matches_collection(&self) {
        let committed = self
            .coordinator
            .index_store()
            .committed(&test_index_name())
            .expect("index should be committed");
        assert_eq!(committed.entries, self.expected_entries());
    }
}
