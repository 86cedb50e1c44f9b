use std::sync::Arc;

use common::{
    pause::PauseClient,
    runtime::testing::TestRuntime,
};
use errors::{
    ErrorCode,
    ErrorMetadataAnyhowExt,
};
use pretty_assertions::assert_eq;

use crate::{
    checkpoints::FileCheckpointStore,
    collection::InMemoryCollection,
    coordinator::BuildCoordinator,
    metadata::{
        BuildState,
        IndexBuildPhase,
    },
    state_machine::DURING_COLLECTION_SCAN_LABEL,
    test_helpers::{
        small_config,
        test_fields,
        test_index_name,
        EngineFixtures,
    },
};

mod property;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_index_build_completes() -> anyhow::Result<()> {
    init_tracing();
    let fx = EngineFixtures::new();
    fx.add_documents(5)?;
    let build_id = fx.start_default_build().await?;

    let status = fx.coordinator.wait_for_terminal(build_id).await?;
    assert_eq!(status.state, BuildState::Done);
    assert_eq!(status.phase, IndexBuildPhase::Commit);
    fx.assert_index_matches_collection();

    // Each document was scanned exactly once and checkpoints are gone.
    assert_eq!(fx.collection.docs_scanned(), 5);
    assert_eq!(fx.checkpoints.checkpoint_count(build_id), 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_collection_builds_empty_index() -> anyhow::Result<()> {
    init_tracing();
    let fx = EngineFixtures::new();
    let build_id = fx.start_default_build().await?;
    let status = fx.coordinator.wait_for_terminal(build_id).await?;
    assert_eq!(status.state, BuildState::Done);
    let committed = fx
        .coordinator
        .index_store()
        .committed(&test_index_name())
        .unwrap();
    assert!(committed.entries.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_start_build_conflict() -> anyhow::Result<()> {
    init_tracing();
    let fx = EngineFixtures::new();
    fx.add_documents(3)?;

    let (first, second) = tokio::join!(
        fx.coordinator.start_build(test_index_name(), test_fields()),
        fx.coordinator.start_build(test_index_name(), test_fields()),
    );
    let (winner, loser) = match (first, second) {
        (Ok(id), Err(e)) => (id, e),
        (Err(e), Ok(id)) => (id, e),
        other => panic!("Expected exactly one winner, got {other:?}"),
    };
    assert!(loser.is_conflict());
    assert_eq!(loser.short_msg(), "IndexBuildConflict");

    // Once the winner finishes, the pair is free again.
    fx.coordinator.wait_for_terminal(winner).await?;
    let second_build = fx.start_default_build().await?;
    let status = fx.coordinator.wait_for_terminal(second_build).await?;
    assert_eq!(status.state, BuildState::Done);
    Ok(())
}

#[tokio::test]
async fn test_status_for_unknown_build() -> anyhow::Result<()> {
    let fx = EngineFixtures::new();
    let bogus = crate::metadata::BuildId::new(uuid::Uuid::from_u128(42));
    let err = fx.coordinator.status(bogus).unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_abort_running_build() -> anyhow::Result<()> {
    init_tracing();
    let (fx, mut pause) = EngineFixtures::with_pause(&[DURING_COLLECTION_SCAN_LABEL]);
    fx.add_documents(3)?;
    let build_id = fx.start_default_build().await?;

    let mut guard = pause
        .wait_for_blocked(DURING_COLLECTION_SCAN_LABEL)
        .await
        .expect("build should reach the scan");
    fx.coordinator.abort(build_id).await?;
    guard.unpause();

    let status = fx.coordinator.wait_for_terminal(build_id).await?;
    assert_eq!(
        status.state,
        BuildState::Aborted {
            code: Some(ErrorCode::UserAborted),
            short_msg: "BuildAborted".to_owned(),
        },
    );
    assert_eq!(fx.checkpoints.checkpoint_count(build_id), 0);
    assert!(fx
        .coordinator
        .index_store()
        .committed(&test_index_name())
        .is_none());

    // Aborting a terminal build is a no-op, and the pair is free again.
    fx.coordinator.abort(build_id).await?;
    fx.start_default_build().await?;
    Ok(())
}

#[tokio::test]
async fn test_builds_on_distinct_indexes_are_independent() -> anyhow::Result<()> {
    init_tracing();
    let fx = EngineFixtures::new();
    fx.add_documents(4)?;

    let by_a = fx.start_default_build().await?;
    let by_b = fx
        .coordinator
        .start_build(
            "messages.by_b".parse()?,
            vec!["b".parse()?].try_into()?,
        )
        .await?;

    let status_a = fx.coordinator.wait_for_terminal(by_a).await?;
    let status_b = fx.coordinator.wait_for_terminal(by_b).await?;
    assert_eq!(status_a.state, BuildState::Done);
    assert_eq!(status_b.state, BuildState::Done);

    fx.assert_index_matches_collection();
    let by_b_index = fx
        .coordinator
        .index_store()
        .committed(&"messages.by_b".parse()?)
        .unwrap();
    assert_eq!(by_b_index.entries.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_persistent_checkpoint_failure_aborts_build() -> anyhow::Result<()> {
    init_tracing();
    let fx = EngineFixtures::new();
    fx.add_documents(3)?;
    // Every save fails: the very first Setup checkpoint exhausts its retries
    // and the failure is fatal.
    fx.checkpoints.fail_saves(u32::MAX);
    let build_id = fx.start_default_build().await?;

    let status = fx.coordinator.wait_for_terminal(build_id).await?;
    match status.state {
        BuildState::Aborted { code, short_msg } => {
            assert_eq!(code, Some(ErrorCode::PersistenceFailure));
            assert_eq!(short_msg, "CheckpointPersistenceFailure");
        },
        other => panic!("Expected persistence abort, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_transient_checkpoint_failures_are_retried() -> anyhow::Result<()> {
    init_tracing();
    let fx = EngineFixtures::new();
    fx.add_documents(3)?;
    // Fewer failures than the retry bound: the build rides them out.
    fx.checkpoints.fail_saves(2);
    let build_id = fx.start_default_build().await?;
    let status = fx.coordinator.wait_for_terminal(build_id).await?;
    assert_eq!(status.state, BuildState::Done);
    fx.assert_index_matches_collection();
    Ok(())
}

#[tokio::test]
async fn test_build_with_file_checkpoint_store() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let rt = TestRuntime::new();
    let collection = InMemoryCollection::new();
    let checkpoints = Arc::new(FileCheckpointStore::new(dir.path())?);
    let coordinator = BuildCoordinator::with_config(
        rt,
        Arc::new(collection.clone()),
        checkpoints,
        PauseClient::new(),
        small_config(),
    );

    for i in 1..=4 {
        collection.insert(&"messages".parse()?, serde_json::json!({"a": i}))?;
    }
    let build_id = coordinator
        .start_build(test_index_name(), test_fields())
        .await?;
    let status = coordinator.wait_for_terminal(build_id).await?;
    assert_eq!(status.state, BuildState::Done);

    let committed = coordinator
        .index_store()
        .committed(&test_index_name())
        .unwrap();
    assert_eq!(committed.entries.len(), 4);
    // Commit purged the build's checkpoint file.
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}
