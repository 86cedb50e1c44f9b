//! Property tests randomizing where an interruption lands during the scan.

use common::pause::{
    PauseController,
    PauseGuard,
};
use proptest::prelude::*;

use crate::{
    interrupt::InterruptionEvent,
    metadata::{
        BuildId,
        BuildState,
    },
    state_machine::DURING_COLLECTION_SCAN_LABEL,
    test_helpers::EngineFixtures,
};

/// Wait for the build to hit the scan pause point, or `None` once it is past
/// the scan and runs to completion.
async fn next_scan_pause<'a>(
    fx: &EngineFixtures,
    pause: &'a mut PauseController,
    build_id: BuildId,
) -> anyhow::Result<Option<PauseGuard<'a>>> {
    if fx.coordinator.status(build_id)?.state.is_terminal() {
        return Ok(None);
    }
    tokio::select! {
        status = fx.coordinator.wait_for_terminal(build_id) => {
            status?;
            Ok(None)
        },
        guard = pause.wait_for_blocked(DURING_COLLECTION_SCAN_LABEL) => Ok(guard),
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 8, ..ProptestConfig::default() })]

    /// Whatever chunk boundary the interruption lands on, the resumed build
    /// commits exactly the key set of the collection.
    #[test]
    fn prop_interrupted_scan_commits_exact_key_set(
        num_docs in 1i64..12,
        interrupt_after in 0usize..12,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let (fx, mut pause) =
                EngineFixtures::with_pause(&[DURING_COLLECTION_SCAN_LABEL]);
            fx.add_documents(num_docs)?;
            let stable_ts = fx.collection.current_ts();
            let build_id = fx.start_default_build().await?;

            // Let `interrupt_after` chunks through, then suspend and resume
            // if the build is still scanning.
            for _ in 0..interrupt_after {
                match next_scan_pause(&fx, &mut pause, build_id).await? {
                    Some(mut guard) => guard.unpause(),
                    None => break,
                }
            }
            if let Some(mut guard) = next_scan_pause(&fx, &mut pause, build_id).await? {
                let (interrupted, ()) = tokio::join!(
                    fx.controller.handle_event(InterruptionEvent::StepDown),
                    async {
                        guard.unpause();
                    },
                );
                interrupted?;
                fx.controller
                    .handle_event(InterruptionEvent::RollbackComplete { stable_ts })
                    .await?;
            }

            // Drain any remaining scan pauses until the build finishes.
            loop {
                match next_scan_pause(&fx, &mut pause, build_id).await? {
                    Some(mut guard) => guard.unpause(),
                    None => break,
                }
            }

            let status = fx.coordinator.wait_for_terminal(build_id).await?;
            assert_eq!(status.state, BuildState::Done);
            fx.assert_index_matches_collection();
            anyhow::Ok(())
        })
        .unwrap();
    }
}
