use std::sync::Arc;

use common::{
    runtime::{
        Runtime,
        WithTimeout,
    },
    types::Timestamp,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;

use crate::{
    checkpoints::ProgressMarker,
    coordinator::BuildCoordinator,
    metadata::{
        BuildId,
        BuildState,
    },
};

/// An external signal that execution must stop or may resume, emitted by the
/// replica-set rollback subsystem.
#[derive(Clone, Debug)]
pub enum InterruptionEvent {
    /// Emitted before rollback begins: state at or after `reference_ts` may
    /// be reverted. Builds must suspend.
    RollbackStarting { reference_ts: Timestamp },
    /// Emitted after rollback finishes: every revision above `stable_ts` has
    /// been reverted. Suspended builds may resume.
    RollbackComplete { stable_ts: Timestamp },
    /// The node lost primary status. Builds must suspend; resume validity is
    /// decided by the following `RollbackComplete`.
    StepDown,
}

/// Why a build's executor has been asked to stop at its next safe point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Suspend,
    Abort,
}

/// Cooperative cancellation flag shared between a build's executor and the
/// notification paths. Checked at phase entries and chunk boundaries only,
/// never observed mid-write. First request wins.
#[derive(Clone, Default)]
pub struct StopFlag {
    inner: Arc<Mutex<Option<StopReason>>>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, reason: StopReason) {
        let mut guard = self.inner.lock();
        if guard.is_none() {
            *guard = Some(reason);
        }
    }

    pub(crate) fn check(&self) -> Option<StopReason> {
        *self.inner.lock()
    }

    pub(crate) fn clear(&self) {
        *self.inner.lock() = None;
    }
}

/// Bridges interruption events into the build executors: forces safe
/// suspension when an interruption arrives and drives resumption (or
/// abandonment) once the interrupting condition clears.
#[derive(Clone)]
pub struct InterruptController<RT: Runtime> {
    coordinator: BuildCoordinator<RT>,
}

impl<RT: Runtime> InterruptController<RT> {
    pub(crate) fn new(coordinator: BuildCoordinator<RT>) -> Self {
        Self { coordinator }
    }

    /// Dispatch an event from the rollback subsystem.
    pub async fn handle_event(&self, event: InterruptionEvent) -> anyhow::Result<()> {
        match event {
            InterruptionEvent::RollbackStarting { .. } | InterruptionEvent::StepDown => {
                self.on_interrupt(&event).await;
                Ok(())
            },
            InterruptionEvent::RollbackComplete { stable_ts } => {
                self.on_rollback_complete(stable_ts).await
            },
        }
    }

    /// Force every running build to a safe stop. Each build either reaches
    /// `Suspended` with a durable checkpoint within the bounded wait, or is
    /// aborted: an unsafe suspension is never permitted.
    pub async fn on_interrupt(&self, event: &InterruptionEvent) {
        tracing::info!("Interruption event: {event:?}");
        let running = self.coordinator.running_builds();
        for (build_id, stop) in &running {
            tracing::info!("Requesting suspension of build {build_id}");
            stop.set(StopReason::Suspend);
        }
        for (build_id, _) in running {
            let mut status_rx = match self.coordinator.subscribe(build_id) {
                Ok(rx) => rx,
                Err(_) => continue,
            };
            let quiesce = async {
                status_rx
                    .wait_for(|status| !matches!(status.state, BuildState::Running))
                    .await?;
                Ok(())
            };
            let timeout = self.coordinator.config().interrupt_timeout;
            if let Err(e) = self
                .coordinator
                .runtime()
                .with_timeout("interrupt_quiesce", timeout, quiesce)
                .await
            {
                // The executor did not quiesce with a durable checkpoint in
                // time. Suspending without one is not permitted, so the build
                // is killed and aborted.
                tracing::error!("Build {build_id} failed to quiesce, aborting: {e:#}");
                self.coordinator.kill_executor(build_id);
                self.coordinator
                    .finalize_abort(
                        build_id,
                        &anyhow::Error::from(ErrorMetadata::persistence_failure(
                            "UnsafeSuspension",
                            "Build could not take a durable checkpoint before suspension",
                        )),
                    )
                    .await;
            }
        }
    }

    /// The interrupting condition has cleared: resume every suspended build
    /// or abandon the ones that cannot be safely resumed.
    pub async fn on_rollback_complete(&self, stable_ts: Timestamp) -> anyhow::Result<()> {
        tracing::info!("Rollback complete at stable ts {stable_ts}");
        for build_id in self.coordinator.suspended_builds() {
            self.on_resume_opportunity(build_id, stable_ts).await?;
        }
        Ok(())
    }

    /// Resume one suspended build from its highest-sequence checkpoint that
    /// is still valid given `stable_ts`. If no checkpoint survived, the build
    /// restarts from `Setup`, or aborts when restart is disallowed by policy.
    pub async fn on_resume_opportunity(
        &self,
        build_id: BuildId,
        stable_ts: Timestamp,
    ) -> anyhow::Result<()> {
        let status = self.coordinator.status(build_id)?;
        if !matches!(status.state, BuildState::Suspended { .. }) {
            tracing::info!("Skipping resume of build {build_id} in state {:?}", status.state);
            return Ok(());
        }
        self.coordinator.clear_stop(build_id);

        match self
            .coordinator
            .checkpoint_store()
            .latest_valid(build_id, stable_ts)
            .await?
        {
            Some(checkpoint) => {
                tracing::info!(
                    "Resuming build {build_id} from checkpoint {} in {} phase",
                    checkpoint.seq,
                    checkpoint.phase,
                );
                self.coordinator
                    .spawn_executor(build_id, checkpoint.progress);
            },
            None => {
                if self.coordinator.config().restart_on_invalid {
                    tracing::warn!(
                        "NoValidCheckpoint: rollback to {stable_ts} invalidated every \
                         checkpoint of build {build_id}; restarting from setup",
                    );
                    self.coordinator.checkpoint_store().purge(build_id).await?;
                    self.coordinator
                        .spawn_executor(build_id, ProgressMarker::Setup);
                } else {
                    self.coordinator
                        .finalize_abort(
                            build_id,
                            &anyhow::Error::from(ErrorMetadata::invalid_checkpoint(
                                "NoValidCheckpoint",
                                format!(
                                    "Rollback to {stable_ts} invalidated every checkpoint and \
                                     restart is disabled",
                                ),
                            )),
                        )
                        .await;
                }
            },
        }
        Ok(())
    }
}
