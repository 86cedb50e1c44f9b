use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use common::{
    backoff::Backoff,
    errors::report_error,
    knobs::{
        CHECKPOINT_WRITE_INITIAL_BACKOFF,
        CHECKPOINT_WRITE_MAX_BACKOFF,
        CHECKPOINT_WRITE_MAX_RETRIES,
        INDEX_BUILD_INITIAL_BACKOFF,
        INDEX_BUILD_MAX_BACKOFF,
        INDEX_BUILD_MAX_FAILURES,
        INDEX_BUILD_RESTART_ON_INVALID,
        INDEX_BUILD_SLEEP_TIME,
        INDEX_BULK_FLUSH_CHUNK_SIZE,
        INDEX_SCAN_CHUNK_SIZE,
        INTERRUPT_CHECKPOINT_TIMEOUT,
    },
    pause::PauseClient,
    runtime::{
        Runtime,
        SpawnHandle,
    },
    types::{
        IndexName,
        IndexedFields,
        Timestamp,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    checkpoints::{
        CheckpointStore,
        ProgressMarker,
    },
    collection::CollectionReader,
    index_store::IndexStore,
    interrupt::{
        InterruptController,
        StopFlag,
        StopReason,
    },
    metadata::{
        BuildId,
        BuildMetadata,
        BuildState,
        BuildStatus,
    },
    state_machine::{
        BuildExecutor,
        RunOutcome,
    },
};

/// Per-coordinator tunables, defaulted from the environment knobs. Tests
/// override individual fields for determinism.
#[derive(Clone)]
pub struct BuildConfig {
    pub scan_chunk_size: usize,
    pub bulk_flush_chunk_size: usize,
    pub sleep_time: Duration,
    pub checkpoint_max_retries: u32,
    pub checkpoint_initial_backoff: Duration,
    pub checkpoint_max_backoff: Duration,
    pub interrupt_timeout: Duration,
    pub build_initial_backoff: Duration,
    pub build_max_backoff: Duration,
    pub max_failures: u32,
    pub restart_on_invalid: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            scan_chunk_size: *INDEX_SCAN_CHUNK_SIZE,
            bulk_flush_chunk_size: *INDEX_BULK_FLUSH_CHUNK_SIZE,
            sleep_time: *INDEX_BUILD_SLEEP_TIME,
            checkpoint_max_retries: *CHECKPOINT_WRITE_MAX_RETRIES,
            checkpoint_initial_backoff: *CHECKPOINT_WRITE_INITIAL_BACKOFF,
            checkpoint_max_backoff: *CHECKPOINT_WRITE_MAX_BACKOFF,
            interrupt_timeout: *INTERRUPT_CHECKPOINT_TIMEOUT,
            build_initial_backoff: *INDEX_BUILD_INITIAL_BACKOFF,
            build_max_backoff: *INDEX_BUILD_MAX_BACKOFF,
            max_failures: *INDEX_BUILD_MAX_FAILURES,
            restart_on_invalid: *INDEX_BUILD_RESTART_ON_INVALID,
        }
    }
}

struct BuildEntry<RT: Runtime> {
    metadata: BuildMetadata,
    stop: StopFlag,
    status: Arc<watch::Sender<BuildStatus>>,
    handle: Option<RT::Handle>,
}

struct Registry<RT: Runtime> {
    by_id: BTreeMap<BuildId, BuildEntry<RT>>,
    /// Active (non-terminal) builds, at most one per index name.
    active: BTreeMap<IndexName, BuildId>,
}

struct CoordinatorInner<RT: Runtime> {
    rt: RT,
    collection: Arc<dyn CollectionReader>,
    checkpoints: Arc<dyn CheckpointStore>,
    index_store: IndexStore,
    pause: PauseClient,
    config: BuildConfig,
    registry: Mutex<Registry<RT>>,
}

/// Top-level driver for index builds: accepts build requests, spawns each
/// build's executor on a dedicated task, exposes status, and owns the
/// registry the interrupt controller operates on.
pub struct BuildCoordinator<RT: Runtime> {
    inner: Arc<CoordinatorInner<RT>>,
}

impl<RT: Runtime> Clone for BuildCoordinator<RT> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<RT: Runtime> BuildCoordinator<RT> {
    pub fn new(
        rt: RT,
        collection: Arc<dyn CollectionReader>,
        checkpoints: Arc<dyn CheckpointStore>,
        pause: PauseClient,
    ) -> Self {
        Self::with_config(rt, collection, checkpoints, pause, BuildConfig::default())
    }

    pub fn with_config(
        rt: RT,
        collection: Arc<dyn CollectionReader>,
        checkpoints: Arc<dyn CheckpointStore>,
        pause: PauseClient,
        config: BuildConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                rt,
                collection,
                checkpoints,
                index_store: IndexStore::new(),
                pause,
                config,
                registry: Mutex::new(Registry {
                    by_id: BTreeMap::new(),
                    active: BTreeMap::new(),
                }),
            }),
        }
    }

    pub fn interrupt_controller(&self) -> InterruptController<RT> {
        InterruptController::new(self.clone())
    }

    pub fn index_store(&self) -> &IndexStore {
        &self.inner.index_store
    }

    /// Accept a build request. Fails with a conflict if an active build
    /// already exists for the same index.
    pub async fn start_build(
        &self,
        index_name: IndexName,
        fields: IndexedFields,
    ) -> anyhow::Result<BuildId> {
        let created_ts = self.inner.collection.latest_ts().await?;
        let build_id = BuildId::new(self.inner.rt.new_uuid_v4());
        {
            let mut registry = self.inner.registry.lock();
            anyhow::ensure!(
                !registry.active.contains_key(&index_name),
                ErrorMetadata::conflict(
                    "IndexBuildConflict",
                    format!("An index build for {index_name} is already in progress"),
                )
            );
            let (status_tx, _status_rx) = watch::channel(BuildStatus::new());
            registry.by_id.insert(
                build_id,
                BuildEntry {
                    metadata: BuildMetadata {
                        id: build_id,
                        index_name: index_name.clone(),
                        fields,
                        created_ts,
                    },
                    stop: StopFlag::new(),
                    status: Arc::new(status_tx),
                    handle: None,
                },
            );
            registry.active.insert(index_name.clone(), build_id);
        }
        tracing::info!("Accepted index build {build_id} for {index_name}");
        self.spawn_executor(build_id, ProgressMarker::Setup);
        Ok(build_id)
    }

    /// Read-only, non-blocking status snapshot.
    pub fn status(&self, build_id: BuildId) -> anyhow::Result<BuildStatus> {
        let registry = self.inner.registry.lock();
        let entry = registry.by_id.get(&build_id).ok_or_else(|| {
            ErrorMetadata::not_found("BuildNotFound", format!("No build {build_id}"))
        })?;
        let status = entry.status.borrow().clone();
        Ok(status)
    }

    /// Request cancellation. Running builds honor the request at their next
    /// checkpoint-safe point; suspended builds abort immediately.
    pub async fn abort(&self, build_id: BuildId) -> anyhow::Result<()> {
        let (state, stop) = {
            let registry = self.inner.registry.lock();
            let entry = registry.by_id.get(&build_id).ok_or_else(|| {
                ErrorMetadata::not_found("BuildNotFound", format!("No build {build_id}"))
            })?;
            let state = entry.status.borrow().state.clone();
            (state, entry.stop.clone())
        };
        match state {
            BuildState::Running => {
                stop.set(StopReason::Abort);
                Ok(())
            },
            BuildState::Suspended { .. } => {
                self.finalize_abort(
                    build_id,
                    &anyhow::Error::from(ErrorMetadata::user_aborted(
                        "BuildAborted",
                        "Build aborted while suspended",
                    )),
                )
                .await;
                Ok(())
            },
            BuildState::Done | BuildState::Aborted { .. } => Ok(()),
        }
    }

    /// Wait until the build reaches `Done` or `Aborted` and return the final
    /// status.
    pub async fn wait_for_terminal(&self, build_id: BuildId) -> anyhow::Result<BuildStatus> {
        let mut rx = self.subscribe(build_id)?;
        let status = rx.wait_for(|status| status.state.is_terminal()).await?;
        Ok(status.clone())
    }

    pub(crate) fn runtime(&self) -> &RT {
        &self.inner.rt
    }

    pub(crate) fn config(&self) -> &BuildConfig {
        &self.inner.config
    }

    pub(crate) fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.checkpoints
    }

    pub(crate) fn subscribe(
        &self,
        build_id: BuildId,
    ) -> anyhow::Result<watch::Receiver<BuildStatus>> {
        let registry = self.inner.registry.lock();
        let entry = registry.by_id.get(&build_id).ok_or_else(|| {
            ErrorMetadata::not_found("BuildNotFound", format!("No build {build_id}"))
        })?;
        Ok(entry.status.subscribe())
    }

    pub(crate) fn running_builds(&self) -> Vec<(BuildId, StopFlag)> {
        let registry = self.inner.registry.lock();
        registry
            .by_id
            .iter()
            .filter(|(_, entry)| matches!(entry.status.borrow().state, BuildState::Running))
            .map(|(id, entry)| (*id, entry.stop.clone()))
            .collect()
    }

    pub(crate) fn suspended_builds(&self) -> Vec<BuildId> {
        let registry = self.inner.registry.lock();
        registry
            .by_id
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.status.borrow().state, BuildState::Suspended { .. })
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn clear_stop(&self, build_id: BuildId) {
        let registry = self.inner.registry.lock();
        if let Some(entry) = registry.by_id.get(&build_id) {
            entry.stop.clear();
        }
    }

    /// Abort a running executor's task without waiting for cooperation. Used
    /// only when a build failed to quiesce within the interrupt bound.
    pub(crate) fn kill_executor(&self, build_id: BuildId) {
        let handle = {
            let mut registry = self.inner.registry.lock();
            registry
                .by_id
                .get_mut(&build_id)
                .and_then(|entry| entry.handle.take())
        };
        if let Some(mut handle) = handle {
            handle.shutdown();
        }
    }

    /// Spawn a fresh executor task for the build, starting from `progress`.
    pub(crate) fn spawn_executor(&self, build_id: BuildId, progress: ProgressMarker) {
        let (metadata, stop, status) = {
            let registry = self.inner.registry.lock();
            let Some(entry) = registry.by_id.get(&build_id) else {
                tracing::error!("Cannot spawn executor for unknown build {build_id}");
                return;
            };
            entry.status.send_replace(BuildStatus {
                phase: progress.phase(),
                state: BuildState::Running,
            });
            (
                entry.metadata.clone(),
                entry.stop.clone(),
                entry.status.clone(),
            )
        };
        let this = self.clone();
        let handle = self.inner.rt.spawn("index_build", async move {
            this.drive(metadata, stop, status, progress).await;
        });
        let mut registry = self.inner.registry.lock();
        if let Some(entry) = registry.by_id.get_mut(&build_id) {
            entry.handle = Some(handle);
        }
    }

    /// The executor's retry loop: run phases until the build completes,
    /// suspends, or fails fatally. Non-fatal failures back off and resume
    /// from the latest durable checkpoint.
    async fn drive(
        &self,
        metadata: BuildMetadata,
        stop: StopFlag,
        status: Arc<watch::Sender<BuildStatus>>,
        mut progress: ProgressMarker,
    ) {
        let build_id = metadata.id;
        let mut backoff = Backoff::new(
            self.inner.config.build_initial_backoff,
            self.inner.config.build_max_backoff,
        );
        loop {
            let executor = BuildExecutor {
                rt: self.inner.rt.clone(),
                build: metadata.clone(),
                collection: self.inner.collection.clone(),
                checkpoints: self.inner.checkpoints.clone(),
                index_store: self.inner.index_store.clone(),
                pause: self.inner.pause.clone(),
                stop: stop.clone(),
                status: status.clone(),
                config: self.inner.config.clone(),
            };
            match executor.run(progress.clone()).await {
                Ok(RunOutcome::Completed | RunOutcome::Aborted) => {
                    self.release_active(build_id);
                    return;
                },
                // Resumption spawns a fresh driver; this task is done.
                Ok(RunOutcome::Suspended) => return,
                Err(e) => {
                    if e.is_persistence_failure() {
                        self.finalize_abort(build_id, &e).await;
                        return;
                    }
                    if backoff.failures() >= self.inner.config.max_failures {
                        let e = e.context(format!(
                            "Index build {build_id} failed {} times",
                            backoff.failures(),
                        ));
                        self.finalize_abort(build_id, &e).await;
                        return;
                    }
                    let mut e = e.context(format!("Index build {build_id} died"));
                    report_error(&mut e).await;
                    let delay = self.inner.rt.with_rng(|rng| backoff.fail(rng));
                    tracing::error!(
                        "Index build {build_id} died, num_failures: {}. Backing off for {}ms",
                        backoff.failures(),
                        delay.as_millis(),
                    );
                    self.inner.rt.wait(delay).await;
                    progress = match self
                        .inner
                        .checkpoints
                        .latest_valid(build_id, Timestamp::MAX)
                        .await
                    {
                        Ok(Some(checkpoint)) => checkpoint.progress,
                        Ok(None) => ProgressMarker::Setup,
                        Err(e) => {
                            tracing::error!(
                                "Failed to load checkpoint for build {build_id}, restarting \
                                 from setup: {e:#}",
                            );
                            ProgressMarker::Setup
                        },
                    };
                },
            }
        }
    }

    /// Mark a build terminally aborted: purge its durable and staged state
    /// and record the abort kind in its status.
    pub(crate) async fn finalize_abort(&self, build_id: BuildId, error: &anyhow::Error) {
        tracing::error!("Aborting build {build_id}: {error:#}");
        self.inner.index_store.drop_stage(build_id);
        if let Err(e) = self.inner.checkpoints.purge(build_id).await {
            tracing::error!("Failed to purge checkpoints for aborted build {build_id}: {e:#}");
        }
        let status = {
            let registry = self.inner.registry.lock();
            registry.by_id.get(&build_id).map(|e| e.status.clone())
        };
        if let Some(status) = status {
            let phase = status.borrow().phase;
            status.send_replace(BuildStatus {
                phase,
                state: BuildState::Aborted {
                    code: error.error_code(),
                    short_msg: error.short_msg().to_owned(),
                },
            });
        }
        self.release_active(build_id);
    }

    /// Drop the build's claim on its index name so a new build may start.
    /// Status history stays queryable in the registry.
    fn release_active(&self, build_id: BuildId) {
        let mut registry = self.inner.registry.lock();
        let index_name = match registry.by_id.get_mut(&build_id) {
            Some(entry) => {
                entry.handle = None;
                entry.metadata.index_name.clone()
            },
            None => return,
        };
        if registry.active.get(&index_name) == Some(&build_id) {
            registry.active.remove(&index_name);
        }
    }
}
