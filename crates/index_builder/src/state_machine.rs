use std::{
    cmp,
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
    time::Duration,
};

use common::{
    backoff::Backoff,
    pause::{
        Fault,
        PauseClient,
    },
    runtime::Runtime,
    types::Timestamp,
};
use errors::ErrorMetadata;
use tokio::sync::watch;

use crate::{
    checkpoints::{
        CheckpointSeq,
        CheckpointStore,
        ProgressMarker,
    },
    collection::CollectionReader,
    coordinator::BuildConfig,
    document::{
        DocumentId,
        IndexEntry,
        IndexKey,
    },
    index_store::IndexStore,
    interrupt::{
        StopFlag,
        StopReason,
    },
    metadata::{
        BuildMetadata,
        BuildState,
        BuildStatus,
        IndexBuildPhase,
    },
};

/// Pause point immediately before the collection scan begins (fires on every
/// entry into the scan phase, including resumptions).
pub const BEFORE_COLLECTION_SCAN_LABEL: &str = "before_collection_scan";
/// Pause point before each staged chunk write during the collection scan.
pub const DURING_COLLECTION_SCAN_LABEL: &str = "during_collection_scan";
/// Pause point before each sorted-segment flush during bulk load.
pub const DURING_BULK_LOAD_LABEL: &str = "during_bulk_load";
/// Pause point inside commit, after the index is installed but before staged
/// state and checkpoints are cleaned up.
pub const DURING_COMMIT_LABEL: &str = "during_commit";

pub const PAUSE_LABELS: [&str; 4] = [
    BEFORE_COLLECTION_SCAN_LABEL,
    DURING_COLLECTION_SCAN_LABEL,
    DURING_BULK_LOAD_LABEL,
    DURING_COMMIT_LABEL,
];

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    Suspended,
    Aborted,
}

enum PhaseResult {
    Advance(ProgressMarker),
    Stop(RunOutcome),
}

/// Executes one build's phases on a dedicated task, logically single-threaded
/// with respect to its own state transitions. Interruption and abort requests
/// arrive through the shared [`StopFlag`] and are honored at phase entries
/// and chunk boundaries, never mid-write.
pub(crate) struct BuildExecutor<RT: Runtime> {
    pub rt: RT,
    pub build: BuildMetadata,
    pub collection: Arc<dyn CollectionReader>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub index_store: IndexStore,
    pub pause: PauseClient,
    pub stop: StopFlag,
    pub status: Arc<watch::Sender<BuildStatus>>,
    pub config: BuildConfig,
}

impl<RT: Runtime> BuildExecutor<RT> {
    /// Run from `start` until the build completes, suspends, or aborts.
    /// Suspension exits the task; resumption constructs a fresh executor from
    /// the stored checkpoint.
    pub(crate) async fn run(mut self, start: ProgressMarker) -> anyhow::Result<RunOutcome> {
        tracing::info!(
            "Index build {} for {} entering {} phase",
            self.build.id,
            self.build.index_name,
            start.phase(),
        );
        let mut progress = start;
        loop {
            self.set_running(progress.phase());
            if let Some(outcome) = self.check_stop(&progress).await? {
                return Ok(outcome);
            }
            let result = match progress.clone() {
                ProgressMarker::Setup => self.setup().await?,
                ProgressMarker::CollectionScan {
                    cursor,
                    docs_scanned,
                    reference_ts,
                } => {
                    self.collection_scan(cursor, docs_scanned, reference_ts)
                        .await?
                },
                ProgressMarker::BulkLoad {
                    keys_flushed,
                    reference_ts,
                } => self.bulk_load(keys_flushed, reference_ts).await?,
                ProgressMarker::Commit { reference_ts } => self.commit(reference_ts).await?,
            };
            match result {
                PhaseResult::Advance(next) => progress = next,
                PhaseResult::Stop(outcome) => return Ok(outcome),
            }
        }
    }

    async fn setup(&mut self) -> anyhow::Result<PhaseResult> {
        // A restarted build must not see staged progress from an invalidated
        // attempt.
        self.index_store.reset_stage(self.build.id);
        let total = self.collection.count(self.build.index_name.table()).await?;
        tracing::info!(
            "{total} documents to index for {} @ {}",
            self.build.index_name,
            self.build.created_ts,
        );
        self.save_checkpoint(ProgressMarker::Setup).await?;
        Ok(PhaseResult::Advance(ProgressMarker::CollectionScan {
            cursor: None,
            docs_scanned: 0,
            reference_ts: Timestamp::MIN,
        }))
    }

    async fn collection_scan(
        &mut self,
        mut cursor: Option<DocumentId>,
        mut docs_scanned: u64,
        mut reference_ts: Timestamp,
    ) -> anyhow::Result<PhaseResult> {
        // The stage may run ahead of the checkpoint this scan resumes from;
        // anything past the cursor is untrusted after an interruption.
        self.index_store
            .truncate_stage_to_cursor(self.build.id, cursor);

        let fault = self.pause.wait(BEFORE_COLLECTION_SCAN_LABEL).await;
        fault_into_result(fault)?;

        let table = self.build.index_name.table().clone();
        let mut last_logged = self.rt.monotonic_now();
        loop {
            let marker = ProgressMarker::CollectionScan {
                cursor,
                docs_scanned,
                reference_ts,
            };
            if let Some(outcome) = self.check_stop(&marker).await? {
                return Ok(PhaseResult::Stop(outcome));
            }

            let docs = self
                .collection
                .scan_after(&table, cursor, self.config.scan_chunk_size)
                .await?;
            if docs.is_empty() {
                tracing::info!(
                    "Scanned {docs_scanned} documents for {} (reference ts {reference_ts})",
                    self.build.index_name,
                );
                let next = ProgressMarker::BulkLoad {
                    keys_flushed: 0,
                    reference_ts,
                };
                self.save_checkpoint(next.clone()).await?;
                return Ok(PhaseResult::Advance(next));
            }

            let entries: Vec<IndexEntry> = docs
                .iter()
                .map(|doc| IndexEntry {
                    key: doc.index_key(&self.build.fields),
                    id: doc.id(),
                })
                .collect();
            let chunk_len = docs.len() as u64;
            let chunk_max_ts = docs
                .iter()
                .map(|doc| doc.ts())
                .max()
                .unwrap_or(Timestamp::MIN);
            let last_id = docs.last().map(|doc| doc.id());

            let fault = self.pause.wait(DURING_COLLECTION_SCAN_LABEL).await;
            fault_into_result(fault)?;
            // An interruption that arrived while execution was held at the
            // pause point stops the build before this chunk is staged.
            if let Some(outcome) = self.check_stop(&marker).await? {
                return Ok(PhaseResult::Stop(outcome));
            }

            // The chunk is staged durably before the covering checkpoint is
            // taken, so a resumed scan can skip everything at or before the
            // cursor.
            self.index_store.spill_chunk(self.build.id, entries)?;
            cursor = last_id;
            docs_scanned += chunk_len;
            reference_ts = cmp::max(reference_ts, chunk_max_ts);
            self.save_checkpoint(ProgressMarker::CollectionScan {
                cursor,
                docs_scanned,
                reference_ts,
            })
            .await?;

            if last_logged.elapsed() >= PROGRESS_LOG_INTERVAL {
                tracing::info!(
                    "Scanned {docs_scanned} documents for {}",
                    self.build.index_name,
                );
                last_logged = self.rt.monotonic_now();
            }
            if !self.config.sleep_time.is_zero() {
                self.rt.wait(self.config.sleep_time).await;
            }
        }
    }

    async fn bulk_load(
        &mut self,
        keys_flushed: u64,
        reference_ts: Timestamp,
    ) -> anyhow::Result<PhaseResult> {
        // The spilled key set iterates in sorted order and the sort is
        // deterministic, so a resumed load re-derives the same sequence and
        // only the unflushed tail needs writing.
        let sorted = self.index_store.spilled(self.build.id);
        let total = sorted.len() as u64;
        let mut flushed = keys_flushed;
        tracing::info!(
            "Bulk loading {total} index entries for {} ({flushed} already flushed)",
            self.build.index_name,
        );
        while flushed < total {
            let marker = ProgressMarker::BulkLoad {
                keys_flushed: flushed,
                reference_ts,
            };
            if let Some(outcome) = self.check_stop(&marker).await? {
                return Ok(PhaseResult::Stop(outcome));
            }

            let fault = self.pause.wait(DURING_BULK_LOAD_LABEL).await;
            fault_into_result(fault)?;
            if let Some(outcome) = self.check_stop(&marker).await? {
                return Ok(PhaseResult::Stop(outcome));
            }

            let end = cmp::min(flushed + self.config.bulk_flush_chunk_size as u64, total);
            let chunk = sorted[flushed as usize..end as usize].to_vec();
            flushed = self
                .index_store
                .flush_sorted_chunk(self.build.id, flushed, chunk)?;
            self.save_checkpoint(ProgressMarker::BulkLoad {
                keys_flushed: flushed,
                reference_ts,
            })
            .await?;
        }
        let next = ProgressMarker::Commit { reference_ts };
        self.save_checkpoint(next.clone()).await?;
        Ok(PhaseResult::Advance(next))
    }

    /// Commit is a pure function of the flushed prefix and the collection's
    /// current contents, so re-running it after an interruption produces a
    /// result identical to an uninterrupted commit.
    async fn commit(&mut self, reference_ts: Timestamp) -> anyhow::Result<PhaseResult> {
        let table = self.build.index_name.table().clone();
        let flushed = self.index_store.flushed(self.build.id);

        // Fold in revisions that landed after the scan's reference point. The
        // committed index must reflect the collection's final contents.
        let catchup = self.collection.changes_since(&table, reference_ts).await?;
        if !catchup.is_empty() {
            tracing::info!(
                "Folding {} post-scan revisions into {}",
                catchup.len(),
                self.build.index_name,
            );
        }
        let mut by_id: BTreeMap<DocumentId, IndexKey> =
            flushed.into_iter().map(|e| (e.id, e.key)).collect();
        for doc in catchup {
            by_id.insert(doc.id(), doc.index_key(&self.build.fields));
        }
        let entries: Vec<IndexEntry> = by_id
            .into_iter()
            .map(|(id, key)| IndexEntry { key, id })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let num_entries = entries.len();

        self.index_store.install(
            self.build.index_name.clone(),
            self.build.fields.clone(),
            entries,
        )?;

        let fault = self.pause.wait(DURING_COMMIT_LABEL).await;
        fault_into_result(fault)?;

        self.index_store.drop_stage(self.build.id);
        self.checkpoints.purge(self.build.id).await?;
        tracing::info!(
            "Finished build of index {} ({num_entries} entries)",
            self.build.index_name,
        );
        self.status.send_replace(BuildStatus {
            phase: IndexBuildPhase::Commit,
            state: BuildState::Done,
        });
        Ok(PhaseResult::Stop(RunOutcome::Completed))
    }

    /// Honor a pending stop request at a checkpoint-safe point. Suspension
    /// guarantees the latest progress is durable before the state transition
    /// completes; an abort purges all build state.
    async fn check_stop(
        &mut self,
        progress: &ProgressMarker,
    ) -> anyhow::Result<Option<RunOutcome>> {
        match self.stop.check() {
            None => Ok(None),
            Some(StopReason::Suspend) => {
                // A scan that has not advanced past any document re-enters
                // from Setup; there is no position to resume.
                let marker = match progress {
                    ProgressMarker::CollectionScan { cursor: None, .. } => ProgressMarker::Setup,
                    other => other.clone(),
                };
                self.save_checkpoint(marker.clone()).await?;
                tracing::info!(
                    "Suspending index build {} in {} phase",
                    self.build.id,
                    marker.phase(),
                );
                self.status.send_replace(BuildStatus {
                    phase: progress.phase(),
                    state: BuildState::Suspended {
                        resume_from: marker.phase(),
                    },
                });
                Ok(Some(RunOutcome::Suspended))
            },
            Some(StopReason::Abort) => {
                tracing::info!("Aborting index build {} on request", self.build.id);
                self.index_store.drop_stage(self.build.id);
                if let Err(e) = self.checkpoints.purge(self.build.id).await {
                    tracing::error!("Failed to purge checkpoints for aborted build: {e:#}");
                }
                self.status.send_replace(BuildStatus {
                    phase: progress.phase(),
                    state: BuildState::Aborted {
                        code: Some(errors::ErrorCode::UserAborted),
                        short_msg: "BuildAborted".to_owned(),
                    },
                });
                Ok(Some(RunOutcome::Aborted))
            },
        }
    }

    /// Persist a checkpoint, retrying transient storage failures a bounded
    /// number of times before escalating to a fatal persistence failure.
    async fn save_checkpoint(&mut self, progress: ProgressMarker) -> anyhow::Result<CheckpointSeq> {
        let mut backoff = Backoff::new(
            self.config.checkpoint_initial_backoff,
            self.config.checkpoint_max_backoff,
        );
        loop {
            match self.checkpoints.save(self.build.id, progress.clone()).await {
                Ok(seq) => {
                    if backoff.failures() > 0 {
                        tracing::info!(
                            "Checkpoint write for {} recovered after {} retries",
                            self.build.id,
                            backoff.failures(),
                        );
                    }
                    return Ok(seq);
                },
                Err(e) => {
                    if backoff.failures() >= self.config.checkpoint_max_retries {
                        return Err(e.context(ErrorMetadata::persistence_failure(
                            "CheckpointPersistenceFailure",
                            format!(
                                "Failed to durably persist checkpoint for build {}",
                                self.build.id,
                            ),
                        )));
                    }
                    let delay = self.rt.with_rng(|rng| backoff.fail(rng));
                    tracing::warn!(
                        "Checkpoint write for {} failed (attempt {}), retrying in {}ms: {e:#}",
                        self.build.id,
                        backoff.failures(),
                        delay.as_millis(),
                    );
                    self.rt.wait(delay).await;
                },
            }
        }
    }

    fn set_running(&self, phase: IndexBuildPhase) {
        self.status.send_replace(BuildStatus {
            phase,
            state: BuildState::Running,
        });
    }
}

fn fault_into_result(fault: Fault) -> anyhow::Result<()> {
    match fault {
        Fault::Noop => Ok(()),
        Fault::Error(e) => Err(e),
    }
}
