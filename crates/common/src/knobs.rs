//! Tunable limits and parameters for the index build engine.
//!
//! Every knob here should have a comment explaining what it's for and the
//! upper/lower bounds if applicable so an operator can adjust these safely
//! for a node if needed.
//!
//! All knobs can be overridden with an environment variable of the same name.

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Number of documents scanned per chunk during `CollectionScan`. Extracted
/// keys are staged and a checkpoint is taken after each chunk, so this bounds
/// both re-scan work after a resume and the latency of honoring a suspension
/// or abort request.
pub static INDEX_SCAN_CHUNK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEX_SCAN_CHUNK_SIZE", 256));

/// Number of sorted index entries flushed per chunk during `BulkLoad`.
pub static INDEX_BULK_FLUSH_CHUNK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEX_BULK_FLUSH_CHUNK_SIZE", 1024));

/// Optional sleep between scan chunks, to throttle builds on overloaded
/// nodes. Zero disables the throttle.
pub static INDEX_BUILD_SLEEP_TIME: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("INDEX_BUILD_SLEEP_TIME_MS", 0)));

/// Transient checkpoint-write failures are retried this many times before
/// escalating to a fatal persistence failure.
pub static CHECKPOINT_WRITE_MAX_RETRIES: LazyLock<u32> =
    LazyLock::new(|| env_config("CHECKPOINT_WRITE_MAX_RETRIES", 3));

/// Initial backoff between checkpoint-write retries.
pub static CHECKPOINT_WRITE_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("CHECKPOINT_WRITE_INITIAL_BACKOFF_MS", 50)));

/// Maximum backoff between checkpoint-write retries.
pub static CHECKPOINT_WRITE_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("CHECKPOINT_WRITE_MAX_BACKOFF_MS", 2000)));

/// How long `on_interrupt` waits for a build to quiesce with a durable
/// checkpoint before declaring the suspension unsafe and aborting the build.
pub static INTERRUPT_CHECKPOINT_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("INTERRUPT_CHECKPOINT_TIMEOUT_SECS", 5)));

/// Initial backoff after an executor failure that wasn't caused by an
/// interruption or abort.
pub static INDEX_BUILD_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("INDEX_BUILD_INITIAL_BACKOFF_MS", 500)));

/// Maximum backoff after repeated executor failures.
pub static INDEX_BUILD_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("INDEX_BUILD_MAX_BACKOFF_SECS", 30)));

/// Number of consecutive non-fatal executor failures tolerated before the
/// build is aborted.
pub static INDEX_BUILD_MAX_FAILURES: LazyLock<u32> =
    LazyLock::new(|| env_config("INDEX_BUILD_MAX_FAILURES", 8));

/// When every checkpoint for a build has been invalidated by a rollback, the
/// build restarts from `Setup` if true, and aborts if false.
pub static INDEX_BUILD_RESTART_ON_INVALID: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEX_BUILD_RESTART_ON_INVALID", true));
