use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};

/// Log an error at a severity matching its classification. Caller-caused
/// errors are expected in normal operation and log at warn; everything else
/// indicates an engine or storage fault.
pub async fn report_error(err: &mut anyhow::Error) {
    trace_error(err);

    // Yield in case this is during shutdown - at which point, errors being
    // reported explicitly aren't useful. Yielding allows tokio to complete a
    // cancellation.
    tokio::task::yield_now().await;
}

/// Synchronous variant of `report_error` for non-async contexts.
pub fn report_error_sync(err: &mut anyhow::Error) {
    trace_error(err);
}

fn trace_error(err: &mut anyhow::Error) {
    let err_for_tracing = format!("{err:#}").replace('\n', "\\n");
    let is_user_error = err
        .downcast_ref::<ErrorMetadata>()
        .map(ErrorMetadata::is_user_error)
        .unwrap_or(false);
    if is_user_error {
        tracing::warn!("Caught {} error: {err_for_tracing}", err.short_msg());
    } else {
        tracing::error!("Caught {} error: {err_for_tracing}", err.short_msg());
    }
    tracing::debug!("{err:?}");
}
