use std::borrow::Cow;

pub const INTERNAL_ERROR: &str = "InternalError";
pub const INTERNAL_ERROR_MSG: &str = "An internal error occurred in the index build engine";

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object used across the
/// codebase to tag errors with information that is used to classify them.
///
/// The msg is conveyed as the operator-facing error message if the error
/// reaches a build's reported status.
///
/// The short_msg is used as a tag - available for tests and for log
/// filtering - that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching.
    /// Eg IndexBuildConflict
    pub short_msg: Cow<'static, str>,
    /// human readable - operator facing. Should be longer and descriptive.
    /// Eg "An index build for table.by_a is already in progress"
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    NotFound,

    /// A second build was requested for a (table, index) pair that already
    /// has an active build.
    Conflict,
    /// The checkpoint store could not durably persist a checkpoint. Fatal to
    /// the owning build.
    PersistenceFailure,
    /// Every checkpoint for a build was invalidated by a rollback.
    InvalidCheckpoint,
    /// The build was canceled by an explicit abort request.
    UserAborted,
}

impl ErrorMetadata {
    /// Malformed request. The short_msg should be CapitalCamelCased
    /// describing the error. The msg should be a descriptive message
    /// targeted toward the operator.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found (eg an unknown build id).
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A conflicting operation is already in progress.
    pub fn conflict(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Conflict,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Durability failure in the checkpoint store after bounded retries.
    pub fn persistence_failure(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::PersistenceFailure,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// No checkpoint survived a rollback's invalidation point.
    pub fn invalid_checkpoint(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidCheckpoint,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Explicit cancellation requested by the caller.
    pub fn user_aborted(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::UserAborted,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.code == ErrorCode::Conflict
    }

    pub fn is_persistence_failure(&self) -> bool {
        self.code == ErrorCode::PersistenceFailure
    }

    pub fn is_invalid_checkpoint(&self) -> bool {
        self.code == ErrorCode::InvalidCheckpoint
    }

    pub fn is_user_aborted(&self) -> bool {
        self.code == ErrorCode::UserAborted
    }

    /// True if this error was deterministically caused by the caller (as
    /// opposed to a fault inside the engine or its storage).
    pub fn is_user_error(&self) -> bool {
        match self.code {
            ErrorCode::BadRequest
            | ErrorCode::NotFound
            | ErrorCode::Conflict
            | ErrorCode::UserAborted => true,
            ErrorCode::PersistenceFailure | ErrorCode::InvalidCheckpoint => false,
        }
    }
}

/// Classification helpers for `anyhow::Error` chains that may carry an
/// `ErrorMetadata` context. Errors without one classify as internal.
pub trait ErrorMetadataAnyhowExt {
    fn is_bad_request(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_persistence_failure(&self) -> bool;
    fn is_invalid_checkpoint(&self) -> bool;
    fn is_user_aborted(&self) -> bool;

    /// Return the short_msg associated with this Error
    fn short_msg(&self) -> &str;

    /// Return the descriptive msg associated with this Error
    fn msg(&self) -> &str;

    /// Return the `ErrorCode`, if an `ErrorMetadata` is attached.
    fn error_code(&self) -> Option<ErrorCode>;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_bad_request(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bad_request();
        }
        false
    }

    fn is_not_found(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_found();
        }
        false
    }

    fn is_conflict(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_conflict();
        }
        false
    }

    fn is_persistence_failure(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_persistence_failure();
        }
        false
    }

    fn is_invalid_checkpoint(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_invalid_checkpoint();
        }
        false
    }

    fn is_user_aborted(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_user_aborted();
        }
        false
    }

    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_ERROR
    }

    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_ERROR_MSG
    }

    fn error_code(&self) -> Option<ErrorCode> {
        self.downcast_ref::<ErrorMetadata>().map(|e| e.code)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use crate::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
        INTERNAL_ERROR,
    };

    #[test]
    fn test_classification_survives_context() {
        let e: anyhow::Error = anyhow::anyhow!("disk write failed").context(
            ErrorMetadata::persistence_failure(
                "CheckpointPersistenceFailure",
                "Failed to durably persist checkpoint",
            ),
        );
        let e = e.context("IndexBuilder died");
        assert!(e.is_persistence_failure());
        assert!(!e.is_conflict());
        assert_eq!(e.short_msg(), "CheckpointPersistenceFailure");
    }

    #[test]
    fn test_untagged_error_is_internal() {
        let e = anyhow::anyhow!("some untagged failure");
        assert!(!e.is_persistence_failure());
        assert_eq!(e.short_msg(), INTERNAL_ERROR);
    }

    #[test]
    fn test_user_error_partition() {
        assert!(ErrorMetadata::conflict("C", "c").is_user_error());
        assert!(ErrorMetadata::user_aborted("A", "a").is_user_error());
        assert!(!ErrorMetadata::persistence_failure("P", "p").is_user_error());
        assert!(!ErrorMetadata::invalid_checkpoint("I", "i").is_user_error());
    }
}
