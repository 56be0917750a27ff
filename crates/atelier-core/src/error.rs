//! Error types for the pipeline core
//!
//! Three audiences:
//! - [`PipelineError`]: per-item failures, recorded on the item and never
//!   propagated out of a batch run
//! - [`BatchError`]: batch-level conditions surfaced once to the caller
//! - [`CreditError`] / [`ConfigError`]: collaborator and setup failures
//!
//! Users only ever see [`PipelineError::user_message`]; the `Display` text
//! carries raw endpoint detail and is meant for logs.

use crate::types::{ItemId, ItemStatus};
use atelier_gen::GenerationError;
use atelier_store::{ObjectError, SnapshotError};
use std::path::PathBuf;

/// Per-item failure taxonomy
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Classification step failed; the item goes back to the queue
    #[error("analysis failed: {0}")]
    AnalysisFailed(#[source] GenerationError),

    /// Not enough credits for the remaining work
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u64, available: u64 },

    /// Every generation candidate was exhausted
    #[error("generation failed: {0}")]
    GenerationFailed(#[source] GenerationError),

    /// A multi-part item produced only some of its parts
    #[error("partial generation: {produced} of {expected} outputs")]
    PartialOutput { produced: u32, expected: u32 },

    /// Output was generated but could not be persisted
    #[error("storage upload failed: {0}")]
    StorageUploadFailed(#[source] ObjectError),

    /// Output is persisted but billing did not complete
    #[error("debit failed: {0}")]
    DebitFailed(#[source] CreditError),

    /// Source payload is gone (not in memory, not in the local cache)
    #[error("source payload unavailable")]
    SourceMissing,
}

impl PipelineError {
    /// Sanitized, actionable message for display
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::AnalysisFailed(_) => {
                "We couldn't identify the garment yet. It will be retried on the next run.".into()
            }
            Self::InsufficientCredits { required, available } => format!(
                "Not enough credits: this batch needs {required} and you have {available}."
            ),
            Self::GenerationFailed(e) if e.was_refused() => {
                "The image couldn't be processed. Try a different photo with the garment clearly visible."
                    .into()
            }
            Self::GenerationFailed(e) if e.is_outage() => {
                "The generation service is temporarily unavailable. Please retry in a few minutes."
                    .into()
            }
            Self::GenerationFailed(_) | Self::PartialOutput { .. } => {
                "Generation failed. Ensure the garment is clearly visible and well-lit, then retry."
                    .into()
            }
            Self::StorageUploadFailed(_) => {
                "Your result was generated but couldn't be saved. Please retry.".into()
            }
            Self::DebitFailed(_) => {
                "Your result is saved, but billing didn't complete. Our team will reconcile it."
                    .into()
            }
            Self::SourceMissing => {
                "The original image is no longer available on this device. Please re-upload it."
                    .into()
            }
        }
    }

    /// Whether retrying the item could succeed without user action
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AnalysisFailed(_) | Self::PartialOutput { .. } => true,
            Self::GenerationFailed(e) => e.is_outage(),
            Self::StorageUploadFailed(e) => e.is_retryable(),
            Self::DebitFailed(e) => e.is_retryable(),
            Self::InsufficientCredits { .. } | Self::SourceMissing => false,
        }
    }
}

/// Failures talking to the credit service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreditError {
    /// Service unreachable or timed out
    #[error("credit service unavailable: {0}")]
    Unavailable(String),

    /// Service refused the operation
    #[error("credit operation rejected: {0}")]
    Rejected(String),

    /// Server-side re-validation found the balance too low
    #[error("insufficient balance: {requested} requested, {available} available")]
    InsufficientBalance { requested: u64, available: u64 },
}

impl CreditError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Batch-level errors returned from orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// Pre-flight check found too few credits; nothing was generated
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u64, available: u64 },

    /// Every backend was unreachable; the pass halted
    #[error("generation endpoint outage while processing {item}")]
    EndpointOutage { item: ItemId },

    /// Another run is in progress on this batch
    #[error("a batch run is already in progress")]
    AlreadyRunning,

    /// The batch was cleared while the run was in flight
    #[error("batch was cleared during the run")]
    Cleared,

    /// Balance could not be checked
    #[error("balance check failed: {0}")]
    BalanceCheck(#[source] CreditError),

    /// No item with this id
    #[error("unknown item: {0}")]
    UnknownItem(ItemId),

    /// Item is not in a state that allows the operation
    #[error("item {id} is {status}")]
    InvalidState { id: ItemId, status: ItemStatus },

    /// Empty source payload
    #[error("source payload is empty")]
    EmptySource,

    /// Snapshot persistence failed
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Storage failed
    #[error("storage error: {0}")]
    Storage(#[from] ObjectError),
}

impl BatchError {
    /// Sanitized message for display
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::InsufficientCredits { required, available } => PipelineError::InsufficientCredits {
                required: *required,
                available: *available,
            }
            .user_message(),
            Self::EndpointOutage { .. } => {
                "The generation service is unavailable. Remaining items stay queued; retry later."
                    .into()
            }
            Self::AlreadyRunning => "A batch is already running.".into(),
            Self::Cleared => "The batch was cleared.".into(),
            Self::BalanceCheck(_) => {
                "We couldn't check your credit balance. Please retry.".into()
            }
            Self::UnknownItem(_) => "That item no longer exists.".into(),
            Self::InvalidState { status, .. } => format!("That item is {status}."),
            Self::EmptySource => "The image is empty.".into(),
            Self::Snapshot(_) | Self::Storage(_) => {
                "Something went wrong saving your work. Please retry.".into()
            }
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::EndpointOutage { .. } | Self::AlreadyRunning | Self::Snapshot(_) => true,
            Self::BalanceCheck(e) => e.is_retryable(),
            Self::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type alias for batch operations
pub type BatchResult<T> = Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_gen::{Attempt, BackendError};

    fn exhausted(error: BackendError) -> GenerationError {
        GenerationError::Exhausted {
            attempts: vec![Attempt {
                backend: "m".into(),
                error,
            }],
        }
    }

    #[test]
    fn user_messages_hide_raw_errors() {
        let raw = "HTTP 500 internal stack trace at line 42";
        let err = PipelineError::GenerationFailed(exhausted(BackendError::Rejected {
            status: 400,
            message: raw.into(),
        }));
        assert!(err.to_string().contains(raw));
        assert!(!err.user_message().contains(raw));
        assert!(err.user_message().contains("well-lit"));
    }

    #[test]
    fn refusal_and_outage_get_distinct_messages() {
        let refused = PipelineError::GenerationFailed(exhausted(BackendError::Refused {
            reason: "SAFETY".into(),
        }));
        let outage =
            PipelineError::GenerationFailed(exhausted(BackendError::Unavailable("503".into())));
        assert_ne!(refused.user_message(), outage.user_message());
        assert!(outage.is_retryable());
        assert!(!refused.is_retryable());
    }

    #[test]
    fn debit_failure_is_distinct_from_generation_failure() {
        let debit = PipelineError::DebitFailed(CreditError::Unavailable("timeout".into()));
        assert!(debit.user_message().contains("billing"));
        assert!(debit.is_retryable());
    }

    #[test]
    fn batch_errors_are_classified() {
        assert!(BatchError::AlreadyRunning.is_retryable());
        assert!(!BatchError::InsufficientCredits {
            required: 5,
            available: 1
        }
        .is_retryable());
        assert!(BatchError::InsufficientCredits {
            required: 5,
            available: 1
        }
        .user_message()
        .contains('5'));
    }
}
