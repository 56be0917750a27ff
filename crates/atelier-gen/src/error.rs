//! Error types for the generation adapter
//!
//! Two levels:
//! - [`BackendError`]: one candidate backend failed one call
//! - [`GenerationError`]: the adapter as a whole could not produce output

use std::fmt;

/// Failure of a single backend invocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Endpoint unreachable, rate limited, or returned a server error
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    /// Endpoint declined to answer (safety refusal, zero candidates)
    #[error("request refused: {reason}")]
    Refused { reason: String },

    /// Endpoint rejected the request as invalid
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Endpoint answered but nothing in the answer was usable
    #[error("no usable content: {0}")]
    NoUsableContent(String),

    /// Response body could not be decoded
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Backend is misconfigured (missing key, bad endpoint)
    #[error("backend misconfigured: {0}")]
    Misconfigured(String),
}

impl BackendError {
    /// Whether this failure says nothing about the request itself
    #[inline]
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// One failed attempt against one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// Backend name
    pub backend: String,
    /// Why it failed
    pub error: BackendError,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.error)
    }
}

/// Adapter-level errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Every candidate backend was tried and none produced output
    #[error("generation failed after {} attempt(s): {}", .attempts.len(), summarize(.attempts))]
    Exhausted { attempts: Vec<Attempt> },

    /// Adapter has no backends configured
    #[error("no generation backends configured")]
    NoBackends,

    /// Source payload is empty
    #[error("source payload is empty")]
    EmptySource,
}

impl GenerationError {
    /// True when every attempt failed at the transport level, i.e. the
    /// endpoint looks down rather than unwilling
    #[must_use]
    pub fn is_outage(&self) -> bool {
        match self {
            Self::Exhausted { attempts } => {
                !attempts.is_empty() && attempts.iter().all(|a| a.error.is_transport())
            }
            _ => false,
        }
    }

    /// True when at least one backend refused on safety grounds
    #[must_use]
    pub fn was_refused(&self) -> bool {
        matches!(self, Self::Exhausted { attempts } if attempts.iter().any(|a| matches!(a.error, BackendError::Refused { .. })))
    }
}

fn summarize(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for generation operations
pub type GenerationResult<T> = Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(error: BackendError) -> Attempt {
        Attempt {
            backend: "m".into(),
            error,
        }
    }

    #[test]
    fn outage_requires_all_transport_failures() {
        let all_down = GenerationError::Exhausted {
            attempts: vec![
                attempt(BackendError::Unavailable("503".into())),
                attempt(BackendError::Unavailable("timeout".into())),
            ],
        };
        assert!(all_down.is_outage());

        let mixed = GenerationError::Exhausted {
            attempts: vec![
                attempt(BackendError::Unavailable("503".into())),
                attempt(BackendError::Refused {
                    reason: "SAFETY".into(),
                }),
            ],
        };
        assert!(!mixed.is_outage());
        assert!(mixed.was_refused());

        assert!(!GenerationError::NoBackends.is_outage());
    }

    #[test]
    fn exhausted_display_lists_attempts() {
        let err = GenerationError::Exhausted {
            attempts: vec![attempt(BackendError::NoUsableContent("text only".into()))],
        };
        let s = err.to_string();
        assert!(s.contains("1 attempt"));
        assert!(s.contains("text only"));
    }
}
