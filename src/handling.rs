//! # Handling Result
//!
//! The three-valued outcome of processing a message. Every handler
//! invocation produces one of these, and the subscriber translates it into
//! the transport acknowledgment primitives:
//!
//! | Result               | Transport action        |
//! |----------------------|-------------------------|
//! | `Succeeded`          | ack                     |
//! | `FailedNoRetry`      | reject, no requeue      |
//! | `FailedRetryAllowed` | reject, requeue         |
//!
//! The enum is closed, so the acknowledgment mapping is total by
//! construction: there is no unreachable "unknown variant" arm to defend
//! against.

/// Outcome of handling a single message.
///
/// Reason-less failures carry `None` and allocate nothing; use the
/// `*_with` constructors to attach a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlingResult {
    /// Work is durably complete; the message can be removed from the queue.
    Succeeded,
    /// Processing failed and retrying cannot succeed (malformed payload,
    /// unroutable type, business-rule rejection). The message is rejected
    /// without requeue and dead-lettered where the broker is configured
    /// to do so.
    FailedNoRetry { reason: Option<String> },
    /// Processing failed transiently (downstream dependency unavailable).
    /// The message is rejected with requeue and becomes available for
    /// redelivery.
    FailedRetryAllowed { reason: Option<String> },
}

impl HandlingResult {
    /// Successful handling.
    pub fn succeeded() -> Self {
        Self::Succeeded
    }

    /// Permanent failure without a reason.
    pub fn failed_no_retry() -> Self {
        Self::FailedNoRetry { reason: None }
    }

    /// Permanent failure with a reason.
    pub fn failed_no_retry_with(reason: impl Into<String>) -> Self {
        Self::FailedNoRetry {
            reason: Some(reason.into()),
        }
    }

    /// Transient failure without a reason.
    pub fn failed_retry_allowed() -> Self {
        Self::FailedRetryAllowed { reason: None }
    }

    /// Transient failure with a reason.
    pub fn failed_retry_allowed_with(reason: impl Into<String>) -> Self {
        Self::FailedRetryAllowed {
            reason: Some(reason.into()),
        }
    }

    /// True iff the variant is `Succeeded`.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// The failure reason, if one was attached.
    pub fn fail_reason(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::FailedNoRetry { reason } | Self::FailedRetryAllowed { reason } => {
                reason.as_deref()
            }
        }
    }
}
