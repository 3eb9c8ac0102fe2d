//! Retry decisions for failed transfer attempts.

use crate::error::{TransferError, TransferErrorKind};

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Try again straight away.
    Retry,
    /// Permanent: do not retry this repository in this run.
    Skip { reason: String },
    /// Attempts exhausted or a permanent failure; record and move on.
    GiveUp { reason: String },
}

/// Bounded retry policy. Pure: the decision depends only on the error and the
/// number of attempts made so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    limit: u32,
}

impl RetryPolicy {
    /// `limit` is the total number of attempts per repository (at least 1).
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Decide after attempt number `attempts` (1-based) failed with `err`.
    pub fn decide(&self, err: &TransferError, attempts: u32) -> Decision {
        let remaining = attempts < self.limit;
        match err.kind {
            TransferErrorKind::NotFound => Decision::Skip {
                reason: format!("repository not found: {}", err.message),
            },
            TransferErrorKind::Auth => Decision::Skip {
                reason: format!("credentials rejected: {}", err.message),
            },
            TransferErrorKind::Timeout => Decision::GiveUp {
                reason: err.to_string(),
            },
            // A copy still unusable after a fresh transfer is retried like
            // any other transport failure.
            TransferErrorKind::CorruptWorkingCopy | TransferErrorKind::Transient if remaining => {
                Decision::Retry
            }
            TransferErrorKind::CorruptWorkingCopy | TransferErrorKind::Transient => Decision::GiveUp {
                reason: format!("gave up after {attempts} attempt(s): {err}"),
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_skipped_immediately() {
        let policy = RetryPolicy::new(5);
        let decision = policy.decide(&TransferError::not_found("octo/gone"), 1);
        assert!(matches!(decision, Decision::Skip { reason } if reason.contains("not found")));
    }

    #[test]
    fn test_auth_failure_mid_run_is_permanent() {
        let decision = RetryPolicy::new(3).decide(&TransferError::auth("bad token"), 1);
        assert!(matches!(decision, Decision::Skip { .. }));
    }

    #[test]
    fn test_transient_retries_until_limit() {
        let policy = RetryPolicy::new(3);
        let err = TransferError::transient("connection reset");
        assert_eq!(policy.decide(&err, 1), Decision::Retry);
        assert_eq!(policy.decide(&err, 2), Decision::Retry);
        match policy.decide(&err, 3) {
            Decision::GiveUp { reason } => {
                assert!(reason.contains("3 attempt"), "{reason}");
                assert!(reason.contains("connection reset"), "{reason}");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_copy_is_retried_while_attempts_remain() {
        let policy = RetryPolicy::new(2);
        let err = TransferError::corrupt("not a git repository");
        assert_eq!(policy.decide(&err, 1), Decision::Retry);
        assert!(matches!(policy.decide(&err, 2), Decision::GiveUp { .. }));
    }

    #[test]
    fn test_timeout_is_permanent_failure() {
        let decision = RetryPolicy::new(3).decide(&TransferError::timeout("rm took too long"), 1);
        assert!(matches!(decision, Decision::GiveUp { .. }));
    }

    #[test]
    fn test_limit_is_at_least_one() {
        assert_eq!(RetryPolicy::new(0).limit(), 1);
        let decision = RetryPolicy::new(0).decide(&TransferError::transient("x"), 1);
        assert!(matches!(decision, Decision::GiveUp { .. }));
    }
}
