/// Protocol error taxonomy.
///
/// Every operation on the feed surfaces one of these. The UI layer routes
/// on [`FeedError::kind`]: validation and permission errors are shown
/// immediately, capacity errors carry their remediation in the message,
/// retryable errors (`Network`, `Conflict`, `Decryption`) may be retried
/// without restarting the session, and `ChainGap` requires owner
/// intervention.

use thiserror::Error;

use crate::ids::Epoch;
use crate::limits::{MAX_EPOCH, MAX_FOLLOWERS};

#[derive(Error, Debug)]
pub enum FeedError {
    // ── Validation ──────────────────────────────────────
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("private feed is not enabled for this owner")]
    NotEnabled,

    #[error("private feed is already enabled")]
    AlreadyEnabled,

    // ── Permission ──────────────────────────────────────
    #[error("requester does not follow the feed owner")]
    NotFollowing,

    #[error("an access request is already pending")]
    AlreadyPending,

    #[error("already an approved follower")]
    AlreadyApproved,

    #[error("access was permanently revoked by the owner")]
    PermanentlyRevoked,

    // ── Capacity (terminal, requires owner action) ──────
    #[error("follower limit reached ({MAX_FOLLOWERS}): revoke other followers to free capacity")]
    FollowerCapacity,

    #[error("rekey limit reached (epoch {MAX_EPOCH}): a feed reset is required")]
    EpochCapacity,

    // ── Key chain ───────────────────────────────────────
    #[error("rekey chain gap: no document for epoch {missing}")]
    ChainGap { missing: Epoch },

    #[error("no rekey box addressed to this member at epoch {epoch}")]
    Foreclosed { epoch: Epoch },

    // ── Store ───────────────────────────────────────────
    #[error("document store unavailable: {0}")]
    Network(String),

    #[error("document not found")]
    NotFound,

    #[error("concurrent epoch advance lost the race; re-sync and retry")]
    Conflict,

    // ── Content ─────────────────────────────────────────
    #[error("content could not be decrypted")]
    Decryption,
}

/// Coarse classification matching the protocol error taxonomy, for UI
/// routing and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Permission,
    Capacity,
    ChainGap,
    Network,
    Conflict,
    Decryption,
}

impl FeedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FeedError::Validation(_) | FeedError::NotEnabled | FeedError::AlreadyEnabled => {
                ErrorKind::Validation
            }
            FeedError::NotFollowing
            | FeedError::AlreadyPending
            | FeedError::AlreadyApproved
            | FeedError::PermanentlyRevoked => ErrorKind::Permission,
            FeedError::FollowerCapacity | FeedError::EpochCapacity => ErrorKind::Capacity,
            FeedError::ChainGap { .. } | FeedError::Foreclosed { .. } => ErrorKind::ChainGap,
            FeedError::Network(_) | FeedError::NotFound => ErrorKind::Network,
            FeedError::Conflict => ErrorKind::Conflict,
            FeedError::Decryption => ErrorKind::Decryption,
        }
    }

    /// True if retrying the same operation can succeed without any owner
    /// intervention (after a re-sync for `Conflict`).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::Network(_) | FeedError::Conflict | FeedError::Decryption
        )
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(FeedError::NotFollowing.kind(), ErrorKind::Permission);
        assert_eq!(FeedError::FollowerCapacity.kind(), ErrorKind::Capacity);
        assert_eq!(FeedError::ChainGap { missing: 3 }.kind(), ErrorKind::ChainGap);
        assert_eq!(FeedError::Conflict.kind(), ErrorKind::Conflict);
        assert_eq!(
            FeedError::Validation("bad".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_retryability() {
        assert!(FeedError::Network("down".into()).is_retryable());
        assert!(FeedError::Conflict.is_retryable());
        assert!(FeedError::Decryption.is_retryable());
        assert!(!FeedError::FollowerCapacity.is_retryable());
        assert!(!FeedError::ChainGap { missing: 2 }.is_retryable());
        assert!(!FeedError::PermanentlyRevoked.is_retryable());
    }

    #[test]
    fn test_capacity_messages_carry_remediation() {
        let msg = FeedError::FollowerCapacity.to_string();
        assert!(msg.contains("revoke"));
        let msg = FeedError::EpochCapacity.to_string();
        assert!(msg.contains("reset"));
    }
}
