/// Capacity guardrails — enforced from day 1.
///
/// These constants bound grant fan-out and rekey-chain length. Exceeding
/// either is a terminal, explicit error surfaced to the owner with a
/// remediation, never a silent truncation or wraparound.

use crate::ids::Epoch;

/// Max approved followers per owner. The 1025th approval is rejected.
pub const MAX_FOLLOWERS: usize = 1024;

/// Max epoch value per feed generation. Epoch 1 is creation, so this
/// allows 1999 revocations before a reset is required.
pub const MAX_EPOCH: Epoch = 2000;

/// Capacity status for an owner's feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityStatus {
    /// Under both caps, all operations allowed.
    Ok,
    /// Follower cap reached — approvals rejected until grants are revoked.
    FollowersFull,
    /// Epoch cap reached — revocations rejected until the feed is reset.
    EpochsExhausted,
}

/// Check whether one more follower can be approved.
pub fn check_follower_capacity(follower_count: usize) -> CapacityStatus {
    if follower_count >= MAX_FOLLOWERS {
        CapacityStatus::FollowersFull
    } else {
        CapacityStatus::Ok
    }
}

/// Check whether one more epoch advance (revocation) is possible.
pub fn check_epoch_capacity(current_epoch: Epoch) -> CapacityStatus {
    if current_epoch >= MAX_EPOCH {
        CapacityStatus::EpochsExhausted
    } else {
        CapacityStatus::Ok
    }
}

/// Remaining follower slots, for status reporting.
pub fn follower_capacity_remaining(follower_count: usize) -> usize {
    MAX_FOLLOWERS.saturating_sub(follower_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follower_capacity_ok() {
        assert_eq!(check_follower_capacity(0), CapacityStatus::Ok);
        assert_eq!(check_follower_capacity(512), CapacityStatus::Ok);
        assert_eq!(check_follower_capacity(1023), CapacityStatus::Ok);
    }

    #[test]
    fn test_follower_capacity_full() {
        assert_eq!(check_follower_capacity(1024), CapacityStatus::FollowersFull);
        assert_eq!(check_follower_capacity(2000), CapacityStatus::FollowersFull);
    }

    #[test]
    fn test_epoch_capacity() {
        assert_eq!(check_epoch_capacity(1), CapacityStatus::Ok);
        assert_eq!(check_epoch_capacity(1999), CapacityStatus::Ok);
        assert_eq!(check_epoch_capacity(2000), CapacityStatus::EpochsExhausted);
    }

    #[test]
    fn test_capacity_remaining() {
        assert_eq!(follower_capacity_remaining(0), 1024);
        assert_eq!(follower_capacity_remaining(1000), 24);
        assert_eq!(follower_capacity_remaining(1024), 0);
        assert_eq!(follower_capacity_remaining(5000), 0);
    }
}
