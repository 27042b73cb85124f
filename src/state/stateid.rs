//! Stateid allocation (spec.md §4.D).
//!
//! Every open, delegation, and layout gets a 16-byte NFSv4 stateid: a 4-byte
//! `seqid` the client increments expectations against, and a 12-byte `other` that
//! uniquely and permanently identifies the state entry for the life of the server
//! process. `other` is allocated from one monotonic counter shared by every state
//! kind, seeded from the server's instance verifier so stateids never collide
//! across a restart (SPEC_FULL.md §5.D, Open Question: stateid allocation scheme).

use std::sync::atomic::{AtomicU64, Ordering};

/// The special "anonymous" stateid used by I/O that doesn't carry an open
/// (`ffds_stateid = ANON` in flex-files mirrors, spec.md §4.D LAYOUTGET).
pub const ANONYMOUS: StateId = StateId { other: [0u8; 12], seqid: 0 };

/// The all-ones stateid used by SETATTR without a preceding OPEN and other
/// bypass paths.
pub const BYPASS: StateId = StateId { other: [0xffu8; 12], seqid: 0xffff_ffff };

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId {
    pub other: [u8; 12],
    pub seqid: u32,
}

impl StateId {
    pub fn is_anonymous(&self) -> bool {
        self.other == ANONYMOUS.other
    }
}

/// Allocates fresh `other` identifiers, unique for the life of this server
/// instance.
pub struct StateIdAllocator {
    instance_verifier: u32,
    next: AtomicU64,
}

impl StateIdAllocator {
    pub fn new(instance_verifier: u32) -> Self {
        Self { instance_verifier, next: AtomicU64::new(1) }
    }

    /// Allocates a new stateid with `seqid = 1` (a client's first SEQUENCE-able
    /// reference to it).
    pub fn allocate(&self) -> StateId {
        let counter = self.next.fetch_add(1, Ordering::SeqCst);
        let mut other = [0u8; 12];
        other[0..4].copy_from_slice(&self.instance_verifier.to_be_bytes());
        other[4..12].copy_from_slice(&counter.to_be_bytes());
        StateId { other, seqid: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_unique_and_start_at_seqid_one() {
        let alloc = StateIdAllocator::new(0xdead_beef);
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_ne!(a.other, b.other);
        assert_eq!(a.seqid, 1);
    }
}
