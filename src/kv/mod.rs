//! The MDS's backing key-value store, modeled as an external collaborator.
//!
//! spec.md treats "the replicated key-value store underneath the MDS" as out of
//! scope, described only by its contract: a transactional, namespaced, ordered
//! key-value database with iterators and a master/replica role bit. This module is
//! that contract ([`KvStore`], [`Transaction`]) plus [`MemKv`], a single-process
//! in-memory implementation satisfying it, used by tests and by any embedder that
//! doesn't need real replication.
//!
//! Per spec.md §6, integers are encoded big-endian so lexicographic key order matches
//! numeric order; see [`be_u64`]/[`be_u128`] and [`devkey`].

mod mem;

pub use mem::MemKv;

use crate::error::{Error, Kind, Result};

/// The six persistent namespaces spec.md §6 names, plus `default`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Filesystem-wide metadata: schema version, piece size, fsid.
    Default,
    /// `devid -> DeviceStatus`.
    Devices,
    /// `(devid, index) -> PieceData(PieceId)`: reverse index, source of truth for
    /// RESTORING reconciliation.
    Pieces,
    /// `PieceId -> PieceLocation`: forward index used by LAYOUTGET/read/write.
    Data,
    /// `PieceId -> ()`: recovery log of in-flight resilvers.
    Repairs,
    /// Persisted NFS clients, for cross-restart grace-period recovery.
    Clients,
    /// Persisted non-volatile NFS state (opens reclaimed across restart).
    State,
}

/// Big-endian encoding of a `u64`, for iterator-friendly key ordering.
pub fn be_u64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

/// Big-endian encoding of a `u128`.
pub fn be_u128(v: u128) -> [u8; 16] {
    v.to_be_bytes()
}

/// `(devid, index)` key as used in the `pieces` namespace: two concatenated
/// big-endian `u64`s.
pub fn devkey(devid: u64, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&be_u64(devid));
    key.extend_from_slice(&be_u64(index));
    key
}

/// Splits a `devkey` back into `(devid, index)`.
pub fn split_devkey(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() != 16 {
        return None;
    }
    let devid = u64::from_be_bytes(key[0..8].try_into().ok()?);
    let index = u64::from_be_bytes(key[8..16].try_into().ok()?);
    Some((devid, index))
}

/// A read/write view staged against the store, committed atomically.
///
/// Any change to `data`, `pieces`, `repairs`, `devices`, or persistent state must go
/// through a `Transaction` committed after all relevant in-memory mutations are
/// staged (spec.md §5, Transaction discipline).
pub trait Transaction: Send {
    /// Reads a key, seeing this transaction's own uncommitted writes.
    fn get(&self, ns: Namespace, key: &[u8]) -> Option<Vec<u8>>;

    /// Stages a write.
    fn put(&mut self, ns: Namespace, key: Vec<u8>, value: Vec<u8>);

    /// Stages a delete.
    fn delete(&mut self, ns: Namespace, key: &[u8]);

    /// Lists keys (and values) with the given prefix, in ascending order, reflecting
    /// this transaction's own uncommitted writes.
    fn iter_prefix(&self, ns: Namespace, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;

    /// Commits the staged writes atomically. On failure, the caller must roll back
    /// whatever in-memory mutations it had already made before releasing locks
    /// (spec.md §5) — an unrecoverable commit failure is fatal.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// The backing store itself.
pub trait KvStore: Send + Sync {
    /// `true` if this replica may accept writes. Spec.md §7: any mutation attempted
    /// on a non-master replica fails with `ReadOnly`.
    fn is_master(&self) -> bool;

    /// Starts a new transaction.
    fn begin(&self) -> Box<dyn Transaction + '_>;

    /// Convenience read outside of any transaction.
    fn get(&self, ns: Namespace, key: &[u8]) -> Option<Vec<u8>>;

    /// Convenience prefix scan outside of any transaction.
    fn iter_prefix(&self, ns: Namespace, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
}

/// Fails with [`Kind::ReadOnly`] unless `store` is the master replica (spec.md §7:
/// "Attempting any mutation on a non-master MDS replica fails with `ReadOnly`").
pub fn require_master(store: &dyn KvStore) -> Result<()> {
    if store.is_master() {
        Ok(())
    } else {
        Err(Error::new(Kind::ReadOnly))
    }
}
