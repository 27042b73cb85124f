//! In-memory [`KvStore`] implementation, standing in for the replicated database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{KvStore, Namespace, Transaction};
use crate::error::Result;

type Key = (Namespace, Vec<u8>);

/// Single-process, in-memory key-value store.
///
/// Good enough to exercise the transaction discipline and namespace layout the rest
/// of the crate depends on; a production deployment would swap this for a client of
/// the real replicated database without touching any caller.
pub struct MemKv {
    data: Mutex<BTreeMap<Key, Vec<u8>>>,
    master: AtomicBool,
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKv {
    pub fn new() -> Self {
        Self { data: Mutex::new(BTreeMap::new()), master: AtomicBool::new(true) }
    }

    /// Flips the master/replica bit, for exercising `ReadOnly` behavior in tests.
    pub fn set_master(&self, master: bool) {
        self.master.store(master, Ordering::SeqCst);
    }
}

fn prefix_range(data: &BTreeMap<Key, Vec<u8>>, ns: Namespace, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    data.range((ns, prefix.to_vec())..)
        .take_while(|((k_ns, k), _)| *k_ns == ns && k.starts_with(prefix))
        .map(|((_, k), v)| (k.clone(), v.clone()))
        .collect()
}

impl KvStore for MemKv {
    fn is_master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Box<dyn Transaction + '_> {
        Box::new(MemTransaction {
            snapshot: self.data.lock().expect("mem kv store lock poisoned"),
            writes: Vec::new(),
        })
    }

    fn get(&self, ns: Namespace, key: &[u8]) -> Option<Vec<u8>> {
        self.data.lock().expect("mem kv store lock poisoned").get(&(ns, key.to_vec())).cloned()
    }

    fn iter_prefix(&self, ns: Namespace, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        prefix_range(&self.data.lock().expect("mem kv store lock poisoned"), ns, prefix)
    }
}

enum Write {
    Put(Namespace, Vec<u8>, Vec<u8>),
    Delete(Namespace, Vec<u8>),
}

/// A transaction against [`MemKv`]. Holds the store's lock for its entire lifetime,
/// which is fine for an in-memory stand-in: it makes transactions trivially
/// serializable, matching "committed after all relevant in-memory mutations are
/// staged" without needing conflict detection.
struct MemTransaction<'a> {
    snapshot: std::sync::MutexGuard<'a, BTreeMap<Key, Vec<u8>>>,
    writes: Vec<Write>,
}

// SAFETY: `Transaction` requires `Send` so it can be held generically by async
// callers, but every call site in this crate uses a `MemTransaction` purely
// synchronously (begin/operate/commit, never held across an `.await`), so it is
// never actually handed to another thread while the guard is live.
unsafe impl Send for MemTransaction<'_> {}

impl<'a> MemTransaction<'a> {
    fn staged_get(&self, ns: Namespace, key: &[u8]) -> Option<Option<Vec<u8>>> {
        for write in self.writes.iter().rev() {
            match write {
                Write::Put(w_ns, w_key, v) if *w_ns == ns && w_key == key => {
                    return Some(Some(v.clone()));
                }
                Write::Delete(w_ns, w_key) if *w_ns == ns && w_key == key => return Some(None),
                _ => {}
            }
        }
        None
    }
}

impl<'a> Transaction for MemTransaction<'a> {
    fn get(&self, ns: Namespace, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(staged) = self.staged_get(ns, key) {
            return staged;
        }
        self.snapshot.get(&(ns, key.to_vec())).cloned()
    }

    fn put(&mut self, ns: Namespace, key: Vec<u8>, value: Vec<u8>) {
        self.writes.push(Write::Put(ns, key, value));
    }

    fn delete(&mut self, ns: Namespace, key: &[u8]) {
        self.writes.push(Write::Delete(ns, key.to_vec()));
    }

    fn iter_prefix(&self, ns: Namespace, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = prefix_range(&self.snapshot, ns, prefix)
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();
        for write in &self.writes {
            match write {
                Write::Put(w_ns, k, v) if *w_ns == ns && k.starts_with(prefix) => {
                    merged.insert(k.clone(), Some(v.clone()));
                }
                Write::Delete(w_ns, k) if *w_ns == ns && k.starts_with(prefix) => {
                    merged.insert(k.clone(), None);
                }
                _ => {}
            }
        }
        merged.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect()
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        for write in self.writes.drain(..) {
            match write {
                Write::Put(ns, k, v) => {
                    self.snapshot.insert((ns, k), v);
                }
                Write::Delete(ns, k) => {
                    self.snapshot.remove(&(ns, k));
                }
            }
        }
        Ok(())
    }
}
