//! Client lifecycle: EXCHANGE_ID table and lease tracking (spec.md §4.D "Client
//! lifecycle (EXCHANGE_ID)", "Lease & grace semantics").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::{Error, Kind, Result};

pub type ClientId = u64;

/// `co_ownerid` plus the instance verifier a client sends on EXCHANGE_ID, used to
/// detect client restarts (spec.md §4.D case 5).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientOwner {
    pub co_ownerid: Vec<u8>,
    pub verifier: [u8; 8],
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Unconfirmed,
    Confirmed,
}

/// One EXCHANGE_ID record. `principal` stands in for whatever RPCSEC_GSS/AUTH_SYS
/// identity authenticated the request (spec.md only requires AUTH_SYS, so this is
/// an opaque comparable token).
pub struct ClientRecord {
    pub id: ClientId,
    pub owner: ClientOwner,
    pub principal: Vec<u8>,
    pub confirmation: Confirmation,
    last_renewed: Mutex<Instant>,
    /// Number of open/lock/delegation/layout state entries outstanding; used by the
    /// lease sweep to decide whether an expired client can be purged outright.
    pub state_count: AtomicU64,
    /// Set once this client's state is known to have been force-revoked by the
    /// lease sweep's phase 3 (spec.md §4.D).
    pub revoked: std::sync::atomic::AtomicBool,
    /// `true` once this client has sent RECLAIM_COMPLETE, ending its grace-period
    /// reclaim window.
    pub reclaim_complete: std::sync::atomic::AtomicBool,
}

impl ClientRecord {
    fn new(id: ClientId, owner: ClientOwner, principal: Vec<u8>, confirmation: Confirmation) -> Arc<Self> {
        Arc::new(Self {
            id,
            owner,
            principal,
            confirmation,
            last_renewed: Mutex::new(Instant::now()),
            state_count: AtomicU64::new(0),
            revoked: std::sync::atomic::AtomicBool::new(false),
            reclaim_complete: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn renew(&self) {
        *self.last_renewed.lock().expect("client lock poisoned") = Instant::now();
    }

    pub fn expired(&self, lease: Duration) -> bool {
        self.last_renewed.lock().expect("client lock poisoned").elapsed() > lease
    }

    pub fn expired_by(&self, multiple: u32, lease: Duration) -> bool {
        self.last_renewed.lock().expect("client lock poisoned").elapsed() > lease * multiple
    }

    pub fn has_state(&self) -> bool {
        self.state_count.load(Ordering::SeqCst) > 0
    }
}

/// The server-wide client table, keyed by `co_ownerid` (spec.md §4.D).
pub struct ClientTable {
    by_id: DashMap<ClientId, Arc<ClientRecord>>,
    /// `co_ownerid -> [record ids]`; at most one confirmed and one unconfirmed
    /// record may exist per owner at a time (spec.md cases 1-6).
    by_owner: Mutex<HashMap<Vec<u8>, Vec<ClientId>>>,
    next_id: AtomicU64,
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientTable {
    pub fn new() -> Self {
        Self { by_id: DashMap::new(), by_owner: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<ClientRecord>> {
        self.by_id.get(&id).map(|e| e.clone())
    }

    fn records_for(&self, co_ownerid: &[u8]) -> Vec<Arc<ClientRecord>> {
        self.by_owner
            .lock()
            .expect("owner table lock poisoned")
            .get(co_ownerid)
            .map(|ids| ids.iter().filter_map(|id| self.get(*id)).collect())
            .unwrap_or_default()
    }

    fn insert(&self, record: Arc<ClientRecord>) {
        self.by_owner
            .lock()
            .expect("owner table lock poisoned")
            .entry(record.owner.co_ownerid.clone())
            .or_default()
            .push(record.id);
        self.by_id.insert(record.id, record);
    }

    fn remove(&self, id: ClientId, co_ownerid: &[u8]) {
        self.by_id.remove(&id);
        if let Some(ids) = self.by_owner.lock().expect("owner table lock poisoned").get_mut(co_ownerid) {
            ids.retain(|&i| i != id);
        }
    }

    /// Processes EXCHANGE_ID (spec.md §4.D cases 1-6). `update` is the
    /// `EXCHGID4_FLAG_UPD_CONFIRMED_REC_A` bit.
    pub fn exchange_id(
        &self,
        owner: ClientOwner,
        principal: Vec<u8>,
        update: bool,
    ) -> Result<(Arc<ClientRecord>, bool)> {
        let existing = self.records_for(&owner.co_ownerid);
        let confirmed = existing.iter().find(|r| r.confirmation == Confirmation::Confirmed).cloned();
        let unconfirmed = existing.iter().find(|r| r.confirmation == Confirmation::Unconfirmed).cloned();

        if update {
            // Case 6: requires a confirmed record with a matching verifier.
            return match confirmed {
                Some(record) if record.owner.verifier == owner.verifier => Ok((record, false)),
                Some(_) => Err(Error::new(Kind::NotSame)),
                None => Err(Error::new(Kind::NoEnt)),
            };
        }

        if let Some(record) = confirmed {
            if record.principal != principal {
                // Case 3: different principal takes priority over verifier matching —
                // a verifier collision from a different authenticated identity is not
                // a legitimate retry.
                if record.has_state() {
                    return Err(Error::new(Kind::ClidInUse));
                }
                self.remove(record.id, &owner.co_ownerid);
            } else if record.owner.verifier == owner.verifier {
                // Case 2: existing confirmed, same verifier — non-update, same clientid.
                return Ok((record, false));
            } else {
                // Case 5: client restart. Drop any concurrent unconfirmed record and add
                // a fresh one; CREATE_SESSION on it purges the old confirmed record.
                if let Some(stale) = &unconfirmed {
                    self.remove(stale.id, &owner.co_ownerid);
                }
            }
        } else if let Some(stale) = unconfirmed {
            // Case 4: existing unconfirmed — replace it.
            self.remove(stale.id, &owner.co_ownerid);
        }

        // Case 1 (and the continuations of 3/4/5): allocate a fresh unconfirmed record.
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = ClientRecord::new(id, owner, principal, Confirmation::Unconfirmed);
        self.insert(record.clone());
        Ok((record, true))
    }

    /// Confirms a client on its first successful CREATE_SESSION, purging the old
    /// confirmed record from the same owner if this was a restart (case 5).
    pub fn confirm(&self, id: ClientId) -> Result<Arc<ClientRecord>> {
        let record = self.get(id).ok_or(Error::new(Kind::StaleClientid))?;
        let siblings: Vec<Arc<ClientRecord>> = self
            .records_for(&record.owner.co_ownerid)
            .into_iter()
            .filter(|r| r.id != id && r.confirmation == Confirmation::Confirmed)
            .collect();
        for old in siblings {
            self.remove(old.id, &old.owner.co_ownerid);
        }
        // Confirmation is a one-way transition tracked by replacing the stored record.
        let confirmed = ClientRecord::new(record.id, record.owner.clone(), record.principal.clone(), Confirmation::Confirmed);
        confirmed.state_count.store(record.state_count.load(Ordering::SeqCst), Ordering::SeqCst);
        self.by_id.insert(confirmed.id, confirmed.clone());
        Ok(confirmed)
    }

    pub fn destroy(&self, id: ClientId) -> Result<()> {
        let record = self.get(id).ok_or(Error::new(Kind::StaleClientid))?;
        self.remove(id, &record.owner.co_ownerid);
        Ok(())
    }

    /// Three-phase lease sweep (spec.md §4.D "Lease & grace semantics"). Returns the
    /// ids of clients that were force-revoked (phase 3, caller must still revoke
    /// their state entries) and the ids purged outright.
    pub fn sweep(&self, lease: Duration) -> SweepResult {
        let mut force_revoke = Vec::new();
        let mut purge = Vec::new();
        for entry in self.by_id.iter() {
            let record = entry.value();
            if !record.expired(lease) {
                continue;
            }
            if !record.has_state() && !record.revoked.load(Ordering::SeqCst) {
                purge.push(record.id); // phase 1
            } else if record.expired_by(4, lease) && !record.has_state() {
                purge.push(record.id); // phase 2
            } else if record.expired_by(19, lease) {
                force_revoke.push(record.id); // phase 3
            }
        }
        for &id in &force_revoke {
            if let Some(record) = self.get(id) {
                record.revoked.store(true, Ordering::SeqCst);
            }
        }
        for id in force_revoke.iter().chain(purge.iter()) {
            if let Some(record) = self.get(*id) {
                if purge.contains(id) {
                    self.remove(record.id, &record.owner.co_ownerid);
                }
            }
        }
        SweepResult { force_revoke, purged: purge }
    }
}

pub struct SweepResult {
    pub force_revoke: Vec<ClientId>,
    pub purged: Vec<ClientId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(id: &[u8], verifier: [u8; 8]) -> ClientOwner {
        ClientOwner { co_ownerid: id.to_vec(), verifier }
    }

    #[test]
    fn new_owner_allocates_unconfirmed() {
        let table = ClientTable::new();
        let (record, is_new) = table.exchange_id(owner(b"c1", [1; 8]), vec![1], false).unwrap();
        assert!(is_new);
        assert_eq!(record.confirmation, Confirmation::Unconfirmed);
    }

    #[test]
    fn confirmed_same_verifier_is_non_update() {
        let table = ClientTable::new();
        let (record, _) = table.exchange_id(owner(b"c1", [1; 8]), vec![1], false).unwrap();
        table.confirm(record.id).unwrap();
        let (again, is_new) = table.exchange_id(owner(b"c1", [1; 8]), vec![1], false).unwrap();
        assert!(!is_new);
        assert_eq!(again.id, record.id);
    }

    #[test]
    fn confirmed_different_principal_with_state_is_clid_in_use() {
        let table = ClientTable::new();
        let (record, _) = table.exchange_id(owner(b"c1", [1; 8]), vec![1], false).unwrap();
        let confirmed = table.confirm(record.id).unwrap();
        confirmed.state_count.store(1, Ordering::SeqCst);
        let result = table.exchange_id(owner(b"c1", [1; 8]), vec![2], false);
        assert!(matches!(result, Err(e) if e.kind == Kind::ClidInUse));
    }

    #[test]
    fn update_without_confirmed_record_is_noent() {
        let table = ClientTable::new();
        let result = table.exchange_id(owner(b"c1", [1; 8]), vec![1], true);
        assert!(matches!(result, Err(e) if e.kind == Kind::NoEnt));
    }
}
