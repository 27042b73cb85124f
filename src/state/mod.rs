//! NFSv4.1 server state: clients, sessions, opens, delegations, layouts, and the
//! grace period (spec.md §2 component D, §4.D).

pub mod client;
pub mod grace;
pub mod layout;
pub mod open;
pub mod recall;
pub mod session;
pub mod stateid;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::{Error, Kind, Result};
use client::{ClientId, ClientOwner, ClientTable};
use grace::GracePeriod;
use layout::LayoutState;
use open::{CreateVerifiers, DelegationKind, FileState, ShareAccess};
use recall::{BackChannel, RecallDriver, RecallKind, Recallable};
use session::{ChannelLimits, SessionId, SessionTable};
use stateid::StateIdAllocator;

/// The singleton ops (spec.md §4.D "Compound dispatch"): each must be the only op
/// in its COMPOUND.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SingletonOp {
    ExchangeId,
    CreateSession,
    BindConnToSession,
    DestroySession,
    DestroyClientid,
}

/// Classifies the first op of a COMPOUND for dispatch purposes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FirstOp {
    Sequence,
    Singleton(SingletonOp),
    Other,
}

/// Applies the first-op dispatch rule (spec.md §4.D): returns `Ok(())` if the
/// compound's shape is legal given its first op and total op count.
pub fn check_first_op(first: FirstOp, op_count: usize) -> Result<()> {
    match first {
        FirstOp::Sequence => Ok(()),
        FirstOp::Singleton(_) if op_count == 1 => Ok(()),
        FirstOp::Singleton(_) => Err(Error::new(Kind::NotOnlyOp)),
        FirstOp::Other => Err(Error::new(Kind::OpNotInSession)),
    }
}

/// Rejects a second `SEQUENCE` anywhere else in the compound (spec.md: "Subsequent
/// `SEQUENCE` within a compound → `SEQUENCE_POS`").
pub fn check_no_duplicate_sequence(is_sequence: bool, op_index: usize) -> Result<()> {
    if is_sequence && op_index != 0 {
        Err(Error::new(Kind::SequencePos))
    } else {
        Ok(())
    }
}

/// Per-compound dispatch cursor (spec.md §4.D "Compound dispatch"): `curr`/`save`
/// track `(fileid, stateid)` as PUTFH/LOOKUP/SAVEFH/RESTOREFH move through the
/// compound.
#[derive(Debug, Default, Clone)]
pub struct CompoundState {
    pub curr: Option<(u64, Option<stateid::StateId>)>,
    pub save: Option<(u64, Option<stateid::StateId>)>,
    pub session: Option<SessionId>,
    pub slot: u32,
    pub opindex: u32,
    pub opcount: u32,
}

impl CompoundState {
    pub fn putfh(&mut self, fileid: u64) {
        self.curr = Some((fileid, None));
    }

    pub fn savefh(&mut self) {
        self.save = self.curr.clone();
    }

    pub fn restorefh(&mut self) {
        self.curr = self.save.clone();
    }
}

/// The top-level NFSv4.1 state manager: client/session tables, per-file
/// open/delegation/layout state, the grace period, and the lease sweep.
pub struct StateManager {
    pub clients: ClientTable,
    pub sessions: SessionTable,
    pub create_verifiers: CreateVerifiers,
    files: DashMap<u64, Arc<FileState>>,
    layouts: DashMap<u64, Arc<LayoutState>>,
    pub allocator: StateIdAllocator,
    pub recall: Arc<RecallDriver>,
    grace: GracePeriod,
    lease: Duration,
}

impl StateManager {
    pub fn new(
        instance_verifier: u32,
        lease: Duration,
        grace_duration: Duration,
        channel_limits: ChannelLimits,
        back_channel: Arc<dyn BackChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: ClientTable::new(),
            sessions: SessionTable::new(channel_limits),
            create_verifiers: CreateVerifiers::default(),
            files: DashMap::new(),
            layouts: DashMap::new(),
            allocator: StateIdAllocator::new(instance_verifier),
            // spec.md "Recall driver": "rate-limited (e.g., ≤100 at a time)".
            recall: Arc::new(RecallDriver::new(back_channel, 100)),
            grace: GracePeriod::start(grace_duration),
            lease,
        })
    }

    pub fn file_state(&self, fileid: u64) -> Arc<FileState> {
        self.files.entry(fileid).or_insert_with(|| Arc::new(FileState::new())).clone()
    }

    pub fn layout_state(&self, fileid: u64) -> Arc<LayoutState> {
        self.layouts.entry(fileid).or_insert_with(|| Arc::new(LayoutState::new())).clone()
    }

    pub fn grace_active(&self) -> bool {
        self.grace.is_active()
    }

    /// EXCHANGE_ID (spec.md §4.D).
    pub fn exchange_id(&self, owner: ClientOwner, principal: Vec<u8>, update: bool) -> Result<(ClientId, bool)> {
        let (record, is_new) = self.clients.exchange_id(owner, principal, update)?;
        Ok((record.id, is_new))
    }

    /// CREATE_SESSION (spec.md §4.D): confirms the client and allocates a session.
    pub fn create_session(&self, client_id: ClientId, requested_max_requests: usize) -> Result<Arc<session::Session>> {
        self.clients.confirm(client_id)?;
        Ok(self.sessions.create(client_id, requested_max_requests))
    }

    /// SEQUENCE: renews the owning client's lease and delegates to the session's
    /// fore-channel slot table.
    pub fn sequence(
        &self,
        session_id: &SessionId,
        slot: u32,
        sequence_num: u32,
        highest_slot: u32,
    ) -> Result<(Arc<session::Session>, session::SequenceOutcome)> {
        let session = self.sessions.get(session_id).ok_or(Error::new(Kind::BadSession))?;
        let client = self.clients.get(session.client_id).ok_or(Error::new(Kind::DeadSession))?;
        client.renew();
        let outcome = session.fore_channel.sequence(slot, sequence_num, highest_slot)?;
        Ok((session, outcome))
    }

    /// Applies an OPEN request, gating on the grace period per spec.md §4.D: a
    /// CLAIM_NULL open during grace returns `GRACE`; only CLAIM_PREVIOUS may
    /// proceed. Delegation issuance is the caller's job once the open succeeds
    /// (via [`open::FileState::decide_delegation`]) — kept separate so a caller
    /// can skip it when the client declined one.
    ///
    /// Before attempting the share reservation, checks for a conflicting
    /// delegation or layout held by another client (spec.md §4.D "Conflict
    /// recall"): a WRITE-wanting open conflicts with any non-owning delegation or
    /// layout, a READ-wanting open only with a non-owning WRITE one. A conflict
    /// against a live holder issues `CB_RECALL`/`CB_LAYOUTRECALL` and returns
    /// `DELAY` for the caller to retry once the holder's `DELEGRETURN`/
    /// `LAYOUTRETURN` lands; against an expired holder it revokes the entry in
    /// place and proceeds; during grace it asks the caller to retry once grace
    /// ends instead of racing a `CLAIM_PREVIOUS` reclaim.
    pub fn open(
        &self,
        fileid: u64,
        claim: grace::Claim,
        owner: open::OpenOwner,
        access: open::ShareAccess,
        deny: open::ShareDeny,
    ) -> Result<stateid::StateId> {
        if self.grace.is_active() && claim == grace::Claim::Null {
            return Err(Error::new(Kind::Grace));
        }

        let file_state = self.file_state(fileid);
        let layout_state = self.layout_state(fileid);
        self.resolve_delegation_conflict(&file_state, owner.client_id, access)?;
        self.resolve_layout_conflict(&layout_state, owner.client_id, access)?;

        file_state.open(owner, access, deny, &self.allocator)
    }

    fn wants_write(access: open::ShareAccess) -> bool {
        !(access & ShareAccess::WRITE).is_empty()
    }

    /// `true` if a holder's client record is gone, or its lease has lapsed — spec.md
    /// §4.D: "a conflict found against a state entry whose client is `expired`".
    fn holder_expired(&self, holder: ClientId) -> bool {
        match self.clients.get(holder) {
            Some(record) => record.expired(self.lease),
            None => true,
        }
    }

    fn resolve_delegation_conflict(&self, file_state: &FileState, client_id: ClientId, access: open::ShareAccess) -> Result<()> {
        let Some((holder, kind, stateid)) = file_state.delegation() else { return Ok(()) };
        if holder == client_id {
            return Ok(());
        }
        if !Self::wants_write(access) && kind != DelegationKind::Write {
            return Ok(());
        }
        if self.holder_expired(holder) {
            file_state.clear_delegation();
            return Ok(());
        }
        if self.grace.is_active() {
            return Err(Error::new(Kind::Grace));
        }
        self.recall.enqueue(Recallable { client_id: holder, stateid, kind: RecallKind::Delegation, expiry: Instant::now() });
        Err(Error::new(Kind::Delay))
    }

    fn resolve_layout_conflict(&self, layout_state: &LayoutState, client_id: ClientId, access: open::ShareAccess) -> Result<()> {
        let Some((holder, iomode)) = layout_state.holder_other_than(client_id) else { return Ok(()) };
        let holder_wants_write = iomode == layout::IoMode::ReadWrite;
        if !Self::wants_write(access) && !holder_wants_write {
            return Ok(());
        }
        let Some(stateid) = layout_state.stateid_of(holder) else { return Ok(()) };
        if self.holder_expired(holder) {
            layout_state.return_file(holder);
            return Ok(());
        }
        if self.grace.is_active() {
            return Err(Error::new(Kind::Grace));
        }
        self.recall.enqueue(Recallable { client_id: holder, stateid, kind: RecallKind::Layout, expiry: Instant::now() });
        Err(Error::new(Kind::Delay))
    }

    /// RECLAIM_COMPLETE (SPEC_FULL.md §5.D, supplemented from RFC 5661 semantics):
    /// records that a client is done reclaiming so the grace period can end early
    /// once every client with reclaimable state has either reclaimed or sent this.
    pub fn reclaim_complete(&self, client_id: ClientId) -> Result<()> {
        let record = self.clients.get(client_id).ok_or(Error::new(Kind::StaleClientid))?;
        record.reclaim_complete.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// TEST_STATEID (spec.md §8 invariant 6): reports whether `stateid` is current,
    /// stale (`other` known but `seqid` doesn't match), or unknown for `fileid`'s
    /// opens/delegation/layout.
    pub fn test_stateid(&self, fileid: u64, stateid: stateid::StateId) -> Result<()> {
        let file_state = self.file_state(fileid);
        if let Some(seqid) = file_state.seqid_of(stateid.other) {
            return if seqid == stateid.seqid { Ok(()) } else { Err(Error::new(Kind::OldStateid)) };
        }
        let layout_state = self.layout_state(fileid);
        if let Some((_, seqid)) = layout_state.owner_and_seqid(stateid.other) {
            return if seqid == stateid.seqid { Ok(()) } else { Err(Error::new(Kind::OldStateid)) };
        }
        Err(Error::new(Kind::BadStateid))
    }

    /// FREE_STATEID (spec.md §8 invariant 6): forgets a stateid whose owning client
    /// has been revoked by the lease sweep. A stateid belonging to a still-live
    /// client is rejected rather than torn down out from under it.
    pub fn free_stateid(&self, fileid: u64, stateid: stateid::StateId) -> Result<()> {
        let file_state = self.file_state(fileid);
        if let Some(owner) = file_state.owner_of(stateid.other) {
            return if self.client_revoked(owner) {
                file_state.forget_stateid(stateid.other);
                Ok(())
            } else {
                Err(Error::new(Kind::InvalidArgument))
            };
        }
        let layout_state = self.layout_state(fileid);
        if let Some((owner, _)) = layout_state.owner_and_seqid(stateid.other) {
            return if self.client_revoked(owner) {
                layout_state.return_file(owner);
                Ok(())
            } else {
                Err(Error::new(Kind::InvalidArgument))
            };
        }
        Err(Error::new(Kind::BadStateid))
    }

    fn client_revoked(&self, client_id: ClientId) -> bool {
        self.clients.get(client_id).map(|record| record.revoked.load(Ordering::SeqCst)).unwrap_or(true)
    }

    /// LAYOUTRETURN with `LAYOUTRETURN4_ALL`/`LAYOUTRETURN4_FSID` (this crate has a
    /// single filesystem id per server, so the two scopes coincide): returns every
    /// layout `client_id` holds across every file, rather than just one.
    pub fn layoutreturn_all(&self, client_id: ClientId) {
        for entry in self.layouts.iter() {
            entry.value().return_file(client_id);
        }
    }

    /// SECINFO / SECINFO_NO_NAME (SPEC_FULL.md §5.D): Kerberos/ACL negotiation is a
    /// Non-goal, so `AUTH_SYS` is always the sole acceptable flavor reported.
    pub fn secinfo(&self) -> &'static [&'static str] {
        &["AUTH_SYS"]
    }

    /// Runs the three-phase lease sweep once (spec.md §4.D). Intended to be driven
    /// by a `tokio::time::interval` task owned by the server.
    pub fn sweep_leases(&self) -> client::SweepResult {
        self.clients.sweep(self.lease)
    }

    /// Spawns the periodic lease-sweep task, checking every tenth of the lease
    /// interval (frequent enough that phase transitions aren't badly delayed,
    /// without spinning).
    pub fn spawn_lease_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let period = (self.lease / 10).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let result = manager.sweep_leases();
                if !result.force_revoke.is_empty() || !result.purged.is_empty() {
                    tracing::info!(
                        force_revoke = result.force_revoke.len(),
                        purged = result.purged.len(),
                        "lease sweep"
                    );
                }
            }
        })
    }
}

static INSTANCE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A process-unique-enough instance verifier for a freshly started server, derived
/// from a monotonic counter rather than wall-clock time (this crate never calls
/// `SystemTime::now()` during startup so repeated test runs stay deterministic).
pub fn fresh_instance_verifier() -> u32 {
    INSTANCE_COUNTER.fetch_add(1, Ordering::SeqCst).wrapping_add(0x9E37_79B9)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn limits() -> ChannelLimits {
        ChannelLimits { max_request_size: 1 << 20, max_response_size: 1 << 20, max_requests: 64 }
    }

    /// Test double recording every recall it's asked to issue; `reachable` defaults
    /// to every client being reachable so recalls succeed rather than revoke.
    #[derive(Default)]
    struct FakeBackChannel {
        recalled: StdMutex<Vec<(ClientId, stateid::StateId)>>,
        layout_recalled: StdMutex<Vec<(ClientId, stateid::StateId)>>,
        unreachable: StdMutex<Vec<ClientId>>,
    }

    #[async_trait::async_trait]
    impl BackChannel for FakeBackChannel {
        async fn cb_recall(&self, client_id: ClientId, stateid: stateid::StateId) -> Result<()> {
            self.recalled.lock().unwrap().push((client_id, stateid));
            Ok(())
        }
        async fn cb_layoutrecall(&self, client_id: ClientId, stateid: stateid::StateId) -> Result<()> {
            self.layout_recalled.lock().unwrap().push((client_id, stateid));
            Ok(())
        }
        fn is_reachable(&self, client_id: ClientId) -> bool {
            !self.unreachable.lock().unwrap().contains(&client_id)
        }
    }

    fn fake_back_channel() -> Arc<FakeBackChannel> {
        Arc::new(FakeBackChannel::default())
    }

    #[test]
    fn compound_first_op_rules() {
        assert!(check_first_op(FirstOp::Sequence, 3).is_ok());
        assert!(check_first_op(FirstOp::Singleton(SingletonOp::ExchangeId), 1).is_ok());
        assert!(matches!(
            check_first_op(FirstOp::Singleton(SingletonOp::ExchangeId), 2),
            Err(e) if e.kind == Kind::NotOnlyOp
        ));
        assert!(matches!(check_first_op(FirstOp::Other, 1), Err(e) if e.kind == Kind::OpNotInSession));
    }

    #[test]
    fn duplicate_sequence_rejected() {
        assert!(check_no_duplicate_sequence(true, 0).is_ok());
        assert!(matches!(check_no_duplicate_sequence(true, 2), Err(e) if e.kind == Kind::SequencePos));
    }

    #[test]
    fn open_during_grace_with_claim_null_is_grace_error() {
        let manager = StateManager::new(1, Duration::from_secs(120), Duration::from_secs(120), limits(), fake_back_channel());
        let owner = open::OpenOwner { client_id: 1, owner: vec![1] };
        let result = manager.open(42, grace::Claim::Null, owner, open::ShareAccess::READ, open::ShareDeny::empty());
        assert!(matches!(result, Err(e) if e.kind == Kind::Grace));
    }

    #[test]
    fn open_during_grace_with_claim_previous_proceeds() {
        let manager = StateManager::new(1, Duration::from_secs(120), Duration::from_secs(120), limits(), fake_back_channel());
        let owner = open::OpenOwner { client_id: 1, owner: vec![1] };
        let result = manager.open(42, grace::Claim::Previous, owner, open::ShareAccess::READ, open::ShareDeny::empty());
        assert!(result.is_ok());
    }

    #[test]
    fn exchange_id_then_create_session_confirms_client() {
        let manager = StateManager::new(1, Duration::from_secs(120), Duration::from_secs(0), limits(), fake_back_channel());
        let owner = ClientOwner { co_ownerid: b"c1".to_vec(), verifier: [9; 8] };
        let (client_id, is_new) = manager.exchange_id(owner, vec![1], false).unwrap();
        assert!(is_new);
        let session = manager.create_session(client_id, 16).unwrap();
        assert_eq!(session.client_id, client_id);
    }

    /// Mandatory concrete scenario: a write-wanting OPEN conflicting with another
    /// client's read delegation issues `CB_RECALL` and returns `DELAY`; once the
    /// delegation is returned (DELEGRETURN), the retry proceeds.
    #[test]
    fn open_conflict_recalls_delegation_and_retry_succeeds_after_delegreturn() {
        let manager = StateManager::new(1, Duration::from_secs(120), Duration::from_secs(0), limits(), fake_back_channel());
        let holder_owner = open::OpenOwner { client_id: 1, owner: vec![1] };
        manager.open(7, grace::Claim::Null, holder_owner.clone(), open::ShareAccess::READ, open::ShareDeny::empty()).unwrap();
        let file_state = manager.file_state(7);
        let delegation = file_state
            .decide_delegation(1, open::DelegationWant::Read, true, true, &manager.allocator)
            .expect("read delegation should be granted with no competing write open");

        let writer = open::OpenOwner { client_id: 2, owner: vec![2] };
        let conflict = manager.open(7, grace::Claim::Null, writer.clone(), open::ShareAccess::WRITE, open::ShareDeny::empty());
        assert!(matches!(conflict, Err(e) if e.kind == Kind::Delay));

        // DELEGRETURN: holder gives back the delegation, freeing the retry to proceed.
        assert_eq!(file_state.delegation().unwrap().2, delegation);
        file_state.clear_delegation();
        let retried = manager.open(7, grace::Claim::Null, writer, open::ShareAccess::WRITE, open::ShareDeny::empty());
        assert!(retried.is_ok());
    }

    #[test]
    fn open_conflict_against_expired_holder_revokes_in_place() {
        let manager = StateManager::new(1, Duration::from_millis(1), Duration::from_secs(0), limits(), fake_back_channel());
        let holder_owner = open::OpenOwner { client_id: 1, owner: vec![1] };
        manager.open(9, grace::Claim::Null, holder_owner.clone(), open::ShareAccess::READ, open::ShareDeny::empty()).unwrap();
        let file_state = manager.file_state(9);
        file_state.decide_delegation(1, open::DelegationWant::Read, true, true, &manager.allocator).unwrap();

        // Let the holder's lease lapse; its client record is never even created here,
        // so `holder_expired` treats it as gone and revokes outright.
        std::thread::sleep(Duration::from_millis(5));
        let writer = open::OpenOwner { client_id: 2, owner: vec![2] };
        let result = manager.open(9, grace::Claim::Null, writer, open::ShareAccess::WRITE, open::ShareDeny::empty());
        assert!(result.is_ok());
        assert!(file_state.delegation().is_none());
    }
}
