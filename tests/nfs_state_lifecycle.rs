//! End-to-end coverage of the NFSv4.1 state manager: a client establishing a
//! session, opening a file, colliding with a conflicting share reservation, and
//! eventually losing its lease.

use std::sync::Arc;
use std::time::Duration;

use flexfiles_mds::error::{Kind, Result};
use flexfiles_mds::state::client::{ClientId, ClientOwner};
use flexfiles_mds::state::grace::Claim;
use flexfiles_mds::state::open::{OpenOwner, ShareAccess, ShareDeny};
use flexfiles_mds::state::recall::BackChannel;
use flexfiles_mds::state::session::ChannelLimits;
use flexfiles_mds::state::stateid::StateId;
use flexfiles_mds::state::StateManager;

fn limits() -> ChannelLimits {
    ChannelLimits { max_request_size: 1 << 20, max_response_size: 1 << 20, max_requests: 32 }
}

/// No-op back channel for tests that don't exercise conflict recall: every client
/// is reachable and every recall succeeds.
struct NoopBackChannel;

#[async_trait::async_trait]
impl BackChannel for NoopBackChannel {
    async fn cb_recall(&self, _client_id: ClientId, _stateid: StateId) -> Result<()> {
        Ok(())
    }
    async fn cb_layoutrecall(&self, _client_id: ClientId, _stateid: StateId) -> Result<()> {
        Ok(())
    }
    fn is_reachable(&self, _client_id: ClientId) -> bool {
        true
    }
}

fn back_channel() -> Arc<dyn BackChannel> {
    Arc::new(NoopBackChannel)
}

fn establish(manager: &std::sync::Arc<StateManager>, co_ownerid: &[u8]) -> std::sync::Arc<flexfiles_mds::state::session::Session> {
    let owner = ClientOwner { co_ownerid: co_ownerid.to_vec(), verifier: [7; 8] };
    let (client_id, _) = manager.exchange_id(owner, vec![1], false).unwrap();
    manager.create_session(client_id, 16).unwrap()
}

#[test]
fn two_clients_collide_on_conflicting_share_reservation() {
    let manager = StateManager::new(1, Duration::from_secs(120), Duration::from_secs(0), limits(), back_channel());
    let session_a = establish(&manager, b"client-a");
    let session_b = establish(&manager, b"client-b");

    let owner_a = OpenOwner { client_id: session_a.client_id, owner: b"oo-a".to_vec() };
    let owner_b = OpenOwner { client_id: session_b.client_id, owner: b"oo-b".to_vec() };

    manager.open(100, Claim::Null, owner_a, ShareAccess::WRITE, ShareDeny::WRITE).unwrap();
    let result = manager.open(100, Claim::Null, owner_b, ShareAccess::WRITE, ShareDeny::empty());
    assert!(matches!(result, Err(e) if e.kind == Kind::ShareDenied));
}

#[test]
fn sequence_renews_lease_and_rejects_replayed_sequence_without_cache() {
    let manager = StateManager::new(1, Duration::from_secs(120), Duration::from_secs(0), limits(), back_channel());
    let session = establish(&manager, b"client-c");

    let (_, outcome) = manager.sequence(&session.id, 0, 0, 0).unwrap();
    assert!(matches!(outcome, flexfiles_mds::state::session::SequenceOutcome::Proceed));

    // Same sequence again before completion: the slot is still busy.
    let retry = manager.sequence(&session.id, 0, 0, 0);
    assert!(matches!(retry, Err(e) if e.kind == Kind::SlotBusy));
}

#[test]
fn file_state_is_shared_across_opens_on_the_same_fileid() {
    let manager = StateManager::new(1, Duration::from_secs(120), Duration::from_secs(0), limits(), back_channel());
    let session = establish(&manager, b"client-d");
    let owner = OpenOwner { client_id: session.client_id, owner: b"oo".to_vec() };
    manager.open(7, Claim::Null, owner.clone(), ShareAccess::READ, ShareDeny::empty()).unwrap();
    assert!(manager.file_state(7).access_union().contains(ShareAccess::READ));
    assert!(!manager.file_state(7).is_open_by_other(session.client_id));
}

#[test]
fn lease_sweep_purges_clients_with_no_outstanding_state() {
    // Zero-length lease: the first sweep after establishment finds it already expired.
    let manager = StateManager::new(1, Duration::from_millis(1), Duration::from_secs(0), limits(), back_channel());
    let session = establish(&manager, b"client-e");
    std::thread::sleep(Duration::from_millis(5));
    let result = manager.sweep_leases();
    assert!(result.purged.contains(&session.client_id));
}

/// OPEN conflict with another client's write delegation issues CB_RECALL and
/// returns DELAY; once the holder's DELEGRETURN lands, the retried OPEN proceeds.
#[test]
fn open_conflict_recalls_and_retry_proceeds_after_delegreturn() {
    let manager = StateManager::new(1, Duration::from_secs(120), Duration::from_secs(0), limits(), back_channel());
    let session_holder = establish(&manager, b"client-holder");
    let session_other = establish(&manager, b"client-other");

    let holder_owner = OpenOwner { client_id: session_holder.client_id, owner: b"oo-holder".to_vec() };
    manager.open(55, Claim::Null, holder_owner.clone(), ShareAccess::READ | ShareAccess::WRITE, ShareDeny::empty()).unwrap();
    let file_state = manager.file_state(55);
    file_state
        .decide_delegation(session_holder.client_id, flexfiles_mds::state::open::DelegationWant::Write, true, true, &manager.allocator)
        .expect("write delegation should be granted with no competing open");

    let other_owner = OpenOwner { client_id: session_other.client_id, owner: b"oo-other".to_vec() };
    let conflict = manager.open(55, Claim::Null, other_owner.clone(), ShareAccess::READ, ShareDeny::empty());
    assert!(matches!(conflict, Err(e) if e.kind == Kind::Delay));

    file_state.clear_delegation(); // DELEGRETURN
    let retried = manager.open(55, Claim::Null, other_owner, ShareAccess::READ, ShareDeny::empty());
    assert!(retried.is_ok());
}
