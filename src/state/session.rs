//! Session and slot machinery: the exactly-once-semantics (EOS) layer (spec.md
//! §4.D "Session & slot machinery (EOS)").

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;

use crate::error::{Error, Kind, Result};
use crate::state::client::ClientId;

pub type SessionId = [u8; 16];

/// Back-channel probe/availability state machine (spec.md §4.D).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BackChannelState {
    None,
    Unchecked,
    Checking,
    Good,
}

struct Slot {
    sequence: u32,
    busy: bool,
    /// Cached serialized COMPOUND reply for the last completed sequence on this
    /// slot, returned verbatim on an exact retransmit.
    cached_reply: Option<Vec<u8>>,
}

impl Slot {
    fn new() -> Self {
        Self { sequence: 0, busy: false, cached_reply: None }
    }
}

/// Outcome of processing a SEQUENCE op against a slot table.
pub enum SequenceOutcome {
    /// Proceed with the compound; call [`SlotTable::complete`] with the result once
    /// the remaining ops finish.
    Proceed,
    /// Return this cached reply verbatim without executing anything.
    Replay(Vec<u8>),
}

/// One channel's (fore or back) slot table, bounded to `size` concurrent in-flight
/// requests (spec.md: "bounded by server thread count").
pub struct SlotTable {
    slots: Mutex<Vec<Slot>>,
}

impl SlotTable {
    pub fn new(size: usize) -> Self {
        Self { slots: Mutex::new((0..size).map(|_| Slot::new()).collect()) }
    }

    pub fn size(&self) -> usize {
        self.slots.lock().expect("slot table lock poisoned").len()
    }

    /// Applies the EOS rule table (spec.md §4.D) for `(slot, sequence, highest_slot)`.
    pub fn sequence(&self, slot: u32, sequence: u32, highest_slot: u32) -> Result<SequenceOutcome> {
        let mut slots = self.slots.lock().expect("slot table lock poisoned");
        let table_size = slots.len() as u32;
        if slot >= table_size {
            return Err(Error::new(Kind::BadSlot));
        }
        if highest_slot >= table_size {
            return Err(Error::new(Kind::BadHighSlot));
        }
        let entry = &mut slots[slot as usize];
        if entry.busy {
            return Err(Error::new(Kind::SlotBusy));
        }
        if sequence == entry.sequence {
            return match &entry.cached_reply {
                Some(reply) => Ok(SequenceOutcome::Replay(reply.clone())),
                None if sequence == 0 => {
                    // First use of the slot: mark it busy like any other proceed, so a
                    // retransmit of this same still-in-flight request sees SlotBusy
                    // instead of re-executing (§8 invariant 7, EOS).
                    entry.busy = true;
                    Ok(SequenceOutcome::Proceed)
                }
                None => Err(Error::new(Kind::SeqMisordered)),
            };
        }
        if sequence == entry.sequence.wrapping_add(1) {
            entry.busy = true;
            return Ok(SequenceOutcome::Proceed);
        }
        Err(Error::new(Kind::SeqMisordered))
    }

    /// Records the result of a sequence that returned [`SequenceOutcome::Proceed`]:
    /// stores `sequence` (the value just processed, from the matching call to
    /// [`SlotTable::sequence`]) as the slot's last-completed sequence and caches the
    /// reply for an exact retransmit.
    pub fn complete(&self, slot: u32, sequence: u32, reply: Vec<u8>) {
        let mut slots = self.slots.lock().expect("slot table lock poisoned");
        if let Some(entry) = slots.get_mut(slot as usize) {
            entry.sequence = sequence;
            entry.cached_reply = Some(reply);
            entry.busy = false;
        }
    }

    /// Releases a slot without advancing its sequence (the request was never fully
    /// serviced, e.g. a fatal disconnect mid-compound).
    pub fn abandon(&self, slot: u32) {
        let mut slots = self.slots.lock().expect("slot table lock poisoned");
        if let Some(entry) = slots.get_mut(slot as usize) {
            entry.busy = false;
        }
    }
}

/// One CREATE_SESSION record (spec.md §4.D).
pub struct Session {
    pub id: SessionId,
    pub client_id: ClientId,
    pub fore_channel: SlotTable,
    pub back_channel: SlotTable,
    back_channel_state: Mutex<BackChannelState>,
    /// The client's "next sequence" pseudo-slot for CREATE_SESSION retransmit
    /// detection (spec.md §4.D "CREATE_SESSION").
    create_session_seq: AtomicU32,
    cached_create_session_reply: Mutex<Option<SessionId>>,
}

impl Session {
    fn new(id: SessionId, client_id: ClientId, fore_slots: usize, back_slots: usize) -> Self {
        Self {
            id,
            client_id,
            fore_channel: SlotTable::new(fore_slots),
            back_channel: SlotTable::new(back_slots),
            back_channel_state: Mutex::new(BackChannelState::Unchecked),
            create_session_seq: AtomicU32::new(0),
            cached_create_session_reply: Mutex::new(None),
        }
    }

    pub fn back_channel_state(&self) -> BackChannelState {
        *self.back_channel_state.lock().expect("back-channel state lock poisoned")
    }

    pub fn set_back_channel_state(&self, state: BackChannelState) {
        *self.back_channel_state.lock().expect("back-channel state lock poisoned") = state;
    }

    /// `true` once a successful zero-arg probe callback has confirmed the
    /// back-channel; delegations may only be issued when this holds (spec.md §4.D).
    pub fn back_channel_is_good(&self) -> bool {
        self.back_channel_state() == BackChannelState::Good
    }
}

/// Clamped channel attributes (spec.md §4.D CREATE_SESSION: "Channel attributes
/// are clamped to server limits").
#[derive(Debug, Copy, Clone)]
pub struct ChannelLimits {
    pub max_request_size: u32,
    pub max_response_size: u32,
    pub max_requests: usize,
}

pub struct SessionTable {
    sessions: DashMap<SessionId, std::sync::Arc<Session>>,
    next_raw: AtomicU64,
    limits: ChannelLimits,
}

impl SessionTable {
    pub fn new(limits: ChannelLimits) -> Self {
        Self { sessions: DashMap::new(), next_raw: AtomicU64::new(1), limits }
    }

    pub fn get(&self, id: &SessionId) -> Option<std::sync::Arc<Session>> {
        self.sessions.get(id).map(|e| e.clone())
    }

    /// Creates a new session for `client_id`, clamping the client's requested
    /// channel attributes to server limits.
    pub fn create(
        &self,
        client_id: ClientId,
        requested_max_requests: usize,
    ) -> std::sync::Arc<Session> {
        let raw = self.next_raw.fetch_add(1, Ordering::SeqCst);
        let mut id = [0u8; 16];
        id[0..8].copy_from_slice(&client_id.to_be_bytes());
        id[8..16].copy_from_slice(&raw.to_be_bytes());
        let slots = requested_max_requests.min(self.limits.max_requests).max(1);
        let session = std::sync::Arc::new(Session::new(id, client_id, slots, slots));
        self.sessions.insert(id, session.clone());
        session
    }

    pub fn destroy(&self, id: &SessionId) -> Result<()> {
        self.sessions.remove(id).map(|_| ()).ok_or(Error::new(Kind::BadSession))
    }

    pub fn limits(&self) -> ChannelLimits {
        self.limits
    }

    /// All sessions belonging to a client, for grace/lease cleanup.
    pub fn sessions_of(&self, client_id: ClientId) -> Vec<std::sync::Arc<Session>> {
        self.sessions.iter().filter(|e| e.value().client_id == client_id).map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_returns_cached_reply() {
        let table = SlotTable::new(4);
        assert!(matches!(table.sequence(0, 0, 0).unwrap(), SequenceOutcome::Proceed));
        table.complete(0, 0, b"reply-1".to_vec());
        match table.sequence(0, 0, 0).unwrap() {
            SequenceOutcome::Replay(reply) => assert_eq!(reply, b"reply-1"),
            _ => panic!("expected replay"),
        }
    }

    #[test]
    fn misordered_sequence_rejected() {
        let table = SlotTable::new(4);
        table.sequence(0, 0, 0).unwrap();
        table.complete(0, 0, b"r".to_vec());
        assert!(matches!(table.sequence(0, 5, 0), Err(e) if e.kind == Kind::SeqMisordered));
    }

    #[test]
    fn slot_out_of_range_is_badslot() {
        let table = SlotTable::new(2);
        assert!(matches!(table.sequence(5, 0, 0), Err(e) if e.kind == Kind::BadSlot));
    }

    #[test]
    fn busy_slot_delays() {
        let table = SlotTable::new(1);
        table.sequence(0, 0, 0).unwrap();
        assert!(matches!(table.sequence(0, 1, 0), Err(e) if e.kind == Kind::SlotBusy));
    }

    #[test]
    fn session_slots_clamped_to_server_limit() {
        let limits = ChannelLimits { max_request_size: 4096, max_response_size: 4096, max_requests: 8 };
        let table = SessionTable::new(limits);
        let session = table.create(1, 64);
        assert_eq!(session.fore_channel.size(), 8);
    }
}
