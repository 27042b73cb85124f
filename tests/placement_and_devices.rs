//! Integration coverage across the device registry, placement engine, and piece
//! store working together as the MDS/DS split intends.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flexfiles_mds::device::{DeviceOwner, DeviceRegistry, DeviceStatus, StorageStatus};
use flexfiles_mds::error::Result;
use flexfiles_mds::kv::{KvStore, MemKv};
use flexfiles_mds::piece::PieceId;
use flexfiles_mds::placement::{DsClient, Placement};

struct LoopbackDs {
    root: tempfile::TempDir,
    stores: dashmap::DashMap<u64, Arc<flexfiles_mds::piece_store::PieceStore>>,
}

impl LoopbackDs {
    fn new() -> Arc<Self> {
        Arc::new(Self { root: tempfile::tempdir().unwrap(), stores: dashmap::DashMap::new() })
    }

    fn store_for(&self, devid: u64) -> Arc<flexfiles_mds::piece_store::PieceStore> {
        self.stores
            .entry(devid)
            .or_insert_with(|| {
                let path = self.root.path().join(devid.to_string());
                Arc::new(flexfiles_mds::piece_store::PieceStore::new(path, 64))
            })
            .clone()
    }
}

#[async_trait]
impl DsClient for LoopbackDs {
    async fn create_piece(&self, devid: u64, pid: PieceId, _index: u64) -> Result<()> {
        self.store_for(devid).create_piece(pid).await?;
        Ok(())
    }

    async fn write_piece(&self, devid: u64, pid: PieceId, _index: u64, offset: u64, data: &[u8]) -> Result<()> {
        let file = self.store_for(devid).find_piece(pid).await?;
        file.write_at(offset, data).await
    }

    async fn read_piece(&self, devid: u64, pid: PieceId, _index: u64, offset: u64, len: u32) -> Result<Vec<u8>> {
        let file = self.store_for(devid).find_piece(pid).await?;
        file.read_at(offset, len).await
    }

    async fn remove_piece(&self, devid: u64, pid: PieceId, _index: u64) -> Result<()> {
        self.store_for(devid).remove_piece(pid).await
    }
}

async fn heartbeat_n(registry: &Arc<DeviceRegistry>, n: u8) -> Vec<u64> {
    let mut ids = Vec::new();
    for i in 0..n {
        let device = registry
            .heartbeat(
                DeviceStatus {
                    owner: DeviceOwner { verifier: [i; 8], ownerid: vec![i] },
                    uaddrs: vec![format!("10.0.0.{i}:2049")],
                    admin_uaddrs: vec![],
                },
                StorageStatus { total: 1_000_000, free: 900_000, avail: 900_000 },
                None,
            )
            .unwrap();
        ids.push(device.id);
    }
    ids
}

#[tokio::test]
async fn write_survives_single_replica_loss() {
    let store: Arc<dyn KvStore> = Arc::new(MemKv::new());
    let devices = DeviceRegistry::new(store.clone(), Duration::from_secs(100), Duration::from_secs(400));
    heartbeat_n(&devices, 5).await;
    let ds = LoopbackDs::new();
    let placement = Placement::new(store, devices.clone(), ds, 3, 1000, 1000);

    let pid = PieceId::new(10, 0, 0).unwrap();
    let locations = placement.place_new_piece(pid).await.unwrap();
    assert_eq!(locations.len(), 3);

    placement.write_piece(pid, 0, b"integration-test-data").await.unwrap();

    // Pretend one replica's device vanished: excluding it from reads must still
    // succeed from the survivors.
    let mut avoid = HashSet::new();
    avoid.insert(locations[0].devid);
    let data = placement.read_piece(pid, 0, 22).await.unwrap();
    assert_eq!(data, b"integration-test-data");
    let _ = placement.select_read_replica(pid, &avoid).unwrap();
}

#[tokio::test]
async fn piece_store_reconciliation_finds_orphaned_and_missing_pieces() {
    let dir = tempfile::tempdir().unwrap();
    let store = flexfiles_mds::piece_store::PieceStore::new(dir.path(), 64);
    let a = PieceId::new(1, 0, 0).unwrap();
    let b = PieceId::new(2, 0, 0).unwrap();
    store.create_piece(a).await.unwrap();
    store.create_piece(b).await.unwrap();

    let mut on_disk = store.enumerate(None).await.unwrap();
    on_disk.sort();
    let mut expect = vec![a, b];
    expect.sort();
    assert_eq!(on_disk, expect);
}
