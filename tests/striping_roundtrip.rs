//! Striped read/write against a full placement + device stack, plus the
//! write-back cache's commit-verifier reconciliation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flexfiles_mds::device::{DeviceOwner, DeviceRegistry, DeviceStatus, StorageStatus};
use flexfiles_mds::error::Result;
use flexfiles_mds::kv::{KvStore, MemKv};
use flexfiles_mds::piece::PieceId;
use flexfiles_mds::placement::{DsClient, Placement};
use flexfiles_mds::striping::{FileLayout, OpenFile, Striping};

struct MemDs {
    data: tokio::sync::Mutex<std::collections::HashMap<(u64, PieceId, u64), Vec<u8>>>,
}

impl MemDs {
    fn new() -> Arc<Self> {
        Arc::new(Self { data: tokio::sync::Mutex::new(Default::default()) })
    }
}

#[async_trait]
impl DsClient for MemDs {
    async fn create_piece(&self, devid: u64, pid: PieceId, index: u64) -> Result<()> {
        self.data.lock().await.entry((devid, pid, index)).or_default();
        Ok(())
    }

    async fn write_piece(&self, devid: u64, pid: PieceId, index: u64, offset: u64, data: &[u8]) -> Result<()> {
        let mut store = self.data.lock().await;
        let buf = store.entry((devid, pid, index)).or_default();
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn read_piece(&self, devid: u64, pid: PieceId, index: u64, offset: u64, len: u32) -> Result<Vec<u8>> {
        let store = self.data.lock().await;
        let buf = store.get(&(devid, pid, index)).cloned().unwrap_or_default();
        let start = (offset as usize).min(buf.len());
        let end = (start + len as usize).min(buf.len());
        Ok(buf[start..end].to_vec())
    }

    async fn remove_piece(&self, devid: u64, pid: PieceId, index: u64) -> Result<()> {
        self.data.lock().await.remove(&(devid, pid, index));
        Ok(())
    }
}

async fn setup_striping() -> Arc<Striping> {
    let store: Arc<dyn KvStore> = Arc::new(MemKv::new());
    let devices = DeviceRegistry::new(store.clone(), Duration::from_secs(100), Duration::from_secs(400));
    for i in 0..3u8 {
        devices
            .heartbeat(
                DeviceStatus { owner: DeviceOwner { verifier: [i; 8], ownerid: vec![i] }, uaddrs: vec![], admin_uaddrs: vec![] },
                StorageStatus { total: 1000, free: 1000, avail: 1000 },
                None,
            )
            .unwrap();
    }
    let placement = Placement::new(store.clone(), devices, MemDs::new(), 2, 1000, 1000);
    Striping::new(store, placement, 64)
}

#[tokio::test]
async fn write_then_read_across_two_stripe_blocks() {
    let striping = setup_striping().await;
    let layout = FileLayout { fileid: 55, blocksize: 128 };

    striping.write(layout, 0, b"12345678").await.unwrap();
    striping.write(layout, 128, b"abcdefgh").await.unwrap();

    let first = striping.read(layout, 0, 8).await.unwrap();
    let second = striping.read(layout, 128, 8).await.unwrap();
    assert_eq!(first, b"12345678");
    assert_eq!(second, b"abcdefgh");

    let pieces = striping.pieces_in_range(layout, 0, 256).await.unwrap();
    assert_eq!(pieces.len(), 2);
}

#[tokio::test]
async fn write_back_cache_revalidates_on_writeverf_mismatch() {
    let cache = OpenFile::new();
    cache.stage_write(0, b"payload").await;

    let verf_a = [1u8; 8];
    cache.flush(|_off, _data| async move { Ok(verf_a) }).await.unwrap();
    assert!(!cache.is_clean().await);

    // Server restarted between write and commit: mismatched verifier re-dirties it.
    cache.commit([2u8; 8]).await;
    assert!(!cache.is_clean().await);

    cache.flush(|_off, _data| async move { Ok(verf_a) }).await.unwrap();
    cache.commit(verf_a).await;
    assert!(cache.is_clean().await);
}
