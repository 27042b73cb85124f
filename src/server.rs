//! Top-level server façades: [`Mds`] bundles the metadata-server components
//! (device registry, placement, striping, NFSv4.1 state); [`Ds`] bundles the
//! data-server's local piece store. Wire framing for either role is out of scope
//! (SPEC_FULL.md §1) — these structs are what an RPC dispatch layer would hold.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::device::DeviceRegistry;
use crate::error::Result;
use crate::kv::KvStore;
use crate::piece::FilesystemId;
use crate::piece_store::PieceStore;
use crate::placement::{DsClient, Placement};
use crate::state::layout::LayoutManager;
use crate::state::recall::BackChannel;
use crate::state::session::ChannelLimits;
use crate::state::{fresh_instance_verifier, StateManager};
use crate::striping::Striping;

/// The metadata server: owns the backing KV store handle and every component
/// that hangs off it (spec.md §2).
pub struct Mds {
    pub config: Config,
    pub store: Arc<dyn KvStore>,
    pub devices: Arc<DeviceRegistry>,
    pub placement: Arc<Placement>,
    pub striping: Arc<Striping>,
    pub state: Arc<StateManager>,
    pub layouts: LayoutManager,
    pub fsid: FilesystemId,
}

impl Mds {
    /// Assembles the MDS from a config, a KV store handle, a data-server RPC
    /// client, and a back channel for recalling delegations/layouts from clients
    /// (spec.md §4.D "Recall driver"; real RPC framing is the caller's concern, the
    /// same seam [`DsClient`] already uses). Does not block: the lease sweeper and
    /// resilver loop are spawned as background tasks and must be running on a
    /// tokio runtime.
    pub fn new(config: Config, store: Arc<dyn KvStore>, ds: Arc<dyn DsClient>, back_channel: Arc<dyn BackChannel>) -> Self {
        let fsid = FilesystemId(config.fsid_override.unwrap_or_else(|| fresh_instance_verifier() as u128));
        let devices = DeviceRegistry::new(store.clone(), config.missing_timeout(), config.dead_timeout());
        let placement = Placement::new(
            store.clone(),
            devices.clone(),
            ds,
            config.replicas,
            config.resilver_chunk_bytes as u32,
            config.resilver_rate_per_sec,
        );
        let striping = Striping::new(store.clone(), placement.clone(), config.piece_store_cache_limit);
        let limits = ChannelLimits { max_request_size: 1 << 20, max_response_size: 1 << 20, max_requests: 64 };
        let state = StateManager::new(
            fresh_instance_verifier(),
            Duration::from_secs(config.lease_s),
            Duration::from_secs(config.grace_s),
            limits,
            back_channel,
        );
        state.spawn_lease_sweeper();
        let recall_driver = state.recall.clone();
        // No shutdown signal yet: leak the sender so the receiver never resolves on
        // its own, matching the lease sweeper's run-until-process-exit lifetime.
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        std::mem::forget(shutdown_tx);
        tokio::spawn(crate::state::recall::run_periodic(recall_driver, Duration::from_secs(config.lease_s) / 10, shutdown_rx));
        let layouts = LayoutManager::new(striping.clone(), placement.clone(), fsid);
        tracing::info!(replicas = config.replicas, heartbeat_s = config.heartbeat_s, "mds started");
        Self { config, store, devices, placement, striping, state, layouts, fsid }
    }
}

/// The data server: local piece bytes plus the outbound heartbeat loop (spec.md
/// §4.A, §6 "Device → MDS heartbeat").
pub struct Ds {
    pub piece_store: Arc<PieceStore>,
    pub fsid: FilesystemId,
}

impl Ds {
    pub async fn new(root: impl Into<std::path::PathBuf>, cache_limit: u64) -> Result<Self> {
        let piece_store = Arc::new(PieceStore::new(root, cache_limit));
        let fsid = match piece_store.read_fsid().await {
            Ok(fsid) => fsid,
            Err(_) => {
                let fsid = FilesystemId(fresh_instance_verifier() as u128);
                piece_store.init_fsid(fsid).await?;
                fsid
            }
        };
        Ok(Self { piece_store, fsid })
    }
}
