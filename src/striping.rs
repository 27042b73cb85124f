//! Striped file I/O (spec.md §4.E): maps a regular file's byte ranges onto
//! [`PieceId`]s, and (when this service also acts as an NFS client against
//! another server) the write-back cache an `OpenFile` uses to stage dirty data.

use std::collections::BTreeMap;
use std::sync::Arc;

use moka::sync::Cache;
use tokio::sync::Mutex;

use crate::error::{Error, Kind, Result};
use crate::kv::{self, KvStore, Namespace};
use crate::piece::PieceId;
use crate::placement::Placement;

/// A file's piece-layout parameters: every piece is `blocksize` bytes (0 means "one
/// piece covers the whole file").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FileLayout {
    pub fileid: u64,
    pub blocksize: u64,
}

/// Maps byte ranges of a file onto [`PieceId`]s, with an LRU cache of recently
/// resolved pieces sitting in front of the `data` KV namespace (spec.md §4.E).
pub struct Striping {
    store: Arc<dyn KvStore>,
    placement: Arc<Placement>,
    cache: Cache<PieceId, ()>,
}

impl Striping {
    pub fn new(store: Arc<dyn KvStore>, placement: Arc<Placement>, cache_limit: u64) -> Arc<Self> {
        Arc::new(Self { store, placement, cache: Cache::new(cache_limit) })
    }

    /// The piece id covering `offset` in `layout`. On a miss against the `data`
    /// namespace with `for_writing`, allocates a new piece via the placement
    /// engine (spec.md §4.E).
    pub async fn data_piece(&self, layout: FileLayout, offset: u64, for_writing: bool) -> Result<PieceId> {
        let bn = if layout.blocksize == 0 { 0 } else { offset / layout.blocksize };
        let piece_off = bn * layout.blocksize;
        let pid = PieceId::new(layout.fileid, piece_off, layout.blocksize as u32)?;

        if self.cache.contains_key(&pid) {
            return Ok(pid);
        }
        if self.store.get(Namespace::Data, &pid.encode_key()).is_some() {
            self.cache.insert(pid, ());
            return Ok(pid);
        }
        if !for_writing {
            return Err(Error::new(Kind::NotFound));
        }
        self.placement.place_new_piece(pid).await?;
        self.cache.insert(pid, ());
        Ok(pid)
    }

    /// Every piece covering `[offset, offset+length)`, used by LAYOUTGET to build
    /// the flex-files mirror list (spec.md §4.D LAYOUTGET). `length = u64::MAX`
    /// means "to EOF" and yields pieces until the layout runs out of known pieces.
    pub async fn pieces_in_range(&self, layout: FileLayout, offset: u64, length: u64) -> Result<Vec<PieceId>> {
        if layout.blocksize == 0 {
            return Ok(vec![self.data_piece(layout, 0, false).await.unwrap_or(PieceId::new(layout.fileid, 0, 0)?)]);
        }
        let end = offset.saturating_add(length);
        let mut out = Vec::new();
        let mut cursor = offset - (offset % layout.blocksize);
        while cursor < end {
            match self.data_piece(layout, cursor, false).await {
                Ok(pid) => out.push(pid),
                Err(e) if e.kind == Kind::NotFound => break,
                Err(e) => return Err(e),
            }
            cursor += layout.blocksize;
            if length == u64::MAX && out.len() > 1 && out.last().copied() == out.get(out.len() - 2).copied() {
                break; // defensive: a non-advancing cursor would spin forever
            }
        }
        if out.is_empty() {
            out.push(self.data_piece(layout, offset, true).await?);
        }
        Ok(out)
    }

    pub async fn read(&self, layout: FileLayout, offset: u64, len: u32) -> Result<Vec<u8>> {
        let pid = self.data_piece(layout, offset, false).await?;
        let piece_offset = offset - pid.offset;
        self.placement.read_piece(pid, piece_offset, len).await
    }

    pub async fn write(&self, layout: FileLayout, offset: u64, data: &[u8]) -> Result<()> {
        let pid = self.data_piece(layout, offset, true).await?;
        let piece_offset = offset - pid.offset;
        self.placement.write_piece(pid, piece_offset, data).await
    }

    /// Updates a file's recorded size after a write or LAYOUTCOMMIT, for files with
    /// non-zero blocksize tracked purely by their pieces' extents (the single-piece
    /// case stores size directly in file metadata, out of scope here).
    pub fn record_file_size(&self, fileid: u64, size: u64) -> Result<()> {
        let mut txn = self.store.begin();
        txn.put(Namespace::Default, format!("size:{fileid}").into_bytes(), kv::be_u64(size).to_vec());
        txn.commit()
    }

    pub fn file_size(&self, fileid: u64) -> u64 {
        self.store
            .get(Namespace::Default, format!("size:{fileid}").as_bytes())
            .and_then(|v| v.try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0)
    }
}

/// Consistency state of one cached extent in an [`OpenFile`]'s write-back cache
/// (spec.md §4.E, client-side data cache).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExtentState {
    Dirty,
    Unstable,
    Stable,
}

#[derive(Debug, Clone)]
struct Extent {
    state: ExtentState,
    data: Vec<u8>,
    writeverf: Option<[u8; 8]>,
}

/// Write-back cache for a file this service has open as an NFS client of another
/// server — used by the resilver when it needs to read/write through a standard
/// NFS client path rather than the piece store directly (spec.md §4.E).
pub struct OpenFile {
    extents: Mutex<BTreeMap<u64, Extent>>,
}

impl Default for OpenFile {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFile {
    pub fn new() -> Self {
        Self { extents: Mutex::new(BTreeMap::new()) }
    }

    /// Stages a write as DIRTY.
    pub async fn stage_write(&self, offset: u64, data: &[u8]) {
        let mut extents = self.extents.lock().await;
        extents.insert(offset, Extent { state: ExtentState::Dirty, data: data.to_vec(), writeverf: None });
    }

    /// Flushes every DIRTY extent to the server, moving it to UNSTABLE on success.
    pub async fn flush<F, Fut>(&self, mut write_to_server: F) -> Result<()>
    where
        F: FnMut(u64, Vec<u8>) -> Fut,
        Fut: std::future::Future<Output = Result<[u8; 8]>>,
    {
        let mut extents = self.extents.lock().await;
        let dirty: Vec<u64> = extents.iter().filter(|(_, e)| e.state == ExtentState::Dirty).map(|(&o, _)| o).collect();
        for offset in dirty {
            let data = extents.get(&offset).expect("offset from this map").data.clone();
            let verf = write_to_server(offset, data).await?;
            if let Some(extent) = extents.get_mut(&offset) {
                extent.state = ExtentState::Unstable;
                extent.writeverf = Some(verf);
            }
        }
        Ok(())
    }

    /// Applies a COMMIT response: UNSTABLE extents whose stored `writeverf` matches
    /// `server_writeverf` move to STABLE; a mismatch means the server restarted
    /// between write and commit, so those extents go back to DIRTY to be re-sent
    /// (spec.md §4.E).
    pub async fn commit(&self, server_writeverf: [u8; 8]) {
        let mut extents = self.extents.lock().await;
        for extent in extents.values_mut() {
            if extent.state != ExtentState::Unstable {
                continue;
            }
            if extent.writeverf == Some(server_writeverf) {
                extent.state = ExtentState::Stable;
            } else {
                extent.state = ExtentState::Dirty;
            }
        }
    }

    pub async fn is_clean(&self) -> bool {
        self.extents.lock().await.values().all(|e| e.state == ExtentState::Stable)
    }
}
