//! pNFS flex-files layout issuance (spec.md §4.D "LAYOUTGET / LAYOUTRETURN /
//! LAYOUTCOMMIT").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Kind, Result};
use crate::piece::FilesystemId;
use crate::placement::Placement;
use crate::state::client::ClientId;
use crate::state::open::FileState;
use crate::state::stateid::{StateId, StateIdAllocator, ANONYMOUS};
use crate::striping::{FileLayout, Striping};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoMode {
    Read,
    ReadWrite,
}

/// A single mirror (replica) of a layout segment (spec.md §4.D LAYOUTGET).
#[derive(Debug, Clone)]
pub struct FlexFilesMirror {
    pub device_id: u64,
    pub efficiency: u32,
    pub stateid: StateId,
    pub data_server_handle: Vec<u8>,
    pub uid: String,
    pub gid: String,
}

/// Sentinel length meaning "to infinity" (spec.md: reported on the last piece of a
/// read layout, or on any layout over a `size == 0` single-piece file).
pub const LENGTH_INFINITY: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct LayoutSegment {
    pub offset: u64,
    pub length: u64,
    pub iomode: IoMode,
    pub mirrors: Vec<FlexFilesMirror>,
}

/// Per-file record of which clients hold a layout (spec.md §5 "one mutex per file
/// protects ... cached file handles").
#[derive(Default)]
pub struct LayoutState {
    by_client: Mutex<HashMap<ClientId, (StateId, IoMode)>>,
}

impl LayoutState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder_other_than(&self, client_id: ClientId) -> Option<(ClientId, IoMode)> {
        self.by_client
            .lock()
            .expect("layout state lock poisoned")
            .iter()
            .find(|(&id, _)| id != client_id)
            .map(|(&id, &(_, iomode))| (id, iomode))
    }

    pub fn stateid_of(&self, client_id: ClientId) -> Option<StateId> {
        self.by_client.lock().expect("layout state lock poisoned").get(&client_id).map(|(s, _)| *s)
    }

    fn record(&self, client_id: ClientId, stateid: StateId, iomode: IoMode) {
        self.by_client.lock().expect("layout state lock poisoned").insert(client_id, (stateid, iomode));
    }

    /// `LAYOUTRETURN4_FILE`: clears this client's single layout, bumping seqid.
    pub fn return_file(&self, client_id: ClientId) {
        self.by_client.lock().expect("layout state lock poisoned").remove(&client_id);
    }

    /// Current `seqid` and owning client of a stateid's `other`, if this file's
    /// layout table knows about it (TEST_STATEID/FREE_STATEID).
    pub fn owner_and_seqid(&self, other: [u8; 12]) -> Option<(ClientId, u32)> {
        self.by_client
            .lock()
            .expect("layout state lock poisoned")
            .iter()
            .find(|(_, &(stateid, _))| stateid.other == other)
            .map(|(&client_id, &(stateid, _))| (client_id, stateid.seqid))
    }
}

pub struct LayoutManager {
    striping: Arc<Striping>,
    placement: Arc<Placement>,
    fsid: FilesystemId,
}

impl LayoutManager {
    pub fn new(striping: Arc<Striping>, placement: Arc<Placement>, fsid: FilesystemId) -> Self {
        Self { striping, placement, fsid }
    }

    /// Issues a flex-files layout covering `[offset, offset+length)` (spec.md §4.D).
    /// `file_state` gates the same-conflict check OPEN uses; `uid`/`gid` are the
    /// strings stamped into each mirror for the DS to map against.
    pub async fn layoutget(
        &self,
        client_id: ClientId,
        file_state: &FileState,
        layout_state: &LayoutState,
        layout: FileLayout,
        offset: u64,
        length: u64,
        iomode: IoMode,
        allocator: &StateIdAllocator,
        uid: &str,
        gid: &str,
    ) -> Result<(StateId, Vec<LayoutSegment>)> {
        match iomode {
            IoMode::Read if file_state.is_write_open_by_other(client_id) => {
                return Err(Error::new(Kind::ShareDenied));
            }
            IoMode::ReadWrite if file_state.is_open_by_other(client_id) => {
                return Err(Error::new(Kind::ShareDenied));
            }
            _ => {}
        }

        if iomode == IoMode::ReadWrite && layout.blocksize != 0 && layout.blocksize < length {
            return Err(Error::new(Kind::LayoutUnavailable));
        }

        let pieces = self.striping.pieces_in_range(layout, offset, length).await?;
        if pieces.is_empty() {
            return Err(Error::new(Kind::NoMatchingLayout));
        }

        let whole_file = layout.blocksize == 0;
        let mut segments = Vec::with_capacity(pieces.len());
        for (index, pid) in pieces.iter().enumerate() {
            let locations = self.placement.locations(*pid);
            let mirrors = locations
                .into_iter()
                .map(|loc| FlexFilesMirror {
                    device_id: loc.devid,
                    efficiency: 0,
                    stateid: ANONYMOUS,
                    data_server_handle: pid.encode_handle(self.fsid),
                    uid: uid.to_string(),
                    gid: gid.to_string(),
                })
                .collect();
            let is_last = index + 1 == pieces.len();
            let length = if whole_file || (iomode == IoMode::Read && is_last) {
                LENGTH_INFINITY
            } else {
                layout.blocksize
            };
            segments.push(LayoutSegment { offset: pid.offset, length, iomode, mirrors });
        }

        let stateid = match layout_state.stateid_of(client_id) {
            Some(mut existing) => {
                existing.seqid += 1;
                existing
            }
            None => allocator.allocate(),
        };
        layout_state.record(client_id, stateid, iomode);
        Ok((stateid, segments))
    }

    /// LAYOUTCOMMIT: applies the client's observed `last_write_offset`/mtime to the
    /// file, returning the new size if the file grew (spec.md §4.D).
    pub fn layoutcommit(&self, fileid: u64, last_write_offset: u64) -> Result<Option<u64>> {
        let current = self.striping.file_size(fileid);
        let candidate = last_write_offset + 1;
        if candidate > current {
            self.striping.record_file_size(fileid, candidate)?;
            Ok(Some(candidate))
        } else {
            Ok(None)
        }
    }
}
