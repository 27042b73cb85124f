//! Core identifiers shared by every component (spec.md §3): [`FilesystemId`],
//! [`FileHandle`], [`PieceId`].

use crate::error::{Error, Kind, Result};

/// 128-bit opaque identifier, persisted once in filesystem metadata. All file
/// handles begin with this prefix.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FilesystemId(pub u128);

impl FilesystemId {
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }
}

/// A contiguous byte range of a single file: the unit of striping and replication
/// (spec.md §3).
///
/// Invariants, enforced by [`PieceId::new`]:
/// * `size` is either `0` ("one piece covering the whole file") or a power of two.
/// * `offset` is a multiple of `size` when `size > 0`.
/// * `offset` is always a multiple of 128, so [`PieceId::encode_key`] can steal its
///   low 7 bits to carry `log2(size)` (sentinel `64` means `size == 0`).
///
/// `PieceId { fileid: 0, offset: 0, size: 0 }` is reserved to denote the filesystem
/// root directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceId {
    pub fileid: u64,
    pub offset: u64,
    pub size: u32,
}

/// Low 7 bits of an on-disk offset encoding are free for `log2(size)` only while
/// offsets stay aligned to this boundary.
const OFFSET_ALIGN: u64 = 128;
/// Sentinel `log2(size)` value meaning "size == 0" (whole-file piece).
const LOG2_SIZE_ZERO: u8 = 64;

impl PieceId {
    /// Reserved id denoting the filesystem root directory.
    pub const ROOT: PieceId = PieceId { fileid: 0, offset: 0, size: 0 };

    pub fn new(fileid: u64, offset: u64, size: u32) -> Result<Self> {
        if size != 0 && !size.is_power_of_two() {
            return Err(Error::new(Kind::InvalidArgument));
        }
        if size != 0 && offset % size as u64 != 0 {
            return Err(Error::new(Kind::InvalidArgument));
        }
        if offset % OFFSET_ALIGN != 0 {
            return Err(Error::new(Kind::InvalidArgument));
        }
        Ok(Self { fileid, offset, size })
    }

    /// `log2(size)`, or [`LOG2_SIZE_ZERO`] for the `size == 0` sentinel.
    pub fn log2_size(&self) -> u8 {
        if self.size == 0 {
            LOG2_SIZE_ZERO
        } else {
            self.size.trailing_zeros() as u8
        }
    }

    /// Compact key used in the `data`/`pieces` KV namespaces: `fileid` (8 bytes, big
    /// endian) followed by `offset` with its low 7 bits overwritten by
    /// [`PieceId::log2_size`] (8 bytes, big endian).
    pub fn encode_key(&self) -> [u8; 16] {
        let packed_offset = (self.offset & !(OFFSET_ALIGN - 1)) | self.log2_size() as u64;
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.fileid.to_be_bytes());
        out[8..16].copy_from_slice(&packed_offset.to_be_bytes());
        out
    }

    pub fn decode_key(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 16 {
            return Err(Error::new(Kind::InvalidArgument));
        }
        let fileid = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let packed_offset = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        let log2 = (packed_offset & (OFFSET_ALIGN - 1)) as u8;
        let offset = packed_offset & !(OFFSET_ALIGN - 1);
        let size = if log2 == LOG2_SIZE_ZERO { 0 } else { 1u32 << log2 };
        PieceId::new(fileid, offset, size)
    }

    /// Full data-store file handle encoding (spec.md §3):
    /// `fsid ‖ fileid:u64 ‖ offset:u64 ‖ size:u32`.
    pub fn encode_handle(&self, fsid: FilesystemId) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 8 + 8 + 4);
        out.extend_from_slice(&fsid.to_bytes());
        out.extend_from_slice(&self.fileid.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.size.to_be_bytes());
        out
    }

    pub fn decode_handle(bytes: &[u8]) -> Result<(FilesystemId, Self)> {
        if bytes.len() != 36 {
            return Err(Error::new(Kind::BadStateid));
        }
        let fsid = FilesystemId::from_bytes(bytes[0..16].try_into().unwrap());
        let fileid = u64::from_be_bytes(bytes[16..24].try_into().unwrap());
        let offset = u64::from_be_bytes(bytes[24..32].try_into().unwrap());
        let size = u32::from_be_bytes(bytes[32..36].try_into().unwrap());
        Ok((fsid, PieceId::new(fileid, offset, size)?))
    }

    /// Hex-grouped on-disk directory path segments used by the DS-local piece store
    /// (spec.md §4.A): the four 16-bit slices of `fileid` (top-most first).
    pub fn fileid_hex_groups(&self) -> [String; 4] {
        [
            format!("{:04x}", (self.fileid >> 48) & 0xffff),
            format!("{:04x}", (self.fileid >> 32) & 0xffff),
            format!("{:04x}", (self.fileid >> 16) & 0xffff),
            format!("{:04x}", self.fileid & 0xffff),
        ]
    }

    /// Trailing `S-O` path component: `log2(size)` and `offset >> size`.
    pub fn file_name_suffix(&self) -> String {
        let log2 = self.log2_size();
        let shift = if log2 == LOG2_SIZE_ZERO { 0 } else { log2 };
        format!("{}-{}", log2, self.offset >> shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_size() {
        assert!(PieceId::new(1, 0, 3).is_err());
    }

    #[test]
    fn rejects_misaligned_offset() {
        assert!(PieceId::new(1, 64, 0).is_err());
        assert!(PieceId::new(1, 256, 512).is_err());
    }

    #[test]
    fn key_roundtrip_zero_size() {
        let pid = PieceId::new(0x1234, 0, 0).unwrap();
        let key = pid.encode_key();
        assert_eq!(PieceId::decode_key(&key).unwrap(), pid);
    }

    #[test]
    fn key_roundtrip_pow2_size() {
        let pid = PieceId::new(7, 1 << 20, 1 << 16).unwrap();
        let key = pid.encode_key();
        assert_eq!(PieceId::decode_key(&key).unwrap(), pid);
    }

    #[test]
    fn handle_roundtrip() {
        let fsid = FilesystemId(0xdead_beef);
        let pid = PieceId::new(42, 4096, 4096).unwrap();
        let bytes = pid.encode_handle(fsid);
        let (decoded_fsid, decoded_pid) = PieceId::decode_handle(&bytes).unwrap();
        assert_eq!(decoded_fsid, fsid);
        assert_eq!(decoded_pid, pid);
    }

    #[test]
    fn root_is_zero() {
        assert_eq!(PieceId::ROOT, PieceId { fileid: 0, offset: 0, size: 0 });
    }
}
