//! Filesystem object attributes shared by the directory-namespace operations
//! (spec.md §4.D OPEN/CREATE/GETATTR/SETATTR), adapted from the teacher crate's
//! NFSv3 `FileAttr`/`SetAttr` shapes onto NFSv4.1 semantics.

/// POSIX-ish file types (spec.md's file objects are always regular files or
/// directories; the remaining variants exist so GETATTR's `type` attribute can
/// still be expressed for any special files the namespace chooses to record).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharacterDevice,
    Socket,
    Fifo,
}

/// Timestamp matching NFSv4's `nfstime4`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileTime {
    pub seconds: i64,
    pub nanos: u32,
}

impl FileTime {
    pub const EPOCH: FileTime = FileTime { seconds: 0, nanos: 0 };
}

/// Attributes GETATTR can report for a piece-backed file or a directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttr {
    pub file_type: FileType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub used: u64,
    pub fileid: u64,
    pub numlinks: u32,
    pub atime: FileTime,
    pub mtime: FileTime,
    pub ctime: FileTime,
    /// `change` attribute: bumped on every data or metadata mutation, used by
    /// clients for cache validation and by layout commit to detect concurrent
    /// writers.
    pub change: u64,
}

/// Strategy for updating a timestamp in [`SetAttr`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SetTime {
    #[default]
    DontChange,
    ServerCurrent,
    ClientProvided(FileTime),
}

/// Attribute modifications accepted by SETATTR/OPEN's optional attr set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: SetTime,
    pub mtime: SetTime,
}

/// A directory entry as returned by READDIR.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntry {
    pub cookie: u64,
    pub name: String,
    pub fileid: u64,
}

/// Dynamic filesystem statistics reported by GETATTR's `space_*`/`files_*` bundle
/// (spec.md's Open Question: aggregated by summing [`crate::device::StorageStatus`]
/// across known, healthy data servers — see DESIGN.md).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct FsStat {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
}
