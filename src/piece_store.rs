//! DS-local piece storage (spec.md §4.A).
//!
//! Owns the bytes of pieces identified by [`PieceId`], persisted under a 3-level hex
//! directory tree keyed by `fileid`, backed directly by `std::fs`/`tokio::fs` (the
//! "raw POSIX filesystem driver" is an out-of-scope collaborator — this module *is*
//! the DS-local piece store that sits on top of it). Open-file reuse is bounded by a
//! `moka::sync::Cache`, mirroring the teacher crate's use of `moka` for bounded
//! caches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Kind, Result};
use crate::piece::{FilesystemId, PieceId};

/// Reserved file at the store root holding the 16-byte `fsid`.
const META_NAME: &str = "META";

/// A single piece's backing file, with single-writer-at-a-time positional access.
pub struct DataFile {
    path: PathBuf,
    file: AsyncMutex<File>,
}

impl DataFile {
    async fn open(path: PathBuf, file: File) -> Self {
        Self { path, file: AsyncMutex::new(file) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> Result<u64> {
        let file = self.file.lock().await;
        Ok(file.metadata().await?.len())
    }

    pub async fn read_at(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        let mut file = self.file.lock().await;
        let len = file.metadata().await?.len();
        if offset >= len {
            return Ok(Vec::new());
        }
        let to_read = std::cmp::min(count as u64, len - offset) as usize;
        let mut buf = vec![0u8; to_read];
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn truncate(&self, len: u64) -> Result<()> {
        let file = self.file.lock().await;
        file.set_len(len).await?;
        Ok(())
    }

    pub async fn sync(&self) -> Result<()> {
        let file = self.file.lock().await;
        file.sync_data().await?;
        Ok(())
    }
}

/// DS-local store of piece bytes, rooted at a directory on the backing filesystem.
pub struct PieceStore {
    root: PathBuf,
    cache: moka::sync::Cache<PieceId, Arc<DataFile>>,
}

impl PieceStore {
    /// Opens (without creating) a piece store rooted at `root`, with an open-file LRU
    /// bounded by `cost_limit` entries (spec.md §4.A default: 512).
    pub fn new(root: impl Into<PathBuf>, cost_limit: u64) -> Self {
        Self { root: root.into(), cache: moka::sync::Cache::new(cost_limit) }
    }

    /// Writes the `META` file recording `fsid`, if it doesn't already exist.
    pub async fn init_fsid(&self, fsid: FilesystemId) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let meta_path = self.root.join(META_NAME);
        match fs::metadata(&meta_path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::write(&meta_path, fsid.to_bytes()).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_fsid(&self) -> Result<FilesystemId> {
        let bytes = fs::read(self.root.join(META_NAME)).await?;
        let bytes: [u8; 16] =
            bytes.as_slice().try_into().map_err(|_| Error::new(Kind::Io))?;
        Ok(FilesystemId::from_bytes(bytes))
    }

    /// The three enclosing directories and final file path for `pid`, leaf-first
    /// order reversed (root-first), as laid out in spec.md §4.A.
    fn path_components(&self, pid: &PieceId) -> (Vec<PathBuf>, PathBuf) {
        let groups = pid.fileid_hex_groups();
        let mut dirs = Vec::with_capacity(3);
        let mut dir = self.root.clone();
        for group in &groups[..3] {
            dir = dir.join(group);
            dirs.push(dir.clone());
        }
        let file_name = format!("{}-{}", groups[3], pid.file_name_suffix());
        let file_path = dir.join(file_name);
        (dirs, file_path)
    }

    /// Resolves `pid` to its backing file, failing with [`Kind::NotFound`] if absent.
    pub async fn find_piece(&self, pid: PieceId) -> Result<Arc<DataFile>> {
        if let Some(cached) = self.cache.get(&pid) {
            return Ok(cached);
        }
        let (_, file_path) = self.path_components(&pid);
        let file = OpenOptions::new().read(true).write(true).open(&file_path).await.map_err(
            |e| if e.kind() == std::io::ErrorKind::NotFound { Error::new(Kind::NotFound) } else { e.into() },
        )?;
        let data_file = Arc::new(DataFile::open(file_path, file).await);
        self.cache.insert(pid, data_file.clone());
        Ok(data_file)
    }

    /// Creates `pid`'s backing file if absent. Idempotent: an existing file is
    /// opened and returned rather than treated as an error.
    pub async fn create_piece(&self, pid: PieceId) -> Result<Arc<DataFile>> {
        if let Some(cached) = self.cache.get(&pid) {
            return Ok(cached);
        }
        let (dirs, file_path) = self.path_components(&pid);
        for dir in &dirs {
            fs::create_dir_all(dir).await?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode_0644()
            .open(&file_path)
            .await?;
        let data_file = Arc::new(DataFile::open(file_path, file).await);
        self.cache.insert(pid, data_file.clone());
        Ok(data_file)
    }

    /// Removes `pid`'s backing file and then its three enclosing directories,
    /// leaf-first, ignoring `ENOTEMPTY`. Idempotent: a missing piece is success.
    pub async fn remove_piece(&self, pid: PieceId) -> Result<()> {
        self.cache.invalidate(&pid);
        let (dirs, file_path) = self.path_components(&pid);
        match fs::remove_file(&file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for dir in dirs.iter().rev() {
            match fs::remove_dir(dir).await {
                Ok(()) => {}
                // Not empty (other pieces still live under this prefix) or already
                // gone (a racing remove got there first): both are fine to ignore.
                Err(e)
                    if e.kind() == std::io::ErrorKind::NotFound
                        || e.raw_os_error() == Some(libc_enotempty()) => {}
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Flattens the 3-level tree into a restartable enumeration of piece ids,
    /// skipping `META`, `.`, and `..`. Pass the last id seen to resume after it.
    pub async fn enumerate(&self, after: Option<PieceId>) -> Result<Vec<PieceId>> {
        let root = self.root.clone();
        let pieces = tokio::task::spawn_blocking(move || walk(&root))
            .await
            .map_err(|_| Error::new(Kind::Io))??;
        let mut pieces = pieces;
        pieces.sort();
        Ok(match after {
            Some(after) => pieces.into_iter().filter(|p| *p > after).collect(),
            None => pieces,
        })
    }
}

fn walk(root: &Path) -> Result<Vec<PieceId>> {
    let mut out = Vec::new();
    for top in std::fs::read_dir(root)? {
        let top = top?;
        if !top.file_type()?.is_dir() {
            continue; // META or stray file at the root
        }
        for mid in std::fs::read_dir(top.path())? {
            let mid = mid?;
            if !mid.file_type()?.is_dir() {
                continue;
            }
            for bottom in std::fs::read_dir(mid.path())? {
                let bottom = bottom?;
                if !bottom.file_type()?.is_dir() {
                    continue;
                }
                for entry in std::fs::read_dir(bottom.path())? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name == META_NAME || name == "." || name == ".." {
                        continue;
                    }
                    if let Some(pid) = parse_file_name(
                        &top.file_name().to_string_lossy(),
                        &mid.file_name().to_string_lossy(),
                        &bottom.file_name().to_string_lossy(),
                        &name,
                    ) {
                        out.push(pid);
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Parses a `<group0>/<group1>/<group2>/<group3>-<log2size>-<index>` path back into
/// the `PieceId` it names (used by enumeration and by RESTORING reconciliation,
/// spec.md §4.C, which parses the same name shape directly off a device).
pub fn parse_file_name(g0: &str, g1: &str, g2: &str, leaf: &str) -> Option<PieceId> {
    let mut parts = leaf.splitn(3, '-');
    let g3 = parts.next()?;
    let log2: u8 = parts.next()?.parse().ok()?;
    let offset_shifted: u64 = parts.next()?.parse().ok()?;
    let fileid = u64::from_str_radix(&format!("{g0}{g1}{g2}{g3}"), 16).ok()?;
    let (size, shift) = if log2 == 64 { (0u32, 0u8) } else { (1u32 << log2, log2) };
    let offset = offset_shifted << shift;
    PieceId::new(fileid, offset, size).ok()
}

fn libc_enotempty() -> i32 {
    // ENOTEMPTY is 39 on Linux; kept as a free function so the one platform-specific
    // constant lives in one place instead of scattered `cfg`s.
    39
}

/// Small helper trait so `create_piece` can express "mode 0644" without pulling in a
/// whole permissions module for one flag.
trait Mode0644 {
    fn mode_0644(&mut self) -> &mut Self;
}

impl Mode0644 for OpenOptions {
    #[cfg(unix)]
    fn mode_0644(&mut self) -> &mut Self {
        use std::os::unix::fs::OpenOptionsExt;
        self.mode(0o644);
        self
    }

    #[cfg(not(unix))]
    fn mode_0644(&mut self) -> &mut Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_find_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path(), 512);
        let pid = PieceId::new(1, 0, 0).unwrap();

        store.create_piece(pid).await.unwrap();
        let file = store.find_piece(pid).await.unwrap();
        file.write_at(0, b"hello").await.unwrap();
        assert_eq!(file.len().await.unwrap(), 5);

        store.remove_piece(pid).await.unwrap();
        assert!(matches!(store.find_piece(pid).await, Err(e) if e.kind == Kind::NotFound));
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path(), 512);
        let pid = PieceId::new(2, 0, 0).unwrap();
        store.create_piece(pid).await.unwrap();
        let file = store.create_piece(pid).await.unwrap();
        file.write_at(0, b"xyz").await.unwrap();
        assert_eq!(file.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path(), 512);
        let pid = PieceId::new(3, 0, 0).unwrap();
        store.remove_piece(pid).await.unwrap();
        store.remove_piece(pid).await.unwrap();
    }

    #[tokio::test]
    async fn enumerate_finds_created_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path(), 512);
        let a = PieceId::new(1, 0, 0).unwrap();
        let b = PieceId::new(2, 0, 0).unwrap();
        store.create_piece(a).await.unwrap();
        store.create_piece(b).await.unwrap();

        let mut found = store.enumerate(None).await.unwrap();
        found.sort();
        let mut expect = vec![a, b];
        expect.sort();
        assert_eq!(found, expect);
    }
}
