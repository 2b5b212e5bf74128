//! Block file implementation
//!
//! File layout:
//! - `<name>`: Data file with header + appended block payloads
//! - `<name>.idx`: Translation index mapping block keys to extents
//!
//! Blocks are never overwritten in place. A write appends the payload and
//! repoints the in-memory translation; `checkpoint()` makes the current
//! translation durable. After a crash the file reopens at its last
//! checkpointed translation.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::header::{
    create_header, encode_translation, parse_header, parse_translation, FileHeader,
    TranslationEntry, HEADER_LEN,
};

/// Maximum block payload (64 MB)
const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Current block file format version
const FORMAT_VERSION: u32 = 1;

/// How a block file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Create the file if it does not exist
    pub create: bool,
    /// Refuse writes
    pub read_only: bool,
}

impl OpenFlags {
    /// Read-write, creating the file when missing
    pub const CREATE: OpenFlags = OpenFlags {
        create: true,
        read_only: false,
    };

    /// Read-write, the file must exist
    pub const EXISTING: OpenFlags = OpenFlags {
        create: false,
        read_only: false,
    };

    /// Read-only, the file must exist
    pub const READ_ONLY: OpenFlags = OpenFlags {
        create: false,
        read_only: true,
    };
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    offset: u64,
    len: u32,
}

/// A data file addressed by block key
#[derive(Debug)]
pub struct BlockFile {
    path: PathBuf,
    idx_path: PathBuf,
    data: File,
    translation: RwLock<HashMap<u64, Extent>>,
    end: Mutex<u64>,
    read_only: bool,
}

impl BlockFile {
    /// Open or create a block file
    ///
    /// # Arguments
    /// * `path` - Data file path; the index lives next to it with `.idx` appended
    /// * `flags` - Create / read-only behaviour
    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let idx_path = index_path(&path);

        if !path.exists() {
            if !flags.create || flags.read_only {
                return Err(Error::Missing(path.display().to_string()));
            }
            Self::create_new(&path, &idx_path)?;
        }

        let mut data = OpenOptions::new()
            .read(true)
            .write(!flags.read_only)
            .open(&path)?;

        let mut header_buf = vec![0u8; HEADER_LEN];
        data.read_exact(&mut header_buf)?;
        let header = parse_header(&header_buf)?;
        if header.version != FORMAT_VERSION {
            return Err(Error::Parse(format!(
                "Unsupported block file version {}",
                header.version
            )));
        }

        let translation = if idx_path.exists() {
            let bytes = fs::read(&idx_path)?;
            parse_translation(&bytes)?
                .into_iter()
                .map(|entry| {
                    (
                        entry.key,
                        Extent {
                            offset: entry.offset,
                            len: entry.len,
                        },
                    )
                })
                .collect()
        } else {
            HashMap::new()
        };

        let end = data.metadata()?.len();
        debug!(
            "Opened block file {:?} ({} blocks, {} bytes)",
            path,
            translation.len(),
            end
        );

        Ok(BlockFile {
            path,
            idx_path,
            data,
            translation: RwLock::new(translation),
            end: Mutex::new(end),
            read_only: flags.read_only,
        })
    }

    fn create_new(path: &Path, idx_path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut data = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        data.write_all(&create_header(&FileHeader {
            version: FORMAT_VERSION,
            flags: 0,
        }))?;
        data.sync_all()?;

        write_atomically(idx_path, &encode_translation(&[]))?;
        Ok(())
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Was the file opened read-only?
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Read a block's payload
    pub fn read_block(&self, key: u64) -> Result<Vec<u8>> {
        let extent = self
            .translation
            .read()
            .get(&key)
            .copied()
            .ok_or(Error::NotFound(key))?;

        let mut buf = vec![0u8; extent.len as usize];
        self.data.read_exact_at(&mut buf, extent.offset)?;
        Ok(buf)
    }

    /// Write a block's payload
    ///
    /// The payload is appended; the previous extent stays in the file until
    /// space reclamation exists.
    pub fn write_block(&self, key: u64, bytes: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if bytes.len() > MAX_BLOCK_SIZE {
            return Err(Error::BlockTooLarge(bytes.len()));
        }

        let offset = {
            let mut end = self.end.lock();
            let offset = *end;
            *end += bytes.len() as u64;
            offset
        };
        self.data.write_all_at(bytes, offset)?;

        self.translation.write().insert(
            key,
            Extent {
                offset,
                len: bytes.len() as u32,
            },
        );
        Ok(())
    }

    /// Forget a block
    pub fn free_block(&self, key: u64) -> Result<bool> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(self.translation.write().remove(&key).is_some())
    }

    /// Is the block present in the current translation?
    pub fn contains(&self, key: u64) -> bool {
        self.translation.read().contains_key(&key)
    }

    /// All block keys, ascending
    pub fn keys(&self) -> Vec<u64> {
        let mut keys: Vec<u64> = self.translation.read().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Number of blocks in the current translation
    pub fn len(&self) -> usize {
        self.translation.read().len()
    }

    /// Check if the file holds no blocks
    pub fn is_empty(&self) -> bool {
        self.translation.read().is_empty()
    }

    /// Flush block payloads to stable storage
    pub fn sync(&self) -> Result<()> {
        self.data.sync_data()?;
        Ok(())
    }

    /// Make the current translation durable
    ///
    /// Payloads are synced first so the persisted index never points at
    /// bytes that are not on disk.
    pub fn checkpoint(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.sync()?;

        let mut entries: Vec<TranslationEntry> = self
            .translation
            .read()
            .iter()
            .map(|(key, extent)| TranslationEntry {
                key: *key,
                offset: extent.offset,
                len: extent.len,
            })
            .collect();
        entries.sort_unstable_by_key(|entry| entry.key);

        write_atomically(&self.idx_path, &encode_translation(&entries))?;
        debug!(
            "Checkpointed translation of {:?} ({} blocks)",
            self.path,
            entries.len()
        );
        Ok(())
    }
}

fn index_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".idx");
    PathBuf::from(name)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(bytes)?;
    tmp.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.ft");

        let file = BlockFile::open(&path, OpenFlags::CREATE).unwrap();
        assert!(file.is_empty());
        drop(file);

        let file = BlockFile::open(&path, OpenFlags::EXISTING).unwrap();
        assert_eq!(file.len(), 0);
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let result = BlockFile::open(dir.path().join("nope.ft"), OpenFlags::EXISTING);
        assert!(matches!(result, Err(Error::Missing(_))));
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join("blocks.ft"), OpenFlags::CREATE).unwrap();

        file.write_block(7, b"seven").unwrap();
        file.write_block(3, b"three").unwrap();

        assert_eq!(file.read_block(7).unwrap(), b"seven");
        assert_eq!(file.read_block(3).unwrap(), b"three");
        assert_eq!(file.keys(), vec![3, 7]);
    }

    #[test]
    fn test_overwrite_repoints() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join("blocks.ft"), OpenFlags::CREATE).unwrap();

        file.write_block(1, b"old").unwrap();
        file.write_block(1, b"newer").unwrap();

        assert_eq!(file.read_block(1).unwrap(), b"newer");
        assert_eq!(file.len(), 1);
    }

    #[test]
    fn test_read_not_found() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join("blocks.ft"), OpenFlags::CREATE).unwrap();

        assert!(matches!(file.read_block(42), Err(Error::NotFound(42))));
    }

    #[test]
    fn test_checkpoint_persists_translation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.ft");

        {
            let file = BlockFile::open(&path, OpenFlags::CREATE).unwrap();
            file.write_block(1, b"durable").unwrap();
            file.checkpoint().unwrap();
            file.write_block(2, b"lost").unwrap();
        }

        let file = BlockFile::open(&path, OpenFlags::EXISTING).unwrap();
        assert_eq!(file.read_block(1).unwrap(), b"durable");
        assert!(!file.contains(2));
    }

    #[test]
    fn test_free_block() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join("blocks.ft"), OpenFlags::CREATE).unwrap();

        file.write_block(5, b"x").unwrap();
        assert!(file.free_block(5).unwrap());
        assert!(!file.free_block(5).unwrap());
        assert!(!file.contains(5));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.ft");
        BlockFile::open(&path, OpenFlags::CREATE).unwrap();

        let file = BlockFile::open(&path, OpenFlags::READ_ONLY).unwrap();
        assert!(matches!(file.write_block(1, b"x"), Err(Error::ReadOnly)));
        assert!(matches!(file.checkpoint(), Err(Error::ReadOnly)));
    }
}
