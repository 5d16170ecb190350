use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::task::FileSpec;

/// Random access over the logical concatenation of a task's file list.
///
/// A session is the sole writer of its store; the hasher and the peer-service
/// path only read. Implementations must therefore allow concurrent calls.
pub trait FileStore: Send + Sync {
    /// Total length of the concatenation.
    fn len(&self) -> u64;

    /// Fills `buf` from `offset`, transparently straddling file boundaries.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Writes `data` at `offset`, transparently straddling file boundaries.
    fn write_at(&self, data: &[u8], offset: u64) -> Result<()>;
}

struct Entry {
    start: u64,
    len: u64,
    file: Mutex<File>,
}

/// On-disk store over the task's file list.
///
/// The server opens source files read-only; agents pre-create every output
/// file at its declared length up front so the write path never grows a file.
pub struct DiskStore {
    entries: Vec<Entry>,
    total: u64,
}

impl DiskStore {
    /// Opens existing source files read-only (server side). Each file must
    /// already have its declared length.
    pub fn open(files: &[FileSpec]) -> Result<DiskStore> {
        let mut entries = Vec::with_capacity(files.len());
        let mut start = 0u64;
        for spec in files {
            let file = File::open(&spec.path)?;
            let actual = file.metadata()?.len();
            if actual != spec.length {
                return Err(Error::InvalidMetaInfo(format!(
                    "{} is {} bytes, dispatch says {}",
                    spec.path, actual, spec.length
                )));
            }
            entries.push(Entry {
                start,
                len: spec.length,
                file: Mutex::new(file),
            });
            start += spec.length;
        }
        Ok(DiskStore {
            entries,
            total: start,
        })
    }

    /// Creates output files under `root`, mirroring the dispatch paths, and
    /// extends each to its declared length (agent side).
    pub fn allocate(root: &Path, files: &[FileSpec]) -> Result<DiskStore> {
        let mut entries = Vec::with_capacity(files.len());
        let mut start = 0u64;
        for spec in files {
            let path = mirrored_path(root, &spec.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            file.set_len(spec.length)?;
            entries.push(Entry {
                start,
                len: spec.length,
                file: Mutex::new(file),
            });
            start += spec.length;
        }
        Ok(DiskStore {
            entries,
            total: start,
        })
    }
}

/// Where an agent materializes a dispatched file: the source path re-rooted
/// under the downloads directory.
pub fn mirrored_path(root: &Path, dispatch_path: &str) -> PathBuf {
    root.join(dispatch_path.trim_start_matches('/'))
}

impl FileStore for DiskStore {
    fn len(&self) -> u64 {
        self.total
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        check_range(self.total, offset, buf.len())?;
        let mut buf = buf;
        let mut offset = offset;
        for entry in &self.entries {
            if buf.is_empty() {
                break;
            }
            if offset >= entry.start + entry.len {
                continue;
            }
            let within = offset - entry.start;
            let n = ((entry.len - within) as usize).min(buf.len());
            let mut file = entry.file.lock().expect("file lock poisoned");
            file.seek(SeekFrom::Start(within))?;
            file.read_exact(&mut buf[..n])?;
            buf = &mut buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        check_range(self.total, offset, data.len())?;
        let mut data = data;
        let mut offset = offset;
        for entry in &self.entries {
            if data.is_empty() {
                break;
            }
            if offset >= entry.start + entry.len {
                continue;
            }
            let within = offset - entry.start;
            let n = ((entry.len - within) as usize).min(data.len());
            let mut file = entry.file.lock().expect("file lock poisoned");
            file.seek(SeekFrom::Start(within))?;
            file.write_all(&data[..n])?;
            data = &data[n..];
            offset += n as u64;
        }
        Ok(())
    }
}

/// In-memory store used by tests and small fixtures.
pub struct MemStore {
    data: Mutex<Vec<u8>>,
}

impl MemStore {
    pub fn new(len: usize) -> MemStore {
        MemStore {
            data: Mutex::new(vec![0u8; len]),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> MemStore {
        MemStore {
            data: Mutex::new(data),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().expect("mem store lock poisoned").clone()
    }
}

impl FileStore for MemStore {
    fn len(&self) -> u64 {
        self.data.lock().expect("mem store lock poisoned").len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let data = self.data.lock().expect("mem store lock poisoned");
        check_range(data.len() as u64, offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let mut inner = self.data.lock().expect("mem store lock poisoned");
        check_range(inner.len() as u64, offset, data.len())?;
        let start = offset as usize;
        inner[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

fn check_range(total: u64, offset: u64, len: usize) -> Result<()> {
    if offset + len as u64 > total {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("range {}+{} outside store of {} bytes", offset, len, total),
        )));
    }
    Ok(())
}
