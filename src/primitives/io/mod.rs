use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use memmap2::{MmapMut, MmapOptions};

use crate::types::{Result, StoreError};

/// Open file together with the path it was opened from, so every failure can
/// name the file it happened on.
pub struct FileHandle {
    file: File,
    path: PathBuf,
}

impl FileHandle {
    /// Wraps an already opened file.
    pub fn new(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
        }
    }

    /// Underlying OS file.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .finish()
    }
}

/// Directory listing entry returned by [`FilesFacade::list_dir`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    /// File or directory name.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Every file system operation the storage core performs.
///
/// The engine only touches the disk through this trait so tests can substitute
/// an implementation that fails selected operations.
pub trait FilesFacade: Send + Sync + 'static {
    /// Opens a file read-write, creating it when missing.
    fn open_rw(&self, path: &Path) -> Result<FileHandle>;
    /// Opens an existing file read-only.
    fn open_ro(&self, path: &Path) -> Result<FileHandle>;
    /// Current physical length of the file.
    fn length(&self, fh: &FileHandle) -> Result<u64>;
    /// Truncates or extends the file.
    fn truncate(&self, fh: &FileHandle, len: u64) -> Result<()>;
    /// Maps `len` bytes of the file starting at `offset` for writing.
    fn map_rw(&self, fh: &FileHandle, offset: u64, len: usize) -> Result<MmapMut>;
    /// Releases a mapping, flushing nothing.
    fn unmap(&self, fh: &FileHandle, map: MmapMut) -> Result<()> {
        let _ = fh;
        drop(map);
        Ok(())
    }
    /// Reads exactly `dst.len()` bytes at `off`.
    fn read_at(&self, fh: &FileHandle, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Flushes file data and metadata.
    fn fsync(&self, fh: &FileHandle) -> Result<()>;
    /// Renames a file or directory.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    /// Removes a file.
    fn remove_file(&self, path: &Path) -> Result<()>;
    /// Removes a directory tree.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
    /// Creates a directory and its parents.
    fn mkdirs(&self, path: &Path) -> Result<()>;
    /// Whether a file or directory exists at `path`.
    fn exists(&self, path: &Path) -> bool;
    /// Flushes a directory's entries so renames inside it survive a crash.
    fn fsync_dir(&self, dir: &Path) -> Result<()> {
        sync_directory(dir).map_err(|err| StoreError::storage_io("fsync_dir", dir, err))
    }
    /// Lists the entries of a directory.
    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>>;

    /// Reads a whole file into memory.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let fh = self.open_ro(path)?;
        let len = self.length(&fh)? as usize;
        let mut buf = vec![0u8; len];
        if len > 0 {
            self.read_at(&fh, 0, &mut buf)?;
        }
        Ok(buf)
    }

    /// Replaces `path` with `bytes` by writing a sibling and renaming it over.
    fn write_file_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()>;
}

/// Shared facade handle.
pub type SharedFilesFacade = Arc<dyn FilesFacade>;

#[cfg(unix)]
fn sync_directory(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }
}

/// [`FilesFacade`] backed by `std::fs` and `memmap2`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdFilesFacade;

impl StdFilesFacade {
    /// Returns the facade as a shared trait object.
    pub fn shared() -> SharedFilesFacade {
        Arc::new(StdFilesFacade)
    }

    #[cfg(unix)]
    fn read_exact(file: &File, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_unix::read_exact(file, off, dst)
    }

    #[cfg(windows)]
    fn read_exact(file: &File, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_win::read_exact(file, off, dst)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact(_file: &File, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned reads unsupported on this platform",
        ))
    }
}

impl FilesFacade for StdFilesFacade {
    fn open_rw(&self, path: &Path) -> Result<FileHandle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| StoreError::storage_io("open", path, err))?;
        Ok(FileHandle::new(file, path))
    }

    fn open_ro(&self, path: &Path) -> Result<FileHandle> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|err| StoreError::storage_io("open", path, err))?;
        Ok(FileHandle::new(file, path))
    }

    fn length(&self, fh: &FileHandle) -> Result<u64> {
        let meta = fh
            .file()
            .metadata()
            .map_err(|err| StoreError::storage_io("stat", fh.path(), err))?;
        Ok(meta.len())
    }

    fn truncate(&self, fh: &FileHandle, len: u64) -> Result<()> {
        fh.file()
            .set_len(len)
            .map_err(|err| StoreError::storage_io("truncate", fh.path(), err))
    }

    #[allow(unsafe_code)]
    fn map_rw(&self, fh: &FileHandle, offset: u64, len: usize) -> Result<MmapMut> {
        // memmap2 aligns the offset down to the OS page and hides the delta, so
        // column pages smaller than the OS page map fine.
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(fh.file()) };
        map.map_err(|err| StoreError::map_failed(fh.path(), len, err))
    }

    fn read_at(&self, fh: &FileHandle, off: u64, dst: &mut [u8]) -> Result<()> {
        Self::read_exact(fh.file(), off, dst)
            .map_err(|err| StoreError::storage_io("read", fh.path(), err))
    }

    fn fsync(&self, fh: &FileHandle) -> Result<()> {
        fh.file()
            .sync_all()
            .map_err(|err| StoreError::storage_io("fsync", fh.path(), err))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(|err| StoreError::storage_io("rename", from, err))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|err| StoreError::storage_io("remove", path, err))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path).map_err(|err| StoreError::storage_io("remove", path, err))
    }

    fn mkdirs(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|err| StoreError::storage_io("mkdir", path, err))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(path).map_err(|err| StoreError::storage_io("list", path, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::storage_io("list", path, err))?;
            let file_type = entry
                .file_type()
                .map_err(|err| StoreError::storage_io("list", entry.path(), err))?;
            out.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: file_type.is_dir(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn write_file_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file =
                File::create(&tmp).map_err(|err| StoreError::storage_io("open", &tmp, err))?;
            file.write_all(bytes)
                .map_err(|err| StoreError::storage_io("write", &tmp, err))?;
            file.sync_all()
                .map_err(|err| StoreError::storage_io("fsync", &tmp, err))?;
        }
        self.rename(&tmp, path)?;
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.fsync_dir(parent),
            _ => self.fsync_dir(Path::new(".")),
        }
    }
}
