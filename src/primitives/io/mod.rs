#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::types::{ExtentError, Result};

/// Positioned I/O over a backing device or image file.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Writes `len` zero bytes at `off`.
    fn write_zeroes(&self, mut off: u64, len: u64) -> Result<()> {
        const CHUNK: usize = 64 * 1024;
        let zeroes = vec![0u8; CHUNK.min(len as usize)];
        let mut remaining = len;
        while remaining > 0 {
            let step = remaining.min(zeroes.len() as u64) as usize;
            self.write_at(off, &zeroes[..step])?;
            off = off
                .checked_add(step as u64)
                .ok_or(ExtentError::Invalid("zero-fill offset overflow"))?;
            remaining -= step as u64;
        }
        Ok(())
    }
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the device holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod positioned {
    use std::{fs::File, io, os::unix::fs::FileExt};

    pub fn read_at(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.read_at(dst, off)
    }

    pub fn write_at(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.write_at(src, off)
    }
}

#[cfg(windows)]
mod positioned {
    use std::{fs::File, io, os::windows::fs::FileExt};

    pub fn read_at(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    pub fn write_at(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.seek_write(src, off)
    }
}

/// Image file backed by `std::fs::File`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates `path` for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    fn read_exact(&self, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = positioned::read_at(&self.inner, dst, off)?;
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

    fn write_all(&self, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = positioned::write_at(&self.inner, src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        Ok(self.read_exact(off, dst)?)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        Ok(self.write_all(off, src)?)
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.inner.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.inner.set_len(len)?)
    }
}

/// Fixed-size in-memory device, mostly for tests and scratch volumes.
#[derive(Default)]
pub struct MemFileIo {
    bytes: RwLock<Vec<u8>>,
}

impl MemFileIo {
    /// Creates a zero-filled device of `len` bytes.
    pub fn with_len(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0u8; len]),
        }
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let start = usize::try_from(off).map_err(|_| ExtentError::Invalid("offset overflow"))?;
        let end = start + dst.len();
        if end > bytes.len() {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "read past end of device").into());
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let start = usize::try_from(off).map_err(|_| ExtentError::Invalid("offset overflow"))?;
        let end = start + src.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| ExtentError::Invalid("length overflow"))?;
        self.bytes.write().resize(len, 0);
        Ok(())
    }
}
