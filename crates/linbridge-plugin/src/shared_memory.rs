//! Named shared-memory regions mapped by both host and server.

use crate::error::{BridgeError, Result};
use memmap2::MmapMut;
use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::marker::PhantomData;
use std::ops::Deref;
use std::path::PathBuf;

/// Uses `UnsafeCell` for interior mutability since the mapped region is
/// shared between processes and is written through `&self`. Callers of the
/// byte accessors must hold the mailbox turn for the range they touch.
pub struct SharedRegion {
    mmap: UnsafeCell<MmapMut>,
    name: String,
    len: usize,
    /// Creator owns the backing file and unlinks it on drop.
    owns_memory: bool,
}

impl SharedRegion {
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let path = shm_path(name);

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let file = options.open(&path).map_err(|e| {
            BridgeError::SharedMemoryError(format!(
                "Failed to create shared memory file {}: {}",
                path.display(),
                e
            ))
        })?;

        file.set_len(len as u64).map_err(|e| {
            BridgeError::SharedMemoryError(format!("Failed to set file size: {}", e))
        })?;

        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            BridgeError::SharedMemoryError(format!("Failed to create memory map: {}", e))
        })?;

        Ok(Self {
            mmap: UnsafeCell::new(mmap),
            name: name.to_string(),
            len,
            owns_memory: true,
        })
    }

    /// Attach to a region created by the peer. The file must be at least `len` bytes.
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let path = shm_path(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                BridgeError::SharedMemoryError(format!(
                    "Failed to open shared memory file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let actual = file.metadata()?.len() as usize;
        if actual < len {
            return Err(BridgeError::SharedMemoryError(format!(
                "Region {} is {} bytes, expected at least {}",
                name, actual, len
            )));
        }

        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            BridgeError::SharedMemoryError(format!("Failed to open memory map: {}", e))
        })?;

        Ok(Self {
            mmap: UnsafeCell::new(mmap),
            name: name.to_string(),
            len,
            owns_memory: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn owns_memory(&self) -> bool {
        self.owns_memory
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        // SAFETY: only the base address is taken; no reference to the map escapes
        unsafe { (*self.mmap.get()).as_mut_ptr() }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BridgeError::SharedMemoryError(format!(
                "Range {}..{} outside region {} ({} bytes)",
                offset,
                offset.saturating_add(len),
                self.name,
                self.len
            ))),
        }
    }

    /// # Safety
    /// The caller must be the only writer of `offset..offset + len` for the
    /// lifetime of the returned slice (it holds the mailbox turn).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check_range(offset, len)?;
        Ok(std::slice::from_raw_parts_mut(self.as_ptr().add(offset), len))
    }

    /// # Safety
    /// No writer may touch `offset..offset + len` while the slice is alive.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        Ok(std::slice::from_raw_parts(self.as_ptr().add(offset), len))
    }

    /// Copy `src` into the region. Caller must ensure single-writer for the range.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        // SAFETY: single writer per range is guaranteed by the mailbox turn
        let dst = unsafe { self.bytes_mut(offset, src.len())? };
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn read_bytes_into(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        // SAFETY: the writer handed over the turn before we read
        let src = unsafe { self.bytes(offset, dst.len())? };
        dst.copy_from_slice(src);
        Ok(())
    }
}

// SAFETY: SharedRegion is Sync because:
// 1. The UnsafeCell<MmapMut> is only used for interior mutability
// 2. Byte writes require the caller to hold the mailbox turn for the range
// 3. Typed layouts mapped on top only expose atomics and turn-guarded cells
unsafe impl Sync for SharedRegion {}
unsafe impl Send for SharedRegion {}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owns_memory {
            let _ = std::fs::remove_file(shm_path(&self.name));
        }
    }
}

pub fn shm_path(name: &str) -> PathBuf {
    #[cfg(target_os = "linux")]
    let base = PathBuf::from("/dev/shm");

    // The server runs under Wine, which maps the Unix root to Z:
    #[cfg(windows)]
    let base = PathBuf::from(r"Z:\dev\shm");

    #[cfg(not(any(target_os = "linux", windows)))]
    let base = std::env::temp_dir();

    base.join(name)
}

/// Marker for `#[repr(C)]` types that can be laid over a shared region.
///
/// # Safety
/// All-zero bytes must be a valid value, and every field must be mutated
/// only through atomics or cells guarded by the mailbox turn.
pub unsafe trait ShmLayout: Sync {}

/// A region viewed as a fixed-layout `T`.
pub struct Shared<T: ShmLayout> {
    region: SharedRegion,
    _layout: PhantomData<T>,
}

impl<T: ShmLayout> Shared<T> {
    pub fn create(name: &str) -> Result<Self> {
        Self::wrap(SharedRegion::create(name, std::mem::size_of::<T>())?)
    }

    pub fn open(name: &str) -> Result<Self> {
        Self::wrap(SharedRegion::open(name, std::mem::size_of::<T>())?)
    }

    fn wrap(region: SharedRegion) -> Result<Self> {
        if region.as_ptr() as usize % std::mem::align_of::<T>() != 0 {
            return Err(BridgeError::SharedMemoryError(format!(
                "Region {} is not aligned for its layout",
                region.name()
            )));
        }
        Ok(Self {
            region,
            _layout: PhantomData,
        })
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}

impl<T: ShmLayout> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: size and alignment checked at construction; zero bytes are
        // valid for T and all mutation goes through interior mutability
        unsafe { &*(self.region.as_ptr() as *const T) }
    }
}

/// Names of the regions belonging to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionNames {
    pub control: String,
    pub audio: String,
    pub params: String,
    pub chunk: String,
}

impl RegionNames {
    pub fn for_session(prefix: &str, session: &str) -> Self {
        Self {
            control: format!("{prefix}{session}_control"),
            audio: format!("{prefix}{session}_audio"),
            params: format!("{prefix}{session}_params"),
            chunk: format!("{prefix}{session}_chunk"),
        }
    }
}
