//! Shared-memory region acquirer (component A).
//!
//! Distinguishes a plain file/`/dev/shm` mapping from a `kvmfr`-style
//! character device exposing `GET_SIZE` and `CREATE_DMABUF` ioctls, following
//! the exact backend-detection rule used by the original `ivshmemOpenDev`:
//! the path must be longer than 8 bytes and start with the literal prefix
//! `/dev/kvmfr`.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use memmap2::{MmapOptions, MmapRaw};
use nix::sys::stat::fstat;
use thiserror::Error;

const PAGE_SIZE: u64 = 4096;
const KVMFR_DMABUF_FLAG_CLOEXEC: u8 = 0x1;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("shared memory path not found: {0}")]
    NotFound(PathBuf),
    #[error("permission denied opening: {0}")]
    PermissionDenied(PathBuf),
    #[error("ioctl failed: {0}")]
    IoctlFailed(#[source] std::io::Error),
    #[error("requested dma-buf range is out of range of the mapped region")]
    OutOfRange,
}

impl AcquireError {
    fn from_open_io(path: &Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AcquireError::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => AcquireError::PermissionDenied(path.to_path_buf()),
            _ => AcquireError::NotFound(path.to_path_buf()),
        }
    }
}

#[repr(C)]
struct KvmfrDmabufCreate {
    flags: u8,
    offset: u64,
    size: u64,
}

const IOC_WRITE: u32 = 1;
const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

/// Mirrors `<linux/ioctl.h>`'s `_IO`/`_IOW` macros bit-for-bit, matching the
/// encoding `kvmfr.h`'s `KVMFR_DMABUF_GETSIZE`/`KVMFR_DMABUF_CREATE` use.
const fn io(ty: u32, nr: u32) -> u64 {
    ((ty & 0xff) << IOC_TYPESHIFT | (nr & 0xff) << IOC_NRSHIFT) as u64
}

const fn iow(ty: u32, nr: u32, size: u32) -> u64 {
    ((IOC_WRITE << IOC_DIRSHIFT)
        | ((size & ((1 << IOC_SIZEBITS) - 1)) << IOC_SIZESHIFT)
        | ((ty & 0xff) << IOC_TYPESHIFT)
        | (nr & 0xff) << IOC_NRSHIFT) as u64
}

const KVMFR_DMABUF_GETSIZE: u64 = io('u' as u32, 0x44);
const KVMFR_DMABUF_CREATE: u64 = iow('u' as u32, 0x42, size_of::<KvmfrDmabufCreate>() as u32);

/// Thin wrapper over `libc::ioctl` that turns a negative return into the last
/// OS error, matching how the rest of this crate surfaces syscall failures.
unsafe fn ioctl_call(fd: RawFd, request: u64, arg: *mut libc::c_void) -> Result<i64, std::io::Error> {
    let ret = unsafe { libc::ioctl(fd, request as libc::c_ulong, arg) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret as i64)
    }
}

/// A mapped shared-memory region, optionally DMA-buf capable.
pub struct ShmRegion {
    _file: File,
    fd: OwnedFd,
    mmap: MmapRaw,
    size: usize,
    dma_capable: bool,
}

fn is_kvmfr_device(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.len() > 8 && s.starts_with("/dev/kvmfr")
}

impl ShmRegion {
    /// Open the region named by `path`. Picks the device backend iff `path`
    /// matches the kvmfr naming convention, otherwise treats it as a plain
    /// file (persistent file or `/dev/shm` entry).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AcquireError> {
        let path = path.as_ref();
        let dma_capable = is_kvmfr_device(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(0)
            .open(path)
            .map_err(|e| AcquireError::from_open_io(path, e))?;

        let size = if dma_capable {
            let fd: RawFd = file.as_raw_fd();
            let ret = unsafe {
                ioctl_call(fd, KVMFR_DMABUF_GETSIZE, std::ptr::null_mut())
            }
            .map_err(AcquireError::IoctlFailed)?;
            ret as usize
        } else {
            fstat(file.as_raw_fd())
                .map_err(|e| AcquireError::IoctlFailed(e.into()))?
                .st_size as usize
        };

        let mmap = unsafe {
            MmapOptions::new()
                .len(size)
                .map_raw(&file)
                .map_err(|e| AcquireError::from_open_io(path, e))?
        };

        let fd: OwnedFd = file.try_clone().map_err(|e| AcquireError::from_open_io(path, e))?.into();

        Ok(Self {
            _file: file,
            fd,
            mmap,
            size,
            dma_capable,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dma_capable(&self) -> bool {
        self.dma_capable
    }

    /// Read-only view of the whole region.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr(), self.size) }
    }

    /// Mutable view, needed for the client to publish its own read index back
    /// into queue state and to write outbound pointer-queue payloads.
    ///
    /// # Safety
    /// The caller must not alias this with a live `&[u8]` from [`as_bytes`]
    /// over the same bytes at the same time in a way that violates Rust's
    /// aliasing rules; the region is genuinely concurrently written by the
    /// host, so all accesses within must go through volatile/atomic loads.
    pub unsafe fn as_mut_ptr(&self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Request a DMA-buf file descriptor covering `[offset, offset+size)`,
    /// rounding `size` up to the next page boundary exactly as the original
    /// `ivshmemGetDMABuf` does (even when already page-aligned).
    pub fn dma_fd(&self, offset: u64, size: u64) -> Result<OwnedFd, AcquireError> {
        if !self.dma_capable {
            return Err(AcquireError::OutOfRange);
        }
        if offset.checked_add(size).is_none_or(|end| end > self.size as u64) {
            return Err(AcquireError::OutOfRange);
        }

        let rounded = (size & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        let mut create = KvmfrDmabufCreate {
            flags: KVMFR_DMABUF_FLAG_CLOEXEC,
            offset,
            size: rounded,
        };

        let raw = unsafe {
            ioctl_call(
                self.fd.as_raw_fd(),
                KVMFR_DMABUF_CREATE,
                &mut create as *mut _ as *mut libc::c_void,
            )
        }
        .map_err(AcquireError::IoctlFailed)?;
        // SAFETY: a non-negative ioctl return here is a freshly created fd
        // owned by us, per CREATE_DMABUF's contract.
        Ok(unsafe { OwnedFd::from_raw_fd(raw as RawFd) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_backend_detected_for_non_kvmfr_path() {
        assert!(!is_kvmfr_device(Path::new("/dev/shm/looking-glass")));
        assert!(!is_kvmfr_device(Path::new("/tmp/lg.shm")));
    }

    #[test]
    fn kvmfr_backend_detected_by_prefix() {
        assert!(is_kvmfr_device(Path::new("/dev/kvmfr0")));
        assert!(is_kvmfr_device(Path::new("/dev/kvmfr12")));
    }

    #[test]
    fn open_file_backend_reports_file_length() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; 64 * 1024]).unwrap();
        f.flush().unwrap();

        let region = ShmRegion::open(f.path()).expect("opens");
        assert_eq!(region.size(), 64 * 1024);
        assert!(!region.dma_capable());
        assert_eq!(region.as_bytes().len(), 64 * 1024);
    }

    #[test]
    fn open_missing_file_is_not_found() {
        let err = ShmRegion::open("/nonexistent/path/to/lg.shm").unwrap_err();
        assert!(matches!(err, AcquireError::NotFound(_)));
    }
}
