//! Ring device backings.
//!
//! - `DeviceMapping`: the real thing. Opens the device node read/write, maps
//!   `page_size * mem_order` bytes `MAP_SHARED`, and issues claims as `read`
//!   calls on the same descriptor.
//! - [`SimulatedRing`](crate::sim::SimulatedRing): an in-process stand-in for
//!   the kernel side.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::claim::{CLAIM_WIRE_SIZE, ControlChannel};
use crate::error::SessionError;
use crate::region::Region;

/// A mapped ring plus its control channel.
pub trait RingDevice: ControlChannel {
    /// The mapped bytes. `len()` is the size actually mapped.
    fn region(&self) -> Region<'_>;
}

/// System page size in bytes.
pub fn page_size() -> Result<usize, SessionError> {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        return Err(SessionError::InvalidPageSize);
    }
    Ok(size as usize)
}

/// A device node mapped into this process.
///
/// Dropping it unmaps the memory and then closes the descriptor.
pub struct DeviceMapping {
    base: NonNull<u8>,
    len: usize,
    path: PathBuf,
    file: File,
}

// SAFETY: the mapping is only accessed through Region (volatile/atomic).
unsafe impl Send for DeviceMapping {}

impl DeviceMapping {
    /// Open `path` and map `page_size * mem_order` bytes of it.
    pub fn open(path: impl AsRef<Path>, mem_order: usize) -> Result<Self, SessionError> {
        let path = path.as_ref();

        let len = match page_size()?.checked_mul(mem_order) {
            Some(len) if len > 0 => len,
            _ => return Err(SessionError::InvalidMemOrder(mem_order)),
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| SessionError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let base_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if base_addr == libc::MAP_FAILED {
            // `file` is dropped (closed) on this path.
            return Err(SessionError::Map(io::Error::last_os_error()));
        }

        let Some(base) = NonNull::new(base_addr.cast::<u8>()) else {
            return Err(SessionError::Map(io::Error::other("mmap returned null")));
        };

        tracing::debug!(path = %path.display(), len, "mapped ring device");

        Ok(Self {
            base,
            len,
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ControlChannel for DeviceMapping {
    fn exchange(&mut self, buf: &mut [u8; CLAIM_WIRE_SIZE]) -> io::Result<usize> {
        // The driver reads the request out of the buffer and writes the
        // response back into it within the same read(2).
        (&self.file).read(buf)
    }
}

impl RingDevice for DeviceMapping {
    fn region(&self) -> Region<'_> {
        // SAFETY: the mapping is only released in Drop, so it outlives the
        // borrow of self; it is page aligned.
        unsafe { Region::from_raw(self.base, self.len) }
    }
}

impl Drop for DeviceMapping {
    fn drop(&mut self) {
        // SAFETY: base and len describe the mapping created in open().
        unsafe {
            libc::munmap(self.base.as_ptr().cast::<libc::c_void>(), self.len);
        }
        tracing::debug!(path = %self.path.display(), "unmapped ring device");
    }
}
