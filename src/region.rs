//! # Region
//!
//! The memory every engine measures. Exactly one backing is mapped per run: the accelerator's
//! memory window through its device node at a fixed address, 1 GiB huge pages of CPU memory, or
//! plain anonymous memory. The engines only see a flat byte range.
use crate::error::{BenchError, Result};
use crate::format_size;
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

pub const GIB: usize = 1 << 30;

/// Bytes of the region prefaulted after mapping
const TOUCH_SPAN: usize = 3 * GIB;

/// Where the mapped memory comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Accelerator memory exposed through a device node, mapped at a fixed address
    Accelerator { device: PathBuf, address: usize },
    /// Anonymous CPU memory on 1 GiB huge pages
    HugePages,
    /// Anonymous CPU memory on regular pages
    Anonymous,
}

impl Backing {
    pub fn name(&self) -> &'static str {
        match self {
            Backing::Accelerator { .. } => "accelerator",
            Backing::HugePages => "hugepages",
            Backing::Anonymous => "anonymous",
        }
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Backing::Accelerator { .. })
    }
}

/// A mapped, contiguous byte range, unmapped on drop
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
    _file: Option<File>,
}

// SAFETY: the region is a plain byte range. Engines partition it into per-thread slices or share
// it only through atomics.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes with the given backing and prefault it
    pub fn map(backing: Backing, len: usize) -> Result<Self> {
        let region = match &backing {
            Backing::Accelerator { device, address } => Self::map_device(device, *address, len)?,
            Backing::HugePages => Self::map_anonymous(len, libc::MAP_HUGETLB | libc::MAP_HUGE_1GB)?,
            Backing::Anonymous => Self::map_anonymous(len, 0)?,
        };
        region.touch();
        info!(
            "Mapped {} of {} memory at {:p}",
            format_size(region.len as f32),
            region.backing.name(),
            region.ptr
        );
        Ok(region)
    }

    /// Map regular anonymous memory, the backing used when no other is configured
    pub fn anonymous(len: usize) -> Result<Self> {
        Self::map(Backing::Anonymous, len)
    }

    fn map_device(device: &Path, address: usize, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|source| BenchError::DeviceOpen {
                path: device.to_path_buf(),
                source,
            })?;

        debug!("Mapping {} at {:#x}", device.display(), address);
        // SAFETY: the fd is open for the duration of the call and MAP_FIXED_NOREPLACE refuses to
        // clobber an existing mapping at `address`.
        let ptr = unsafe {
            libc::mmap(
                address as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE,
                file.as_raw_fd(),
                0,
            )
        };
        let ptr = Self::check(ptr, "accelerator", len)?;
        Ok(MappedRegion {
            ptr,
            len,
            backing: Backing::Accelerator {
                device: device.to_path_buf(),
                address,
            },
            _file: Some(file),
        })
    }

    fn map_anonymous(len: usize, extra_flags: i32) -> Result<Self> {
        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
                -1,
                0,
            )
        };
        let huge = extra_flags & libc::MAP_HUGETLB != 0;
        if ptr == libc::MAP_FAILED && huge {
            return Err(BenchError::HugePages {
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        let ptr = Self::check(ptr, if huge { "hugepages" } else { "anonymous" }, len)?;
        Ok(MappedRegion {
            ptr,
            len,
            backing: if huge {
                Backing::HugePages
            } else {
                Backing::Anonymous
            },
            _file: None,
        })
    }

    fn check(ptr: *mut libc::c_void, backing: &'static str, len: usize) -> Result<NonNull<u8>> {
        if ptr == libc::MAP_FAILED {
            return Err(BenchError::Mapping {
                backing,
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| BenchError::Mapping {
            backing,
            len,
            source: std::io::Error::other("mmap returned a null pointer"),
        })
    }

    /// Write one byte per GiB so the first pages of every gigabyte are backed before timing
    fn touch(&self) {
        let span = self.len.min(TOUCH_SPAN);
        for offset in (0..span).step_by(GIB) {
            // SAFETY: offset < len.
            unsafe { ptr::write_volatile(self.ptr.as_ptr().add(offset), 0) };
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Pointer to `offset`, checking that `offset + len` stays inside the region
    pub fn range(&self, offset: usize, len: usize) -> Result<NonNull<u8>> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| BenchError::region_too_small(usize::MAX, self.len))?;
        if end > self.len {
            return Err(BenchError::region_too_small(end, self.len));
        }
        // SAFETY: offset <= len, so the result is inside (or one past) the mapping.
        Ok(unsafe { self.ptr.add(offset) })
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from a successful mmap and nothing borrows the region any more.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if rc != 0 {
            debug!("munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}
