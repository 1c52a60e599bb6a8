//! Named POSIX shared-memory objects and their mappings.
//!
//! An [`ShmObject`] is a handle to an object in the POSIX shm namespace
//! (`shm_open`); an [`ShmMapping`] is one `mmap` view of it. Objects are
//! created with permissions 0600 and unlinked explicitly — dropping a handle
//! only closes the descriptor.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Build the `shm_open` name for a base name: a single leading slash, no
/// other slashes allowed.
fn os_name(name: &str) -> io::Result<CString> {
    if name.is_empty() || name.contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "shm names must be non-empty and slash-free",
        ));
    }
    CString::new(format!("/{name}"))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shm name contains NUL"))
}

/// A named object in the POSIX shared-memory namespace.
pub struct ShmObject {
    fd: OwnedFd,
    name: String,
}

impl ShmObject {
    /// Create (or re-open) the object read-write. The object starts at
    /// whatever size it already has; a fresh one has size 0.
    pub fn create(name: &str) -> io::Result<Self> {
        Self::shm_open(name, libc::O_CREAT | libc::O_RDWR)
    }

    /// Open an existing object read-write. Fails with `NotFound` if the name
    /// does not exist.
    pub fn open_rw(name: &str) -> io::Result<Self> {
        Self::shm_open(name, libc::O_RDWR)
    }

    /// Open an existing object read-only.
    pub fn open_ro(name: &str) -> io::Result<Self> {
        Self::shm_open(name, libc::O_RDONLY)
    }

    fn shm_open(name: &str, flags: libc::c_int) -> io::Result<Self> {
        let c_name = os_name(name)?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o600 as libc::c_uint) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: shm_open succeeded, fd is a fresh open descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            fd,
            name: name.to_string(),
        })
    }

    /// Current size of the object in bytes.
    pub fn size(&self) -> io::Result<u64> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(self.fd.as_raw_fd(), &mut st) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(st.st_size as u64)
    }

    /// Device/inode pair identifying this object instance. Two handles on the
    /// same name can refer to different instances if the name was unlinked and
    /// recreated in between.
    pub fn identity(&self) -> io::Result<(u64, u64)> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(self.fd.as_raw_fd(), &mut st) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((st.st_dev as u64, st.st_ino as u64))
    }

    /// Grow the object to `len` bytes. Never shrinks.
    pub fn grow(&self, len: u64) -> io::Result<()> {
        if len <= self.size()? {
            return Ok(());
        }
        let ret = unsafe { libc::ftruncate(self.fd.as_raw_fd(), len as libc::off_t) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Remove the name from the shm namespace. Idempotent: a missing name is
    /// logged at debug level, not an error. Existing mappings stay valid.
    pub fn unlink(name: &str) {
        let Ok(c_name) = os_name(name) else {
            return;
        };
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            tracing::debug!(name, error = %io::Error::last_os_error(), "shm_unlink failed");
        } else {
            tracing::debug!(name, "unlinked shm object");
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One `mmap` view of a shared-memory object. Unmapped on drop.
pub struct ShmMapping {
    ptr: *mut u8,
    len: usize,
}

impl ShmMapping {
    /// Map `len` bytes of `object` read-write.
    pub fn map_rw(object: &ShmObject, len: usize) -> io::Result<Self> {
        Self::map(object, len, libc::PROT_READ | libc::PROT_WRITE)
    }

    /// Map `len` bytes of `object` read-only.
    pub fn map_ro(object: &ShmObject, len: usize) -> io::Result<Self> {
        Self::map(object, len, libc::PROT_READ)
    }

    fn map(object: &ShmObject, len: usize, prot: libc::c_int) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map zero bytes",
            ));
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                object.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: the mapping is valid for the lifetime of ShmMapping and the memory
// it points at is shared by design; synchronization is the caller's concern.
unsafe impl Send for ShmMapping {}
unsafe impl Sync for ShmMapping {}
