//! Named shared memory and process roles.
//!
//! The driver singleton lives in a POSIX shared-memory object that every
//! cooperating process maps. The primary process reserves and initializes
//! it; secondaries look it up.

use std::ffi::CString;
use std::ptr::NonNull;

use tracing::{debug, info};

use crate::config::ProcessRole;
use crate::error::{Error, Result};
use crate::mutex::{MutexPrimitives, Pthread};

/// A mapping of a named shared-memory object. Unmapped on drop; the object
/// itself stays until [`Environment::free`].
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    name: String,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Process environment the driver runs in.
pub trait Environment: Send + Sync {
    /// Whether this process creates the shared driver state.
    fn is_primary(&self) -> bool;

    /// Create a zero-filled named region. Fails if it already exists.
    fn reserve(&self, name: &str, size: usize) -> Result<SharedRegion>;

    /// Map an existing region; `Ok(None)` if nobody reserved it. A region
    /// still smaller than `size` is being created and gives
    /// [`Error::NotReady`].
    fn lookup(&self, name: &str, size: usize) -> Result<Option<SharedRegion>>;

    /// Remove the named region. Existing mappings stay valid.
    fn free(&self, name: &str) -> Result<()>;

    fn mutex_primitives(&self) -> &dyn MutexPrimitives {
        &Pthread
    }
}

/// POSIX shared memory (`shm_open` + `mmap`).
#[derive(Debug, Clone)]
pub struct PosixEnv {
    primary: bool,
}

impl PosixEnv {
    pub fn new(primary: bool) -> Self {
        Self { primary }
    }

    /// Resolve `role`; `Auto` becomes primary unless `name` already exists.
    pub fn with_role(role: ProcessRole, name: &str) -> Result<Self> {
        let primary = match role {
            ProcessRole::Primary => true,
            ProcessRole::Secondary => false,
            ProcessRole::Auto => !shm_exists(name)?,
        };
        info!(
            name,
            role = if primary { "primary" } else { "secondary" },
            "resolved process role"
        );
        Ok(Self { primary })
    }
}

impl Environment for PosixEnv {
    fn is_primary(&self) -> bool {
        self.primary
    }

    fn reserve(&self, name: &str, size: usize) -> Result<SharedRegion> {
        let cname = shm_name(name)?;

        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(Error::last_os_error());
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(err);
        }

        let region = map(fd, size, name);
        unsafe { libc::close(fd) };
        match region {
            Ok(region) => {
                debug!(name, size, "reserved shared region");
                Ok(region)
            }
            Err(e) => {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                Err(e)
            }
        }
    }

    fn lookup(&self, name: &str, size: usize) -> Result<Option<SharedRegion>> {
        let cname = shm_name(name)?;

        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(None);
            }
            return Err(Error::Io(err));
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let err = Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        if (stat.st_size as usize) < size {
            unsafe { libc::close(fd) };
            return Err(Error::NotReady(format!(
                "region '{}' is {} bytes, expected {}",
                name, stat.st_size, size
            )));
        }

        let region = map(fd, size, name);
        unsafe { libc::close(fd) };
        region.map(Some)
    }

    fn free(&self, name: &str) -> Result<()> {
        let cname = shm_name(name)?;
        if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::Io(err));
            }
        }
        debug!(name, "freed shared region");
        Ok(())
    }
}

fn shm_name(name: &str) -> Result<CString> {
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    CString::new(name).map_err(|e| Error::InvalidArgument(format!("shm name: {}", e)))
}

fn shm_exists(name: &str) -> Result<bool> {
    let cname = shm_name(name)?;
    let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0) };
    if fd < 0 {
        return Ok(false);
    }
    unsafe { libc::close(fd) };
    Ok(true)
}

fn map(fd: libc::c_int, size: usize, name: &str) -> Result<SharedRegion> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }

    Ok(SharedRegion {
        ptr: unsafe { NonNull::new_unchecked(ptr as *mut u8) },
        len: size,
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("nvme_host_shm_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_reserve_lookup_free() {
        let env = PosixEnv::new(true);
        let name = unique("rlf");

        assert!(env.lookup(&name, 64).unwrap().is_none());

        let a = env.reserve(&name, 4096).unwrap();
        assert!(unsafe { std::slice::from_raw_parts(a.as_ptr(), a.len()) }
            .iter()
            .all(|&b| b == 0));
        unsafe { *a.as_ptr() = 0x42 };

        // second mapping sees the same memory
        let b = env.lookup(&name, 4096).unwrap().unwrap();
        assert_eq!(unsafe { *b.as_ptr() }, 0x42);

        // exclusive create
        assert!(env.reserve(&name, 4096).is_err());

        // not yet sized for the requested layout
        let err = env.lookup(&name, 8192).unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
        assert!(err.is_retryable());

        env.free(&name).unwrap();
        assert!(env.lookup(&name, 64).unwrap().is_none());
        // freeing twice is fine
        env.free(&name).unwrap();
    }

    #[test]
    fn test_auto_role() {
        let name = unique("auto");
        assert!(PosixEnv::with_role(ProcessRole::Auto, &name)
            .unwrap()
            .is_primary());

        let env = PosixEnv::new(true);
        let _region = env.reserve(&name, 64).unwrap();
        assert!(!PosixEnv::with_role(ProcessRole::Auto, &name)
            .unwrap()
            .is_primary());
        assert!(PosixEnv::with_role(ProcessRole::Primary, &name)
            .unwrap()
            .is_primary());
        env.free(&name).unwrap();
    }

    #[test]
    fn test_name_with_nul_rejected() {
        let env = PosixEnv::new(true);
        assert!(matches!(
            env.reserve("bad\0name", 64),
            Err(Error::InvalidArgument(_))
        ));
    }
}
