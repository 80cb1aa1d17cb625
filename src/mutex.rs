//! Process-shared robust mutex.
//!
//! The mutex lives inside the shared driver region, so it is initialized in
//! place with `PTHREAD_PROCESS_SHARED` and `PTHREAD_MUTEX_ROBUST`. If the
//! owner dies while holding it, the next `lock()` gets `EOWNERDEAD`, marks
//! the mutex consistent and reports the recovery on the guard.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};

use tracing::warn;

use crate::error::{Error, Result};

/// The pthread calls used to build the mutex, separated out so setup
/// failures can be exercised.
pub trait MutexPrimitives: Send + Sync {
    fn mutexattr_init(&self, attr: *mut libc::pthread_mutexattr_t) -> i32 {
        unsafe { libc::pthread_mutexattr_init(attr) }
    }

    fn mutex_init(
        &self,
        mutex: *mut libc::pthread_mutex_t,
        attr: *const libc::pthread_mutexattr_t,
    ) -> i32 {
        unsafe { libc::pthread_mutex_init(mutex, attr) }
    }
}

/// The platform's pthread implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pthread;

impl MutexPrimitives for Pthread {}

#[repr(C)]
pub struct RobustMutex<T> {
    raw: UnsafeCell<libc::pthread_mutex_t>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RobustMutex<T> {}
unsafe impl<T: Send> Sync for RobustMutex<T> {}

impl<T> RobustMutex<T> {
    /// A mutex that must be set up with [`init_shared`](Self::init_shared)
    /// before first use.
    pub fn new(data: T) -> Self {
        Self {
            raw: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
            data: UnsafeCell::new(data),
        }
    }

    pub fn init_shared(&self) -> Result<()> {
        self.init_shared_with(&Pthread)
    }

    /// Initialize in place. Any non-zero return from the attribute or mutex
    /// setup is propagated as [`Error::LockInit`] with that code.
    pub fn init_shared_with(&self, prims: &dyn MutexPrimitives) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();

        let rc = prims.mutexattr_init(attr.as_mut_ptr());
        if rc != 0 {
            return Err(Error::LockInit(rc));
        }

        let rc = unsafe { set_robust_shared(attr.as_mut_ptr()) };
        if rc != 0 {
            unsafe { libc::pthread_mutexattr_destroy(attr.as_mut_ptr()) };
            return Err(Error::LockInit(rc));
        }

        let rc = prims.mutex_init(self.raw.get(), attr.as_ptr());
        unsafe { libc::pthread_mutexattr_destroy(attr.as_mut_ptr()) };
        if rc != 0 {
            return Err(Error::LockInit(rc));
        }

        Ok(())
    }

    pub fn lock(&self) -> Result<RobustGuard<'_, T>> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        match rc {
            0 => Ok(RobustGuard::new(self, false)),
            libc::EOWNERDEAD => {
                warn!("previous lock owner died, recovering shared state");
                let rc = unsafe { make_consistent(self.raw.get()) };
                if rc != 0 {
                    unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
                    return Err(Error::Io(std::io::Error::from_raw_os_error(rc)));
                }
                Ok(RobustGuard::new(self, true))
            }
            rc => Err(Error::Io(std::io::Error::from_raw_os_error(rc))),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_robust_shared(attr: *mut libc::pthread_mutexattr_t) -> i32 {
    let rc = libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED);
    if rc != 0 {
        return rc;
    }
    libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST)
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_robust_shared(attr: *mut libc::pthread_mutexattr_t) -> i32 {
    libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED)
}

#[cfg(target_os = "linux")]
unsafe fn make_consistent(mutex: *mut libc::pthread_mutex_t) -> i32 {
    libc::pthread_mutex_consistent(mutex)
}

#[cfg(not(target_os = "linux"))]
unsafe fn make_consistent(_mutex: *mut libc::pthread_mutex_t) -> i32 {
    0
}

/// Held lock; unlocks on drop.
pub struct RobustGuard<'a, T> {
    mutex: &'a RobustMutex<T>,
    recovered: bool,
    // must be released by the locking thread
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> RobustGuard<'a, T> {
    fn new(mutex: &'a RobustMutex<T>, recovered: bool) -> Self {
        Self {
            mutex,
            recovered,
            _not_send: PhantomData,
        }
    }

    /// The previous owner died holding the lock; protected data may be
    /// mid-update.
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl<T> Deref for RobustGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for RobustGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for RobustGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw.get());
        }
    }
}
