//! Process-shared, robust, error-checking mutex.
//!
//! Every lock in this crate lives inside a `MAP_SHARED | MAP_ANONYMOUS`
//! mapping so that forked children synchronize with their parent on the
//! same kernel object. `parking_lot` cannot do that, so this is a thin
//! wrapper over the libc pthread mutex with the exact attribute set the
//! job needs:
//!
//! - `PTHREAD_PROCESS_SHARED`: usable from any process mapping the memory
//! - `PTHREAD_MUTEX_ROBUST`: a holder dying does not wedge the lock; the
//!   next locker gets `EOWNERDEAD` and re-marks the mutex consistent
//! - `PTHREAD_MUTEX_ERRORCHECK`: relocking from the same thread reports
//!   `EDEADLK` instead of deadlocking silently

use std::cell::UnsafeCell;
use std::fmt;

// ---------------------------------------------------------------------------
// LockError
// ---------------------------------------------------------------------------

/// Unexpected status from a pthread mutex call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// `EAGAIN`: the system lacked the resources to acquire the lock.
    Again,
    /// `EDEADLK`: the calling thread already holds this mutex.
    Deadlock,
    /// `ENOTRECOVERABLE`: a previous owner died and nobody recovered.
    NotRecoverable,
    /// `ENOMEM`: insufficient memory to initialize.
    NoMemory,
    /// `EPERM`: unlocking a mutex this thread does not hold.
    NotOwner,
    /// `EBUSY` / `EINVAL`: the mutex (or its attributes) is unusable.
    Invalid,
    /// Any other status code.
    Unknown(i32),
}

impl LockError {
    fn from_errno(code: i32) -> Self {
        match code {
            libc::EAGAIN => LockError::Again,
            libc::EDEADLK => LockError::Deadlock,
            libc::ENOTRECOVERABLE => LockError::NotRecoverable,
            libc::ENOMEM => LockError::NoMemory,
            libc::EPERM => LockError::NotOwner,
            libc::EBUSY | libc::EINVAL => LockError::Invalid,
            other => LockError::Unknown(other),
        }
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Again => write!(f, "mutex: EAGAIN"),
            LockError::Deadlock => write!(f, "mutex: EDEADLK (already held by this thread)"),
            LockError::NotRecoverable => write!(f, "mutex: ENOTRECOVERABLE"),
            LockError::NoMemory => write!(f, "mutex: ENOMEM"),
            LockError::NotOwner => write!(f, "mutex: EPERM (not the owner)"),
            LockError::Invalid => write!(f, "mutex: invalid or busy"),
            LockError::Unknown(code) => write!(f, "mutex: unknown status {}", code),
        }
    }
}

impl std::error::Error for LockError {}

// ---------------------------------------------------------------------------
// SharedMutex
// ---------------------------------------------------------------------------

/// A pthread mutex embedded in shared memory.
///
/// The wrapper owns nothing: the bytes live wherever the containing header
/// lives, and the kernel object they describe is shared by every process
/// that maps them. `init` and `destroy` bracket the lifetime; `lock`
/// returns an RAII guard that unlocks on drop.
#[repr(C)]
#[derive(Debug)]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// The pthread object is process-shared by construction.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialize the mutex in place with the robust / process-shared /
    /// error-checking attribute set.
    ///
    /// # Safety
    ///
    /// `self` must point into writable memory that outlives every process
    /// using the lock, and must not already hold an initialized mutex.
    pub unsafe fn init(&self) -> Result<(), LockError> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();

        let rc = libc::pthread_mutexattr_init(&mut attr);
        if rc != 0 {
            return Err(LockError::from_errno(rc));
        }

        let result = self.init_with_attr(&mut attr);

        // The attribute object is only needed during init.
        let rc = libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 && result.is_ok() {
            return Err(LockError::from_errno(rc));
        }

        result
    }

    unsafe fn init_with_attr(
        &self,
        attr: &mut libc::pthread_mutexattr_t,
    ) -> Result<(), LockError> {
        let rc = libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED);
        if rc != 0 {
            return Err(LockError::from_errno(rc));
        }
        let rc = libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST);
        if rc != 0 {
            return Err(LockError::from_errno(rc));
        }
        let rc = libc::pthread_mutexattr_settype(attr, libc::PTHREAD_MUTEX_ERRORCHECK);
        if rc != 0 {
            return Err(LockError::from_errno(rc));
        }
        let rc = libc::pthread_mutex_init(self.inner.get(), attr);
        if rc != 0 {
            return Err(LockError::from_errno(rc));
        }
        Ok(())
    }

    /// Acquire the lock, recovering it if the previous owner died.
    pub fn lock(&self) -> Result<SharedMutexGuard<'_>, LockError> {
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        match rc {
            0 => Ok(SharedMutexGuard { mutex: self }),
            libc::EOWNERDEAD => {
                // We hold the lock; the protected structure may be mid-update,
                // but arena invariants are re-checked before every mutation.
                log::warn!(
                    target: "palisade::sync",
                    "mutex owner died; marking consistent"
                );
                let rc = unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
                if rc != 0 {
                    let _ = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
                    return Err(LockError::from_errno(rc));
                }
                Ok(SharedMutexGuard { mutex: self })
            }
            code => Err(LockError::from_errno(code)),
        }
    }

    fn unlock(&self) -> Result<(), LockError> {
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(LockError::from_errno(rc))
        }
    }

    /// Tear the mutex down.
    ///
    /// # Safety
    ///
    /// No thread in any process may hold or later touch the lock.
    pub unsafe fn destroy(&self) -> Result<(), LockError> {
        let rc = libc::pthread_mutex_destroy(self.inner.get());
        if rc == 0 {
            Ok(())
        } else {
            Err(LockError::from_errno(rc))
        }
    }
}

/// RAII guard for [`SharedMutex`]; unlocks on drop.
#[derive(Debug)]
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            log::error!(target: "palisade::sync", "unlock failed: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
