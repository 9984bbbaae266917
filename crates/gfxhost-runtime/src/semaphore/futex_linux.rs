//! Linux futex-based semaphore
//!
//! Futex word semantics: the word is the available count. Waiters
//! sleep with FUTEX_WAIT while it reads 0; `post` increments it and
//! issues FUTEX_WAKE for one waiter when anyone is asleep.

use super::Semaphore;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub struct FutexSemaphore {
    /// Futex word: available units
    count: AtomicU32,

    /// Threads inside FUTEX_WAIT (lets `post` skip the syscall)
    waiters: AtomicUsize,
}

impl FutexSemaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            count: AtomicU32::new(initial),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Sleep while the count reads 0. Spurious returns are fine, the
    /// caller re-checks.
    fn futex_wait(&self, timeout: Option<Duration>) {
        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });

        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.count.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexSemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Semaphore for FutexSemaphore {
    fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);

        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }

        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.count.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.try_wait() {
                return true;
            }

            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    Some(d - now)
                }
                None => None,
            };

            self.waiters.fetch_add(1, Ordering::SeqCst);
            self.futex_wait(remaining);
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn try_wait(&self) -> bool {
        let mut cur = self.count.load(Ordering::Acquire);
        while cur > 0 {
            match self.count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
        false
    }

    fn value(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}
