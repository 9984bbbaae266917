//! Counting semaphores
//!
//! Wake-up primitive for the wait-list worker, the power worker and
//! `Signal` wait actions. Platform-specific implementations use the
//! most efficient primitive available.

use std::sync::Arc;
use std::time::Duration;

/// Counting semaphore
///
/// Posts are never lost: a `post` with no waiter is consumed by the
/// next `wait` or `try_wait`.
pub trait Semaphore: Send + Sync {
    /// Add one unit and wake a waiter
    fn post(&self);

    /// Take one unit, blocking until available or timeout
    ///
    /// Returns:
    /// - `true` if a unit was taken
    /// - `false` on timeout
    fn wait(&self, timeout: Option<Duration>) -> bool;

    /// Take one unit without blocking
    fn try_wait(&self) -> bool;

    /// Units currently available (hint, may be stale)
    fn value(&self) -> u32;
}

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexSemaphore as PlatformSemaphore;
    } else {
        mod fallback;
        pub use fallback::FallbackSemaphore as PlatformSemaphore;
    }
}

/// Create a new platform-appropriate semaphore with a zero count
pub fn new_semaphore() -> Arc<dyn Semaphore> {
    Arc::new(PlatformSemaphore::new(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_timeout() {
        let sem = new_semaphore();
        let start = Instant::now();
        let result = sem.wait(Some(Duration::from_millis(50)));
        let elapsed = start.elapsed();

        assert!(!result);
        assert!(elapsed >= Duration::from_millis(40)); // Allow some slack
    }

    #[test]
    fn test_posts_are_counted() {
        let sem = new_semaphore();
        sem.post();
        sem.post();
        assert_eq!(sem.value(), 2);
        assert!(sem.try_wait());
        assert!(sem.wait(Some(Duration::from_millis(10))));
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_post_wakes_waiter() {
        let sem = new_semaphore();
        let sem2 = Arc::clone(&sem);

        let handle = thread::spawn(move || sem2.wait(Some(Duration::from_secs(10))));

        // Give thread time to block
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        sem.post();

        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn test_many_waiters_each_take_one() {
        let sem = new_semaphore();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&sem);
                thread::spawn(move || s.wait(Some(Duration::from_secs(10))))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        for _ in 0..4 {
            sem.post();
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(sem.value(), 0);
    }
}
