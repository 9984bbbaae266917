//! Fallback semaphore using std::sync::Condvar
//!
//! Used on platforms without futex support.

use super::Semaphore;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct FallbackSemaphore {
    count: Mutex<u32>,
    condvar: Condvar,
}

impl FallbackSemaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }
}

impl Default for FallbackSemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Semaphore for FallbackSemaphore {
    fn post(&self) {
        *self.count.lock().unwrap() += 1;
        self.condvar.notify_one();
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    count = self.condvar.wait_timeout(count, d - now).unwrap().0;
                }
                None => count = self.condvar.wait(count).unwrap(),
            }
        }
        *count -= 1;
        true
    }

    fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    fn value(&self) -> u32 {
        *self.count.lock().unwrap()
    }
}
