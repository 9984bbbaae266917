//! Wait-list worker thread
//!
//! Single thread that sleeps on the wait list's wake semaphore and
//! fires nodes once the interrupt handler reports passed thresholds.
//! In poll mode it also wakes on a fixed period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gfxhost_core::error::{HostError, HostResult};
use gfxhost_core::kdebug;

use super::{WaitList, WorkerEvent};

const THREAD_NAME: &str = "gfxhost-waitlist";

/// Period between hardware polls in poll mode
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Statistics from worker execution
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Times the worker woke up
    pub wakeups: u64,

    /// Nodes fired
    pub fired: u64,

    /// Largest number of nodes fired in one pass
    pub max_batch: usize,

    /// Time spent firing nodes
    pub busy: Duration,
}

/// Handle to a running wait-list worker
pub struct WaitListHandle {
    handle: Option<JoinHandle<WorkerStats>>,
    shutdown: Arc<AtomicBool>,
    waitlist: Arc<WaitList>,
}

impl WaitListHandle {
    /// Request shutdown and wait for the worker to exit
    pub fn shutdown(mut self) -> WorkerStats {
        self.stop()
    }

    fn stop(&mut self) -> WorkerStats {
        self.request_shutdown();
        match self.handle.take() {
            Some(h) => h.join().unwrap_or_default(),
            None => WorkerStats::default(),
        }
    }

    /// Request shutdown without waiting
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.waitlist.post_event(WorkerEvent::Shutdown);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for WaitListHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

/// Spawn the wait-list worker
pub fn spawn_worker(waitlist: Arc<WaitList>) -> HostResult<WaitListHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let wl = Arc::clone(&waitlist);
    let flag = Arc::clone(&shutdown);

    let handle = thread::Builder::new()
        .name(THREAD_NAME.into())
        .spawn(move || worker_loop(wl, flag))
        .map_err(|e| HostError::Spawn(e.to_string()))?;

    Ok(WaitListHandle {
        handle: Some(handle),
        shutdown,
        waitlist,
    })
}

fn worker_loop(wl: Arc<WaitList>, shutdown: Arc<AtomicBool>) -> WorkerStats {
    let mut stats = WorkerStats::default();
    let timeout = wl.is_poll_mode().then_some(POLL_INTERVAL);

    while !shutdown.load(Ordering::Acquire) {
        wl.wake.wait(timeout);
        stats.wakeups += 1;

        let mut run = wl.is_poll_mode();
        while let Some(event) = wl.events.pop() {
            match event {
                WorkerEvent::Thresholds => run = true,
                WorkerEvent::Shutdown => {}
            }
        }
        if shutdown.load(Ordering::Acquire) || !run {
            continue;
        }

        let start = Instant::now();
        let fired = wl.process_passed();
        stats.fired += fired as u64;
        stats.max_batch = stats.max_batch.max(fired);
        stats.busy += start.elapsed();
    }

    kdebug!("wait-list worker exiting, {} nodes fired", stats.fired);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HostClock;
    use crate::semaphore::{new_semaphore, Semaphore};
    use crate::syncpt::Counters;
    use crate::waitlist::WaitAction;
    use gfxhost_core::counter::reserved;
    use gfxhost_core::CounterId;
    use gfxhost_hw::SimBackend;

    fn poll_list(sim: &SimBackend) -> Arc<WaitList> {
        let clock = Arc::new(HostClock::new(sim.power.clone()));
        let counters = Arc::new(Counters::new(sim.host.clone(), reserved::MASK, 0));
        Arc::new(WaitList::new(sim.host.clone(), clock, counters, new_semaphore(), true))
    }

    #[test]
    fn test_worker_counts_fired_nodes() {
        let sim = SimBackend::new();
        let wl = poll_list(&sim);
        let handle = spawn_worker(wl.clone()).unwrap();

        let sem = new_semaphore();
        let id = CounterId::new(12);
        wl.schedule(id, 1, WaitAction::Signal(sem.clone())).unwrap();
        sim.host.advance_counter(id, 1);
        assert!(sem.wait(Some(Duration::from_secs(2))));

        let stats = handle.shutdown();
        assert_eq!(stats.fired, 1);
        assert!(stats.wakeups >= 1);
    }

    #[test]
    fn test_drop_joins_worker() {
        let sim = SimBackend::new();
        let wl = poll_list(&sim);
        let handle = spawn_worker(wl.clone()).unwrap();
        assert!(!handle.is_shutdown_requested());
        drop(handle);
        assert_eq!(Arc::strong_count(&wl), 1);
    }
}
