//! Power scheduler worker
//!
//! Sleeps until kicked (a submission made the host busy, or the wait
//! list emptied) or until the nearest module timeout, then runs an idle
//! check. On exit every module still on is forced down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use gfxhost_core::error::{HostError, HostResult};
use gfxhost_core::ktrace;

use super::PowerScheduler;

const THREAD_NAME: &str = "gfxhost-acm";

/// Statistics from worker execution
#[derive(Debug, Clone, Default)]
pub struct AcmWorkerStats {
    /// Wake-ups caused by a kick
    pub kicks: u64,
    /// Wake-ups caused by a module timeout
    pub timeouts: u64,
}

/// Handle to a running power scheduler worker
pub struct AcmHandle {
    handle: Option<JoinHandle<AcmWorkerStats>>,
    shutdown: Arc<AtomicBool>,
    acm: Arc<PowerScheduler>,
}

impl AcmHandle {
    /// Stop the worker; it powers everything down before exiting.
    pub fn shutdown(mut self) -> AcmWorkerStats {
        self.stop()
    }

    fn stop(&mut self) -> AcmWorkerStats {
        self.shutdown.store(true, Ordering::Release);
        self.acm.kick();
        match self.handle.take() {
            Some(h) => h.join().unwrap_or_default(),
            None => AcmWorkerStats::default(),
        }
    }
}

impl Drop for AcmHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

/// Spawn the power scheduler worker
pub fn spawn_acm(acm: Arc<PowerScheduler>) -> HostResult<AcmHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let worker = Arc::clone(&acm);
    let flag = Arc::clone(&shutdown);

    let handle = thread::Builder::new()
        .name(THREAD_NAME.into())
        .spawn(move || acm_loop(worker, flag))
        .map_err(|e| HostError::Spawn(e.to_string()))?;

    Ok(AcmHandle {
        handle: Some(handle),
        shutdown,
        acm,
    })
}

fn acm_loop(acm: Arc<PowerScheduler>, shutdown: Arc<AtomicBool>) -> AcmWorkerStats {
    let mut stats = AcmWorkerStats::default();
    let mut sleep = None;

    loop {
        let kicked = acm.kick.wait(sleep);
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let mut st = acm.lock();
        // collapse kicks that arrived while we were waiting
        while acm.kick.try_wait() {}

        if kicked {
            stats.kicks += 1;
        } else {
            stats.timeouts += 1;
        }
        ktrace!("power worker wake ({})", if kicked { "kick" } else { "timeout" });

        sleep = acm.powerdown(&mut st, false);
    }

    let mut st = acm.lock();
    acm.powerdown(&mut st, true);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acm::tests::scheduler;
    use gfxhost_core::{CounterId, ModuleId, ModuleKind};
    use gfxhost_hw::SimBackend;
    use std::time::{Duration, Instant};

    const MPE: ModuleId = ModuleId::new(ModuleKind::Mpe, 0);

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_kick_powers_idle_module_down() {
        let sim = SimBackend::new();
        let (clock, acm) = scheduler(&sim, 200);
        let handle = spawn_acm(acm.clone()).unwrap();

        let sp = CounterId::new(11);
        {
            let mut st = acm.lock();
            acm.host_is_busy(&mut st);
            acm.module_busy(&mut st, MPE, sp, 1);
        }
        sim.host.advance_counter(sp, 1);
        sim.clock.advance(200);
        acm.kick();

        assert!(wait_for(|| !sim.power.clock_on(MPE)));
        assert!(wait_for(|| clock.refs() == 0));
        let stats = handle.shutdown();
        assert!(stats.kicks >= 1);
    }

    #[test]
    fn test_shutdown_forces_power_down() {
        let sim = SimBackend::new();
        let (_clock, acm) = scheduler(&sim, 200);
        let handle = spawn_acm(acm.clone()).unwrap();
        {
            let mut st = acm.lock();
            acm.host_is_busy(&mut st);
            acm.module_busy(&mut st, MPE, CounterId::new(11), 0);
        }
        handle.shutdown();
        assert!(!sim.power.clock_on(MPE));
        assert!(!acm.is_busy());
    }
}
