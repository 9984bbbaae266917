//! Power scheduler
//!
//! Modules behind the host are clocked on by the first submission that
//! targets them and clocked off once their last submitted threshold has
//! retired and they have been idle for the timeout. While any module is
//! busy the scheduler holds a host clock reference.
//!
//! # Lock order
//!
//! The scheduler lock is taken before any channel submit lock, so a
//! module cannot be powered off between a submission's shadow update
//! and the moment its commands reach the fetch unit.

mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use gfxhost_core::traits::{MonotonicClock, PowerControl};
use gfxhost_core::{kdebug, kwarn, reached, CounterId, ModuleId};

use crate::clock::HostClock;
use crate::semaphore::Semaphore;
use crate::syncpt::Counters;
use crate::waitlist::WaitList;

pub use worker::{spawn_acm, AcmHandle, AcmWorkerStats};

/// Power bookkeeping for one module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcmEntry {
    pub module: ModuleId,
    /// Counter and value of the module's newest submission
    pub counter: CounterId,
    pub value: u32,
    /// Submission time, `MonotonicClock` milliseconds
    pub stamp_ms: u32,
    pub enabled: bool,
}

pub(crate) struct AcmState {
    entries: Vec<AcmEntry>,
    /// Some module is clocked; a host clock reference is held
    busy: bool,
    suspended: bool,
    /// Modules the last suspend powered off
    parked: Vec<ModuleId>,
}

impl AcmState {
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    pub fn entry(&self, module: ModuleId) -> Option<&AcmEntry> {
        self.entries.iter().find(|e| e.module == module)
    }
}

/// Power transition counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerStats {
    pub module_on: u64,
    pub module_off: u64,
    pub busy_periods: u64,
}

#[derive(Default)]
struct StatCounters {
    module_on: AtomicU64,
    module_off: AtomicU64,
    busy_periods: AtomicU64,
}

pub struct PowerScheduler {
    state: Mutex<AcmState>,
    clock: Arc<HostClock>,
    power: Arc<dyn PowerControl>,
    counters: Arc<Counters>,
    waitlist: Arc<WaitList>,
    time: Arc<dyn MonotonicClock>,
    timeout: Duration,
    kick: Arc<dyn Semaphore>,
    stats: StatCounters,
}

impl PowerScheduler {
    /// `kick` is the semaphore the wait list posts when it empties.
    pub fn new(
        clock: Arc<HostClock>,
        power: Arc<dyn PowerControl>,
        counters: Arc<Counters>,
        waitlist: Arc<WaitList>,
        time: Arc<dyn MonotonicClock>,
        timeout: Duration,
        kick: Arc<dyn Semaphore>,
    ) -> Self {
        Self {
            state: Mutex::new(AcmState {
                entries: Vec::new(),
                busy: false,
                suspended: false,
                parked: Vec::new(),
            }),
            clock,
            power,
            counters,
            waitlist,
            time,
            timeout,
            kick,
            stats: StatCounters::default(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AcmState> {
        self.state.lock().unwrap()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wake the worker for an idle check.
    pub fn kick(&self) {
        self.kick.post();
    }

    /// Take the host clock for the first busy module. Returns true if
    /// the host just became busy and the worker should be kicked once
    /// the lock is released.
    pub(crate) fn host_is_busy(&self, st: &mut AcmState) -> bool {
        if st.busy {
            return false;
        }
        st.busy = true;
        self.clock.enable();
        self.stats.busy_periods.fetch_add(1, Ordering::Relaxed);
        kdebug!("host busy");
        true
    }

    fn host_is_not_busy(&self, st: &mut AcmState) {
        debug_assert!(st.busy);
        st.busy = false;
        self.clock.disable();
        kdebug!("host idle");
    }

    /// Record `module`'s newest work and power it on if needed.
    pub(crate) fn module_busy(&self, st: &mut AcmState, module: ModuleId, counter: CounterId, value: u32) {
        let now = self.time.now_ms();
        let idx = match st.entries.iter().position(|e| e.module == module) {
            Some(i) => i,
            None => {
                st.entries.push(AcmEntry {
                    module,
                    counter,
                    value,
                    stamp_ms: now,
                    enabled: false,
                });
                st.entries.len() - 1
            }
        };
        let entry = &mut st.entries[idx];
        entry.counter = counter;
        entry.value = value;
        entry.stamp_ms = now;

        if !entry.enabled {
            if !module.kind.is_externally_powered() {
                self.power.module_voltage(module, true);
                self.power.module_clock(module, true);
                self.stats.module_on.fetch_add(1, Ordering::Relaxed);
                kdebug!("{} power on", module);
            }
            entry.enabled = true;
        }
    }

    fn module_disable(&self, entry: &mut AcmEntry) {
        entry.enabled = false;
        if entry.module.kind.is_externally_powered() {
            return;
        }
        self.power.module_clock(entry.module, false);
        self.power.module_voltage(entry.module, false);
        self.stats.module_off.fetch_add(1, Ordering::Relaxed);
        kdebug!("{} power off", entry.module);
    }

    /// Whether `counter` reached `value`. With `force`, spin for up to
    /// the power timeout before giving up.
    fn retired(&self, counter: CounterId, value: u32, force: bool) -> bool {
        let deadline = Instant::now() + self.timeout;
        loop {
            if reached(self.counters.read(counter), value) {
                return true;
            }
            if !force || Instant::now() >= deadline {
                return false;
            }
            thread::yield_now();
        }
    }

    /// Power off every module that is idle past the timeout (or, with
    /// `force`, every module whose work retired) and give back the host
    /// clock once nothing is left on.
    ///
    /// Returns how long to sleep before the next check, `None` when no
    /// module is on.
    pub(crate) fn powerdown(&self, st: &mut AcmState, force: bool) -> Option<Duration> {
        let now = self.time.now_ms();
        let timeout_ms = self.timeout.as_millis().min(u32::MAX as u128) as u32;
        let mut sleep_ms: Option<u32> = None;
        let mut nap = |ms: u32| sleep_ms = Some(sleep_ms.map_or(ms, |s| s.min(ms)));

        if st.busy {
            let mut idle = true;
            {
                let _clk = self.clock.guard();
                for i in 0..st.entries.len() {
                    let entry = st.entries[i];
                    if !entry.enabled {
                        continue;
                    }
                    let elapsed = now.wrapping_sub(entry.stamp_ms);
                    if elapsed < timeout_ms && !force {
                        idle = false;
                        nap(timeout_ms - elapsed);
                        continue;
                    }
                    if !self.retired(entry.counter, entry.value, force) {
                        if force {
                            kwarn!("{} still busy at forced power-down", entry.module);
                        }
                        idle = false;
                        nap(timeout_ms);
                        continue;
                    }
                    self.module_disable(&mut st.entries[i]);
                }
            }
            if idle {
                self.host_is_not_busy(st);
            }
        }

        self.waitlist.release_idle_clock();
        sleep_ms.map(|ms| Duration::from_millis(ms as u64))
    }

    /// Force every retired module off ahead of deep sleep, remembering
    /// which ones were on.
    pub(crate) fn park(&self, st: &mut AcmState) {
        let was_on: Vec<ModuleId> = st
            .entries
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.module)
            .collect();
        self.powerdown(st, true);
        let parked = was_on
            .into_iter()
            .filter(|m| st.entry(*m).is_some_and(|e| !e.enabled))
            .collect();
        st.parked = parked;
    }

    /// Power back on the modules `park` turned off. Each gets a fresh
    /// idle period. Returns true if the worker should be kicked once the
    /// lock is released.
    pub(crate) fn unpark(&self, st: &mut AcmState) -> bool {
        let parked = std::mem::take(&mut st.parked);
        if parked.is_empty() {
            return false;
        }
        let kick = self.host_is_busy(st);
        for module in parked {
            if let Some(e) = st.entry(module).copied() {
                self.module_busy(st, module, e.counter, e.value);
            }
        }
        kick
    }

    pub fn entries(&self) -> Vec<AcmEntry> {
        self.lock().entries.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    pub fn stats(&self) -> PowerStats {
        PowerStats {
            module_on: self.stats.module_on.load(Ordering::Relaxed),
            module_off: self.stats.module_off.load(Ordering::Relaxed),
            busy_periods: self.stats.busy_periods.load(Ordering::Relaxed),
        }
    }
}
