//! Wait-list scheduler
//!
//! Every counter has a list of pending thresholds sorted ascending.
//! The lowest threshold of a non-empty list is programmed into the
//! counter's interrupt threshold register.
//!
//! # Flow
//!
//! 1. `schedule` inserts a node and re-arms the counter if the node
//!    became the new head.
//! 2. The threshold interrupt calls `service_thresholds`, which
//!    disables every counter that fired, folds them into the `passed`
//!    mask and wakes the worker. Repeated interrupts before the worker
//!    runs coalesce in the mask.
//! 3. The worker pops every node the hardware has reached, re-arms the
//!    remaining heads, then runs queue drains before signalling
//!    semaphores.
//!
//! In poll mode no interrupt is armed; the worker wakes on a short
//! period and checks every counter with pending nodes.
//!
//! While nodes are pending the wait list holds a host clock reference
//! so the threshold interrupt can be taken. The power scheduler drops
//! it through `release_idle_clock` once the lists are empty.

mod arena;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::ArrayQueue;

use gfxhost_core::constants::NB_COUNTERS;
use gfxhost_core::error::{HostError, HostResult};
use gfxhost_core::traits::Mmio;
use gfxhost_core::{kdebug, ktrace, reached, CounterId};

use crate::channel::Channel;
use crate::clock::HostClock;
use crate::config::defaults;
use crate::intr::ThresholdIrq;
use crate::semaphore::{new_semaphore, Semaphore};
use crate::syncpt::Counters;

use arena::{NodeArena, NIL};
pub use worker::{spawn_worker, WaitListHandle, WorkerStats};

/// What to do once a threshold is reached
pub enum WaitAction {
    /// Post the semaphore
    Signal(Arc<dyn Semaphore>),
    /// Retire the channel's completed entries
    Drain(Arc<Channel>),
}

/// Messages from the interrupt side to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerEvent {
    Thresholds,
    Shutdown,
}

const EVENT_QUEUE_DEPTH: usize = 8;

struct Lists {
    arena: NodeArena<WaitAction>,
    heads: [u32; NB_COUNTERS],
}

impl Lists {
    /// Unlink every node of `slot`, collecting their actions. Returns
    /// the number of nodes removed.
    fn take_all(
        &mut self,
        slot: usize,
        drains: &mut Vec<Arc<Channel>>,
        signals: &mut Vec<Arc<dyn Semaphore>>,
    ) -> u32 {
        let mut head = self.heads[slot];
        let mut taken = 0;
        while head != NIL {
            let next = self.arena.get(head).next;
            match self.arena.release(head) {
                Some(WaitAction::Drain(ch)) => {
                    if !drains.iter().any(|c| Arc::ptr_eq(c, &ch)) {
                        drains.push(ch);
                    }
                }
                Some(WaitAction::Signal(sem)) => signals.push(sem),
                None => {}
            }
            head = next;
            taken += 1;
        }
        self.heads[slot] = NIL;
        taken
    }
}

struct IsrState {
    /// Nodes pending across all counters
    count: u32,
    holds_clock: bool,
    irq: ThresholdIrq,
}

#[derive(Default)]
struct Stats {
    scheduled: AtomicU64,
    fired: AtomicU64,
    interrupts: AtomicU64,
}

/// Snapshot of wait-list activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitListStats {
    pub scheduled: u64,
    pub fired: u64,
    pub interrupts: u64,
    pub pending: u32,
}

pub struct WaitList {
    clock: Arc<HostClock>,
    counters: Arc<Counters>,
    poll_mode: bool,
    lists: Mutex<Lists>,
    isr: Mutex<IsrState>,
    passed: AtomicU32,
    events: ArrayQueue<WorkerEvent>,
    wake: Arc<dyn Semaphore>,
    /// Posted whenever the last pending node fires
    idle: Arc<dyn Semaphore>,
    closed: AtomicBool,
    stats: Stats,
}

impl WaitList {
    pub fn new(
        regs: Arc<dyn Mmio>,
        clock: Arc<HostClock>,
        counters: Arc<Counters>,
        idle: Arc<dyn Semaphore>,
        poll_mode: bool,
    ) -> Self {
        Self {
            clock,
            counters,
            poll_mode,
            lists: Mutex::new(Lists {
                arena: NodeArena::new(defaults::WAIT_NODES_PER_PAGE, defaults::WAIT_LIST_MAX_PAGES),
                heads: [NIL; NB_COUNTERS],
            }),
            isr: Mutex::new(IsrState {
                count: 0,
                holds_clock: false,
                irq: ThresholdIrq::new(regs),
            }),
            passed: AtomicU32::new(0),
            events: ArrayQueue::new(EVENT_QUEUE_DEPTH),
            wake: new_semaphore(),
            idle,
            closed: AtomicBool::new(false),
            stats: Stats::default(),
        }
    }

    /// Bound node storage to `max_pages` pages of `per_page` nodes.
    pub fn with_capacity(self, per_page: usize, max_pages: usize) -> Self {
        self.lists.lock().unwrap().arena = NodeArena::new(per_page, max_pages);
        self
    }

    pub fn is_poll_mode(&self) -> bool {
        self.poll_mode
    }

    /// Run `action` once counter `id` reaches `thresh`.
    ///
    /// Equal thresholds fire in scheduling order. The caller checks
    /// whether the threshold is already reached; a node scheduled for a
    /// reached threshold fires on the next interrupt or poll.
    pub fn schedule(&self, id: CounterId, thresh: u32, action: WaitAction) -> HostResult<()> {
        Counters::check(id)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::ShuttingDown);
        }

        let mut lists = self.lists.lock().unwrap();
        let node = lists.arena.alloc(thresh, action)?;

        let slot = id.as_usize();
        let mut prev = NIL;
        let mut cur = lists.heads[slot];
        while cur != NIL && reached(thresh, lists.arena.get(cur).thresh) {
            prev = cur;
            cur = lists.arena.get(cur).next;
        }
        lists.arena.get_mut(node).next = cur;
        if prev == NIL {
            lists.heads[slot] = node;
        } else {
            lists.arena.get_mut(prev).next = node;
        }

        let mut isr = self.isr.lock().unwrap();
        isr.count += 1;
        if !isr.holds_clock {
            self.clock.enable();
            isr.holds_clock = true;
        }
        if prev == NIL && !self.poll_mode {
            let _clk = self.clock.guard();
            if isr.irq.is_enabled(id) {
                isr.irq.set_threshold(id, thresh);
            } else {
                isr.irq.enable(id, thresh);
            }
        }
        drop(isr);
        drop(lists);

        self.stats.scheduled.fetch_add(1, Ordering::Relaxed);
        if self.poll_mode {
            self.wake.post();
        }
        Ok(())
    }

    /// Threshold interrupt handler. Never blocks on anything but the
    /// interrupt-side lock.
    pub fn service_thresholds(&self) {
        let mut isr = self.isr.lock().unwrap();
        if isr.count == 0 || !isr.holds_clock {
            return;
        }
        let status = isr.irq.status();
        if status == 0 {
            return;
        }
        isr.irq.disable_mult(status);
        isr.irq.clear_status(status);
        drop(isr);

        self.stats.interrupts.fetch_add(1, Ordering::Relaxed);
        if self.passed.fetch_or(status, Ordering::AcqRel) == 0 {
            let _ = self.events.push(WorkerEvent::Thresholds);
            self.wake.post();
        }
    }

    /// Fire every node whose threshold the hardware reached, on the
    /// counters in `mask`. Returns the number of nodes fired.
    fn process(&self, mut mask: u32) -> usize {
        let mut drains: Vec<Arc<Channel>> = Vec::new();
        let mut signals: Vec<Arc<dyn Semaphore>> = Vec::new();
        let mut rearm = 0u32;
        let mut thresh = [0u32; NB_COUNTERS];
        let mut fired = 0u32;
        let went_idle;

        {
            let mut lists = self.lists.lock().unwrap();
            let _clk = self.clock.guard();
            while mask != 0 {
                let bit = mask.trailing_zeros();
                mask &= mask - 1;
                let slot = bit as usize;
                let mut head = lists.heads[slot];
                if head == NIL {
                    continue;
                }

                let hw = self.counters.read(CounterId::new(bit));
                while head != NIL && reached(hw, lists.arena.get(head).thresh) {
                    let next = lists.arena.get(head).next;
                    match lists.arena.release(head) {
                        Some(WaitAction::Drain(ch)) => {
                            if !drains.iter().any(|c| Arc::ptr_eq(c, &ch)) {
                                drains.push(ch);
                            }
                        }
                        Some(WaitAction::Signal(sem)) => signals.push(sem),
                        None => {}
                    }
                    head = next;
                    fired += 1;
                }
                lists.heads[slot] = head;
                if head != NIL {
                    rearm |= 1 << bit;
                    thresh[slot] = lists.arena.get(head).thresh;
                }
            }

            let mut isr = self.isr.lock().unwrap();
            debug_assert!(isr.count >= fired, "wait-list count underflow");
            isr.count = isr.count.saturating_sub(fired);
            if !self.poll_mode {
                isr.irq.enable_mult(rearm, &thresh);
            }
            went_idle = fired > 0 && isr.count == 0;
        }

        if went_idle {
            self.idle.post();
        }
        for ch in drains {
            ch.drain();
        }
        for sem in signals {
            sem.post();
        }

        if fired > 0 {
            ktrace!("wait list fired {} nodes", fired);
            self.stats.fired.fetch_add(fired as u64, Ordering::Relaxed);
        }
        fired as usize
    }

    /// Worker step: consume coalesced interrupt state.
    fn process_passed(&self) -> usize {
        let mask = if self.poll_mode {
            self.pending_mask()
        } else {
            self.passed.swap(0, Ordering::AcqRel)
        };
        if mask == 0 {
            return 0;
        }
        self.process(mask)
    }

    /// Counters with at least one pending node
    pub fn pending_mask(&self) -> u32 {
        let lists = self.lists.lock().unwrap();
        lists
            .heads
            .iter()
            .enumerate()
            .filter(|(_, &h)| h != NIL)
            .fold(0, |m, (i, _)| m | (1 << i))
    }

    pub fn pending(&self) -> u32 {
        self.isr.lock().unwrap().count
    }

    pub fn is_armed(&self, id: CounterId) -> bool {
        self.isr.lock().unwrap().irq.is_enabled(id)
    }

    /// Drop the clock reference held for pending nodes, if the lists
    /// are empty. Returns true if a reference was released.
    pub fn release_idle_clock(&self) -> bool {
        let mut isr = self.isr.lock().unwrap();
        if isr.count != 0 || !isr.holds_clock {
            return false;
        }
        isr.holds_clock = false;
        drop(isr);
        self.clock.disable();
        true
    }

    /// Disarm a counter about to be handed to a new owner.
    ///
    /// Waits the previous owner left behind (a `fence_wait` that timed
    /// out) are fired now so they can never match the new owner's
    /// values. Returns the number of nodes purged.
    pub fn reset_counter(&self, id: CounterId) -> usize {
        let mut drains: Vec<Arc<Channel>> = Vec::new();
        let mut signals: Vec<Arc<dyn Semaphore>> = Vec::new();
        let purged;
        let went_idle;
        {
            let mut lists = self.lists.lock().unwrap();
            purged = lists.take_all(id.as_usize(), &mut drains, &mut signals);

            let mut isr = self.isr.lock().unwrap();
            isr.count = isr.count.saturating_sub(purged);
            if isr.irq.is_enabled(id) {
                let _clk = self.clock.guard();
                isr.irq.disable(id);
            }
            went_idle = purged > 0 && isr.count == 0;
        }
        self.passed.fetch_and(!(1 << id.as_u32()), Ordering::AcqRel);

        if went_idle {
            self.idle.post();
        }
        for ch in drains {
            ch.drain();
        }
        for sem in signals {
            sem.post();
        }
        if purged > 0 {
            kdebug!("{} reset dropped {} stale waits", id, purged);
            self.stats.fired.fetch_add(purged as u64, Ordering::Relaxed);
        }
        purged as usize
    }

    /// Disarm every counter and clear latched status. Only valid while
    /// nothing is pending.
    pub fn reset_interrupts(&self) {
        let mut isr = self.isr.lock().unwrap();
        debug_assert!(isr.count == 0, "interrupt reset with pending waits");
        let _clk = self.clock.guard();
        isr.irq.reset();
    }

    /// Reprogram the interrupt mask after the host lost its registers.
    pub fn restore(&self) {
        let lists = self.lists.lock().unwrap();
        let isr = self.isr.lock().unwrap();
        let _clk = self.clock.guard();
        for (slot, &head) in lists.heads.iter().enumerate() {
            let id = CounterId::new(slot as u32);
            if head != NIL && isr.irq.is_enabled(id) {
                isr.irq.set_threshold(id, lists.arena.get(head).thresh);
            }
        }
        isr.irq.restore();
    }

    /// Fire whatever has been reached, then force out every remaining
    /// node and disarm all counters. Used once the worker has stopped.
    pub fn flush_all(&self) -> usize {
        let done = self.process(u32::MAX);

        let mut drains: Vec<Arc<Channel>> = Vec::new();
        let mut signals: Vec<Arc<dyn Semaphore>> = Vec::new();
        let mut forced = 0u32;
        {
            let mut lists = self.lists.lock().unwrap();
            for slot in 0..NB_COUNTERS {
                forced += lists.take_all(slot, &mut drains, &mut signals);
            }

            let mut isr = self.isr.lock().unwrap();
            isr.count = isr.count.saturating_sub(forced);
            let _clk = self.clock.guard();
            isr.irq.reset();
        }
        for ch in drains {
            ch.drain();
        }
        for sem in signals {
            sem.post();
        }
        self.release_idle_clock();
        done + forced as usize
    }

    pub(crate) fn post_event(&self, event: WorkerEvent) {
        let _ = self.events.push(event);
        self.wake.post();
    }

    /// Refuse further scheduling.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WaitListStats {
        WaitListStats {
            scheduled: self.stats.scheduled.load(Ordering::Relaxed),
            fired: self.stats.fired.load(Ordering::Relaxed),
            interrupts: self.stats.interrupts.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use gfxhost_core::counter::reserved;
    use gfxhost_core::traits::{IrqController, IrqLine};
    use gfxhost_hw::SimBackend;

    const SP: CounterId = CounterId::new(9);

    struct Fixture {
        sim: SimBackend,
        clock: Arc<HostClock>,
        idle: Arc<dyn Semaphore>,
        wl: Arc<WaitList>,
        worker: Option<WaitListHandle>,
    }

    impl Fixture {
        fn new(poll_mode: bool) -> Self {
            let sim = SimBackend::new();
            let clock = Arc::new(HostClock::new(sim.power.clone()));
            let counters = Arc::new(Counters::new(
                sim.host.clone(),
                reserved::MASK,
                reserved::CLIENT_MANAGED_MASK,
            ));
            let idle = new_semaphore();
            let wl = Arc::new(WaitList::new(
                sim.host.clone(),
                clock.clone(),
                counters,
                idle.clone(),
                poll_mode,
            ));
            let isr = wl.clone();
            sim.host
                .register(IrqLine::Syncpt, Arc::new(move || isr.service_thresholds()))
                .unwrap();
            let worker = Some(spawn_worker(wl.clone()).unwrap());
            Self { sim, clock, idle, wl, worker }
        }

        fn signal(&self, thresh: u32) -> Arc<dyn Semaphore> {
            let sem = new_semaphore();
            self.wl
                .schedule(SP, thresh, WaitAction::Signal(sem.clone()))
                .unwrap();
            sem
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.sim.host.unregister(IrqLine::Syncpt);
            if let Some(w) = self.worker.take() {
                w.shutdown();
            }
        }
    }

    const LONG: Duration = Duration::from_secs(2);
    const SHORT: Duration = Duration::from_millis(30);

    #[test]
    fn test_signal_fires_at_threshold() {
        let fx = Fixture::new(false);
        let sem = fx.signal(2);
        assert!(fx.wl.is_armed(SP));
        assert_eq!(fx.sim.host.threshold(SP), 2);

        fx.sim.host.advance_counter(SP, 1);
        assert!(!sem.wait(Some(SHORT)));

        fx.sim.host.advance_counter(SP, 1);
        assert!(sem.wait(Some(LONG)));
        assert_eq!(fx.wl.pending(), 0);
        assert!(!fx.wl.is_armed(SP));
    }

    #[test]
    fn test_nodes_fire_in_threshold_order() {
        let fx = Fixture::new(false);
        let third = fx.signal(3);
        let first = fx.signal(1);
        let second = fx.signal(2);
        assert_eq!(fx.sim.host.threshold(SP), 1);

        fx.sim.host.advance_counter(SP, 1);
        assert!(first.wait(Some(LONG)));
        assert!(!second.try_wait());
        assert!(!third.try_wait());

        // remaining head is re-armed
        for _ in 0..200 {
            if fx.wl.is_armed(SP) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(fx.sim.host.threshold(SP), 2);

        fx.sim.host.advance_counter(SP, 2);
        assert!(second.wait(Some(LONG)));
        assert!(third.wait(Some(LONG)));
    }

    #[test]
    fn test_lower_threshold_moves_armed_value() {
        let fx = Fixture::new(false);
        let _late = fx.signal(5);
        assert_eq!(fx.sim.host.threshold(SP), 5);
        let _early = fx.signal(2);
        assert_eq!(fx.sim.host.threshold(SP), 2);
        let _later = fx.signal(7);
        assert_eq!(fx.sim.host.threshold(SP), 2);
        assert_eq!(fx.wl.pending(), 3);
    }

    #[test]
    fn test_threshold_comparison_wraps() {
        let fx = Fixture::new(false);
        {
            let _clk = fx.clock.guard();
            fx.wl.counters.write(SP, u32::MAX - 1);
        }
        let sem = fx.signal(1);
        assert!(!sem.wait(Some(SHORT)));
        fx.sim.host.advance_counter(SP, 3);
        assert!(sem.wait(Some(LONG)));
    }

    #[test]
    fn test_clock_held_until_idle_release() {
        let fx = Fixture::new(false);
        assert_eq!(fx.clock.refs(), 0);
        let sem = fx.signal(1);
        assert_eq!(fx.clock.refs(), 1);
        assert!(!fx.wl.release_idle_clock());

        fx.sim.host.advance_counter(SP, 1);
        assert!(sem.wait(Some(LONG)));
        assert!(fx.idle.wait(Some(LONG)));
        assert!(fx.wl.release_idle_clock());
        assert_eq!(fx.clock.refs(), 0);
        assert_eq!(fx.sim.host.clock_violations(), 0);
    }

    #[test]
    fn test_poll_mode_never_arms() {
        let fx = Fixture::new(true);
        let sem = fx.signal(2);
        assert!(!fx.wl.is_armed(SP));
        fx.sim.host.advance_counter(SP, 2);
        assert!(sem.wait(Some(LONG)));
        assert_eq!(fx.wl.stats().interrupts, 0);
    }

    #[test]
    fn test_node_capacity_is_bounded() {
        let sim = SimBackend::new();
        let clock = Arc::new(HostClock::new(sim.power.clone()));
        let counters = Arc::new(Counters::new(sim.host.clone(), reserved::MASK, 0));
        let wl = WaitList::new(sim.host.clone(), clock, counters, new_semaphore(), true)
            .with_capacity(2, 1);
        for t in 1..=2 {
            wl.schedule(SP, t, WaitAction::Signal(new_semaphore())).unwrap();
        }
        let err = wl.schedule(SP, 3, WaitAction::Signal(new_semaphore()));
        assert!(matches!(
            err,
            Err(HostError::Exhausted(gfxhost_core::error::ResourceError::WaitListFull))
        ));
        assert_eq!(wl.flush_all(), 2);
        assert_eq!(wl.pending(), 0);
    }

    #[test]
    fn test_reset_counter_purges_stale_waits() {
        let fx = Fixture::new(false);
        let other = CounterId::new(10);
        let stale = fx.signal(5);
        let kept = new_semaphore();
        fx.wl.schedule(other, 1, WaitAction::Signal(kept.clone())).unwrap();
        assert_eq!(fx.wl.pending(), 2);

        assert_eq!(fx.wl.reset_counter(SP), 1);
        assert!(stale.try_wait());
        assert!(!fx.wl.is_armed(SP));
        assert_eq!(fx.wl.pending(), 1);
        assert!(fx.wl.is_armed(other));

        // the counter is usable again from zero
        let fresh = fx.signal(1);
        assert_eq!(fx.sim.host.threshold(SP), 1);
        fx.sim.host.advance_counter(SP, 1);
        assert!(fresh.wait(Some(LONG)));
        assert!(!stale.try_wait());

        fx.sim.host.advance_counter(other, 1);
        assert!(kept.wait(Some(LONG)));
        assert!(fx.idle.wait(Some(LONG)));
    }

    #[test]
    fn test_reset_of_last_counter_reports_idle() {
        let fx = Fixture::new(false);
        let _stale = fx.signal(3);
        assert_eq!(fx.wl.reset_counter(SP), 1);
        assert_eq!(fx.wl.pending(), 0);
        assert!(fx.idle.wait(Some(LONG)));
        assert!(fx.wl.release_idle_clock());
        assert_eq!(fx.clock.refs(), 0);
        assert_eq!(fx.wl.reset_counter(SP), 0);
    }

    #[test]
    fn test_flush_all_signals_everything() {
        let mut fx = Fixture::new(false);
        fx.worker.take().unwrap().shutdown();
        let a = fx.signal(10);
        let b = fx.signal(20);
        assert_eq!(fx.wl.flush_all(), 2);
        assert!(a.try_wait());
        assert!(b.try_wait());
        assert!(!fx.wl.is_armed(SP));
        assert_eq!(fx.clock.refs(), 0);
    }
}
