//! Command channels
//!
//! A channel owns a push buffer the fetch unit walks, the completion
//! queue recording what each submission holds until its counter
//! threshold retires, and the pin set used while a submission is being
//! built.
//!
//! # Locking
//!
//! - `submit` serializes submissions, including any wait for space.
//! - `queue` guards the push buffer, completion queue and retire list.
//!   Waiters for space sleep on `space` with this lock released.
//!
//! `submit` is always taken before `queue`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use gfxhost_core::error::HostResult;
use gfxhost_core::opcode::Descriptor;
use gfxhost_core::regs::{self, channel as chreg, dmactrl};
use gfxhost_core::traits::{MemoryManager, Mmio};
use gfxhost_core::{kinfo, kwarn, reached, ChannelId, CounterId, MemHandle};

use crate::clock::HostClock;
use crate::context::{Contexts, RetireAction};
use crate::pinset::{PinGuard, PinSet};
use crate::pushbuf::PushBuffer;
use crate::submit::{Relocation, Segment};
use crate::syncpt::Counters;
use crate::syncq::SyncQueue;

/// What a blocked caller is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// Every queued entry has retired
    Empty,
    /// Room for another completion entry
    SyncQueue,
    /// A free push-buffer slot
    PushBuffer,
}

impl QueueEvent {
    const fn bit(self) -> u32 {
        match self {
            QueueEvent::Empty => 1 << 0,
            QueueEvent::SyncQueue => 1 << 1,
            QueueEvent::PushBuffer => 1 << 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Retire {
    counter: CounterId,
    value: u32,
    action: RetireAction,
}

pub(crate) struct QueueState {
    pb: Option<PushBuffer>,
    syncq: SyncQueue,
    retire: VecDeque<Retire>,
    /// Events some waiter is blocked on
    waiting: u32,
}

impl QueueState {
    fn status(&self, event: QueueEvent) -> u32 {
        match event {
            QueueEvent::Empty => self.syncq.is_empty() as u32,
            QueueEvent::SyncQueue => self.syncq.free_space(),
            QueueEvent::PushBuffer => self.pb.as_ref().map_or(0, |pb| pb.space()),
        }
    }
}

pub(crate) struct SubmitState {
    pinset: PinSet,
}

/// Pinned and patched, ready to be written to the push buffer
pub(crate) struct Prepared {
    pins: PinGuard,
    gathers: Vec<Descriptor>,
}

/// Per-channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub submits: u64,
    pub gathers: u64,
    pub drained: u64,
    /// Times a submitter or flusher had to block
    pub waits: u64,
}

#[derive(Default)]
struct StatCounters {
    submits: AtomicU64,
    gathers: AtomicU64,
    drained: AtomicU64,
    waits: AtomicU64,
}

pub struct Channel {
    id: ChannelId,
    regs: Arc<dyn Mmio>,
    mem: Arc<dyn MemoryManager>,
    clock: Arc<HostClock>,
    counters: Arc<Counters>,
    contexts: Arc<Contexts>,
    pushbuffer_size: u32,
    refs: Mutex<u32>,
    submit: Mutex<SubmitState>,
    queue: Mutex<QueueState>,
    space: Condvar,
    stats: StatCounters,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        regs: Arc<dyn Mmio>,
        mem: Arc<dyn MemoryManager>,
        clock: Arc<HostClock>,
        counters: Arc<Counters>,
        contexts: Arc<Contexts>,
        pushbuffer_size: u32,
        sync_queue_words: u32,
    ) -> Self {
        Self {
            id,
            regs,
            mem,
            clock,
            counters,
            contexts,
            pushbuffer_size,
            refs: Mutex::new(0),
            submit: Mutex::new(SubmitState { pinset: PinSet::new() }),
            queue: Mutex::new(QueueState {
                pb: None,
                syncq: SyncQueue::new(sync_queue_words),
                retire: VecDeque::new(),
                waiting: 0,
            }),
            space: Condvar::new(),
            stats: StatCounters::default(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn reg(&self, reg: u32) -> u32 {
        regs::channel_reg(self.id.as_u32(), reg)
    }

    pub fn is_open(&self) -> bool {
        *self.refs.lock().unwrap() > 0
    }

    pub fn open_count(&self) -> u32 {
        *self.refs.lock().unwrap()
    }

    // --- open / close ----------------------------------------------------

    /// Take a reference; the first one brings the channel up.
    pub(crate) fn acquire(&self) -> HostResult<()> {
        let mut refs = self.refs.lock().unwrap();
        if *refs == 0 {
            let pb = PushBuffer::alloc(Arc::clone(&self.mem), self.pushbuffer_size)?;
            let mut q = self.queue.lock().unwrap();
            q.pb = Some(pb);
            let _clk = self.clock.guard();
            self.program_dma();
            self.reset_locked(&mut q);
            kinfo!("{} open", self.id);
        }
        *refs += 1;
        Ok(())
    }

    /// Drop a reference; the last one flushes and tears down.
    pub(crate) fn release(&self) {
        let mut refs = self.refs.lock().unwrap();
        debug_assert!(*refs > 0, "{} closed more often than opened", self.id);
        if *refs == 0 {
            return;
        }
        *refs -= 1;
        if *refs > 0 {
            return;
        }

        let mut sub = self.submit.lock().unwrap();
        self.flush();
        sub.pinset.release();

        let mut q = self.queue.lock().unwrap();
        {
            let _clk = self.clock.guard();
            self.regs.write32(self.reg(chreg::DMACTRL), dmactrl::DMASTOP);
        }
        q.pb = None;
        kinfo!("{} closed", self.id);
    }

    /// Point the fetch unit at the whole address space; the push buffer
    /// bounds itself with its RESTART slot. Caller holds the clock.
    fn program_dma(&self) {
        self.regs.write32(self.reg(chreg::DMACTRL), dmactrl::DMASTOP);
        self.regs.write32(self.reg(chreg::DMASTART), 0);
        self.regs.write32(self.reg(chreg::DMAEND), u32::MAX);
    }

    /// Rewind the push buffer and fetch pointers. Caller holds the
    /// clock and has emptied the queue.
    fn reset_locked(&self, q: &mut QueueState) {
        let Some(pb) = q.pb.as_mut() else { return };
        self.regs.write32(self.reg(chreg::DMACTRL), dmactrl::DMASTOP);
        pb.reset();
        q.syncq.reset();
        self.regs.write32(self.reg(chreg::DMAPUT), pb.phys());
        self.regs.write32(
            self.reg(chreg::DMACTRL),
            dmactrl::DMASTOP | dmactrl::DMAGETRST | dmactrl::DMAINITGET,
        );
        self.regs.write32(self.reg(chreg::DMACTRL), 0);
    }

    // --- waiting ---------------------------------------------------------

    /// Block until `event` has a non-zero status. Returns the status,
    /// or 0 if `timeout` expired first.
    fn wait_event<'a>(
        &self,
        mut q: MutexGuard<'a, QueueState>,
        event: QueueEvent,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, QueueState>, u32) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut blocked = false;
        loop {
            let status = q.status(event);
            if status > 0 {
                return (q, status);
            }
            if !blocked {
                self.stats.waits.fetch_add(1, Ordering::Relaxed);
                blocked = true;
            }
            q.waiting |= event.bit();
            q = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return (q, 0);
                    }
                    self.space.wait_timeout(q, d - now).unwrap().0
                }
                None => self.space.wait(q).unwrap(),
            };
        }
    }

    /// Wait until every queued entry has retired, then rewind.
    pub fn flush(&self) {
        let q = self.queue.lock().unwrap();
        let (mut q, _) = self.wait_event(q, QueueEvent::Empty, None);
        let _clk = self.clock.guard();
        self.reset_locked(&mut q);
    }

    /// Wait for the queue to empty; false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let q = self.queue.lock().unwrap();
        self.wait_event(q, QueueEvent::Empty, Some(timeout)).1 != 0
    }

    pub fn is_idle(&self) -> bool {
        self.queue.lock().unwrap().syncq.is_empty()
    }

    /// Push-buffer slots written and not yet retired
    pub fn in_flight(&self) -> u32 {
        let q = self.queue.lock().unwrap();
        q.pb.as_ref().map_or(0, |pb| pb.in_flight())
    }

    // --- submission ------------------------------------------------------

    pub(crate) fn lock_submit(&self) -> MutexGuard<'_, SubmitState> {
        self.submit.lock().unwrap()
    }

    /// Pin everything the submission references and patch relocations.
    /// Nothing reaches the hardware; on error every pin is released.
    pub(crate) fn prepare(
        &self,
        sub: &mut SubmitState,
        segments: &[Segment],
        relocs: &[Relocation],
    ) -> HostResult<Prepared> {
        let set = &mut sub.pinset;
        set.process_relocs(relocs);
        set.add_cmdbufs(segments);
        let pins = set.pin_all(&self.mem)?;

        for (i, r) in relocs.iter().enumerate() {
            self.mem
                .write32(r.cmdbuf, r.cmdbuf_offset, r.patched(set.reloc_phys(i)));
        }
        let gathers = segments
            .iter()
            .enumerate()
            .map(|(i, s)| Descriptor::gather(set.cmdbuf_phys(i) + s.offset, s.words))
            .collect();
        Ok(Prepared { pins, gathers })
    }

    /// Write the gathers and queue their cleanup. Blocks for space;
    /// cannot fail once `prepare` succeeded.
    pub(crate) fn commit(
        &self,
        _sub: &mut SubmitState,
        prepared: Prepared,
        counter: CounterId,
        value: u32,
        null_kickoff: bool,
        retire: &[(CounterId, u32, RetireAction)],
    ) {
        let Prepared { pins, gathers } = prepared;
        let mut q = self.queue.lock().unwrap();

        for d in &gathers {
            q = self.wait_event(q, QueueEvent::PushBuffer, None).0;
            let d = if null_kickoff { Descriptor::noop() } else { *d };
            self.kickoff(&mut q, d);
        }

        let handles: Vec<u32> = pins.into_handles().iter().map(|h| h.as_u32()).collect();
        let mut rest = &handles[..];
        let mut num_gathers = gathers.len() as u32;
        while !rest.is_empty() {
            let (guard, room) = self.wait_event(q, QueueEvent::SyncQueue, None);
            q = guard;
            let n = (room as usize).min(rest.len());
            q.syncq.add(counter, value, num_gathers, &rest[..n]);
            num_gathers = 0;
            rest = &rest[n..];
        }

        for &(counter, value, action) in retire {
            q.retire.push_back(Retire { counter, value, action });
        }

        self.stats.submits.fetch_add(1, Ordering::Relaxed);
        self.stats
            .gathers
            .fetch_add(gathers.len() as u64, Ordering::Relaxed);
    }

    /// Publish one slot to the fetch unit.
    fn kickoff(&self, q: &mut QueueState, d: Descriptor) {
        let Some(pb) = q.pb.as_mut() else {
            debug_assert!(false, "{} kickoff on a closed channel", self.id);
            return;
        };
        pb.push(d.op, d.addr);
        // descriptor must be visible before the fetch unit is told
        self.mem.flush_writes();
        let _clk = self.clock.guard();
        self.regs.write32(self.reg(chreg::DMAPUT), pb.put_addr());
    }

    // --- reclamation -----------------------------------------------------

    /// Retire every entry whose threshold the hardware has reached.
    pub fn drain(&self) -> usize {
        let mut q = self.queue.lock().unwrap();
        self.drain_locked(&mut q)
    }

    /// Drain from the submitting thread until nothing is queued.
    pub(crate) fn drain_until_empty(&self) {
        loop {
            let mut q = self.queue.lock().unwrap();
            self.drain_locked(&mut q);
            if q.syncq.is_empty() {
                return;
            }
            drop(q);
            thread::yield_now();
        }
    }

    fn drain_locked(&self, q: &mut QueueState) -> usize {
        let _clk = self.clock.guard();
        let mut cached: Option<(CounterId, u32)> = None;
        let mut hw = |id: CounterId| match cached {
            Some((c, v)) if c == id => v,
            _ => {
                let v = self.counters.read(id);
                cached = Some((id, v));
                v
            }
        };

        let mut events = 0;
        let mut drained = 0;
        while let Some(head) = q.syncq.head() {
            if !reached(hw(head.counter), head.threshold) {
                break;
            }
            let handles = q.syncq.head_handles().iter().map(|&h| MemHandle::new(h)).collect();
            drop(PinGuard::adopt(Arc::clone(&self.mem), handles));

            if head.num_gathers != 0 {
                if let Some(pb) = q.pb.as_mut() {
                    pb.pop(head.num_gathers);
                }
                events |= QueueEvent::PushBuffer.bit();
            }
            q.syncq.dequeue();
            events |= QueueEvent::SyncQueue.bit();
            drained += 1;
        }

        let mut i = 0;
        while i < q.retire.len() {
            let r = q.retire[i];
            if reached(hw(r.counter), r.value) {
                q.retire.remove(i);
                self.contexts.retire(r.action);
            } else {
                i += 1;
            }
        }

        if q.syncq.is_empty() {
            events |= QueueEvent::Empty.bit();
        }
        if q.waiting & events != 0 {
            q.waiting = 0;
            self.space.notify_all();
        }
        self.stats
            .drained
            .fetch_add(drained as u64, Ordering::Relaxed);
        drained
    }

    /// Throw away everything queued and restart from an empty ring.
    ///
    /// Pins are released and discarded counter increments are
    /// completed from the CPU so nobody waits forever on them. Must not
    /// race a submission on the same channel.
    pub fn abort(&self) {
        let mut q = self.queue.lock().unwrap();
        if q.pb.is_none() {
            return;
        }
        let discarded = self.discard_locked(&mut q);
        kwarn!("{} aborted, {} entries discarded", self.id, discarded);
    }

    /// Bring the fetch unit back after the host lost its registers.
    pub(crate) fn restart_after_power_loss(&self) {
        let mut q = self.queue.lock().unwrap();
        if q.pb.is_none() {
            return;
        }
        let _clk = self.clock.guard();
        self.program_dma();
        if q.syncq.is_empty() {
            self.reset_locked(&mut q);
        } else {
            let discarded = self.discard_locked(&mut q);
            kwarn!("{} lost {} entries across power loss", self.id, discarded);
        }
    }

    fn discard_locked(&self, q: &mut QueueState) -> usize {
        let _clk = self.clock.guard();
        self.regs.write32(self.reg(chreg::DMACTRL), dmactrl::DMASTOP);

        let mut targets: Vec<(CounterId, u32)> = Vec::new();
        let mut note = |id: CounterId, value: u32| match targets.iter_mut().find(|t| t.0 == id) {
            Some(t) => {
                if reached(value, t.1) {
                    t.1 = value;
                }
            }
            None => targets.push((id, value)),
        };

        let mut discarded = 0;
        while let Some(head) = q.syncq.head() {
            let handles = q.syncq.head_handles().iter().map(|&h| MemHandle::new(h)).collect();
            drop(PinGuard::adopt(Arc::clone(&self.mem), handles));
            note(head.counter, head.threshold);
            q.syncq.dequeue();
            discarded += 1;
        }
        for r in q.retire.drain(..) {
            note(r.counter, r.value);
            self.contexts.retire(r.action);
        }

        for (id, value) in targets {
            if self.counters.is_client_managed(id) {
                continue;
            }
            let missing = value.wrapping_sub(self.counters.read(id)) as i32;
            for _ in 0..missing.max(0) {
                self.counters.cpu_incr(id);
            }
        }

        self.reset_locked(q);
        q.waiting = 0;
        self.space.notify_all();
        discarded
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            submits: self.stats.submits.load(Ordering::Relaxed),
            gathers: self.stats.gathers.load(Ordering::Relaxed),
            drained: self.stats.drained.load(Ordering::Relaxed),
            waits: self.stats.waits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxhost_core::counter::reserved;
    use gfxhost_core::opcode::{self, COND_IMMEDIATE};
    use gfxhost_hw::SimBackend;

    const CH: u32 = 1;
    const SP: CounterId = CounterId::new(7);

    fn setup(pushbuffer_size: u32) -> (SimBackend, Arc<Channel>) {
        let sim = SimBackend::new();
        let mem: Arc<dyn MemoryManager> = sim.mem.clone();
        let clock = Arc::new(HostClock::new(sim.power.clone()));
        let counters = Arc::new(Counters::new(
            sim.host.clone(),
            reserved::MASK,
            reserved::CLIENT_MANAGED_MASK,
        ));
        let contexts = Arc::new(Contexts::new(mem.clone()));
        let ch = Arc::new(Channel::new(
            ChannelId::new(CH),
            sim.host.clone(),
            mem,
            clock,
            counters,
            contexts,
            pushbuffer_size,
            256,
        ));
        ch.acquire().unwrap();
        (sim, ch)
    }

    /// Segment whose words each increment `id` once
    fn incr_segment(sim: &SimBackend, id: CounterId, n: u32) -> Segment {
        let words = vec![opcode::incr_syncpt(COND_IMMEDIATE, id.as_u32()); n as usize];
        Segment::new(sim.mem.alloc_words(&words).unwrap(), 0, n)
    }

    fn submit(ch: &Channel, segs: &[Segment], relocs: &[Relocation], value: u32, null: bool) {
        let mut sub = ch.lock_submit();
        let prepared = ch.prepare(&mut sub, segs, relocs).unwrap();
        ch.commit(&mut sub, prepared, SP, value, null, &[]);
    }

    #[test]
    fn test_open_programs_fetch_unit() {
        let (sim, ch) = setup(4096);
        assert!(ch.is_open());
        let put = sim.host.dma_put(CH);
        assert_eq!(sim.host.dma_get(CH), put);
        assert!(!sim.host.is_stopped(CH));

        ch.release();
        assert!(!ch.is_open());
        assert!(sim.host.is_stopped(CH));
        assert_eq!(sim.mem.live_allocations(), 0);
        assert_eq!(sim.host.clock_violations(), 0);
    }

    #[test]
    fn test_submit_then_drain_releases_exactly_its_slots() {
        let (sim, ch) = setup(4096);
        sim.host.set_paused(true);
        let segs: Vec<_> = (0..3).map(|_| incr_segment(&sim, SP, 1)).collect();
        submit(&ch, &segs, &[], 3, false);

        assert_eq!(ch.in_flight(), 3);
        assert_eq!(sim.mem.pin_count(segs[0].mem), 1);
        assert_eq!(ch.drain(), 0);

        sim.host.run_pending(CH, 2);
        assert_eq!(ch.drain(), 0);
        assert_eq!(ch.in_flight(), 3);

        sim.host.set_paused(false);
        assert_eq!(ch.drain(), 1);
        assert_eq!(ch.in_flight(), 0);
        assert!(ch.is_idle());
        assert_eq!(sim.mem.pin_count(segs[0].mem), 0);
        assert_eq!(sim.mem.ref_count(segs[0].mem), 1);
        assert_eq!(ch.stats().drained, 1);
        assert_eq!(sim.host.clock_violations(), 0);
    }

    #[test]
    fn test_drain_stops_at_first_pending_entry() {
        let (sim, ch) = setup(4096);
        sim.host.set_paused(true);
        let a = incr_segment(&sim, SP, 1);
        let b = incr_segment(&sim, SP, 1);
        submit(&ch, &[a], &[], 1, false);
        submit(&ch, &[b], &[], 2, false);

        sim.host.run_pending(CH, 1);
        assert_eq!(ch.drain(), 1);
        assert_eq!(sim.mem.pin_count(a.mem), 0);
        assert_eq!(sim.mem.pin_count(b.mem), 1);
    }

    #[test]
    fn test_full_push_buffer_blocks_submitter() {
        // 64 bytes: 7 usable slots
        let (sim, ch) = setup(64);
        sim.host.set_paused(true);
        let first: Vec<_> = (0..5).map(|_| incr_segment(&sim, SP, 1)).collect();
        submit(&ch, &first, &[], 5, false);

        let second: Vec<_> = (0..4).map(|_| incr_segment(&sim, SP, 1)).collect();
        let ch2 = Arc::clone(&ch);
        let blocked = thread::spawn(move || submit(&ch2, &second, &[], 9, false));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ch.in_flight(), 7);
        assert!(ch.stats().waits >= 1);
        assert!(!blocked.is_finished());

        sim.host.set_paused(false);
        ch.drain();
        blocked.join().unwrap();

        assert_eq!(sim.host.counter_value(SP), 9);
        ch.drain();
        assert!(ch.is_idle());
        assert_eq!(ch.in_flight(), 0);
    }

    #[test]
    fn test_partial_drain_wakes_only_submitters_that_fit() {
        use std::sync::atomic::{AtomicU32, AtomicUsize};

        let (sim, ch) = setup(64);
        sim.host.set_paused(true);
        for v in 1..=7 {
            submit(&ch, &[incr_segment(&sim, SP, 1)], &[], v, false);
        }
        assert_eq!(ch.in_flight(), 7);

        // four submitters of two gathers each, values handed out under
        // the submit lock so the queue stays ordered
        let next = Arc::new(AtomicU32::new(7));
        let done = Arc::new(AtomicUsize::new(0));
        let blocked: Vec<_> = (0..4)
            .map(|_| {
                let segs: Vec<_> = (0..2).map(|_| incr_segment(&sim, SP, 1)).collect();
                let (ch, next, done) = (Arc::clone(&ch), Arc::clone(&next), Arc::clone(&done));
                thread::spawn(move || {
                    let mut sub = ch.lock_submit();
                    let prepared = ch.prepare(&mut sub, &segs, &[]).unwrap();
                    let value = next.fetch_add(2, Ordering::SeqCst) + 2;
                    ch.commit(&mut sub, prepared, SP, value, false, &[]);
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 0);

        // retiring four slots makes room for exactly two submitters
        assert_eq!(sim.host.run_pending(CH, 4), 4);
        assert_eq!(ch.drain(), 4);
        let deadline = Instant::now() + Duration::from_secs(2);
        while done.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            assert!(ch.in_flight() <= 7);
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(ch.in_flight(), 7);

        sim.host.set_paused(false);
        let deadline = Instant::now() + Duration::from_secs(2);
        while done.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            ch.drain();
            assert!(ch.in_flight() <= 7);
            thread::sleep(Duration::from_millis(1));
        }
        for t in blocked {
            t.join().unwrap();
        }
        ch.drain();
        assert!(ch.is_idle());
        assert_eq!(sim.host.counter_value(SP), 15);
    }

    #[test]
    fn test_in_flight_tracks_written_minus_retired() {
        let (sim, ch) = setup(64);
        sim.host.set_paused(true);
        let mut queued: VecDeque<(u32, u32)> = VecDeque::new();
        let (mut value, mut written, mut retired) = (0u32, 0u32, 0u32);

        for i in 0..40u32 {
            let gathers = 1 + i % 2;
            if ch.in_flight() + gathers <= 7 {
                let segs: Vec<_> = (0..gathers).map(|_| incr_segment(&sim, SP, 1)).collect();
                value += gathers;
                submit(&ch, &segs, &[], value, false);
                queued.push_back((value, gathers));
                written += gathers;
            }
            sim.host.run_pending(CH, (i % 3) as usize);
            ch.drain();

            let hw = sim.host.counter_value(SP);
            while let Some(&(v, g)) = queued.front() {
                if !reached(hw, v) {
                    break;
                }
                queued.pop_front();
                retired += g;
            }
            assert_eq!(ch.in_flight(), written - retired);
            assert!(ch.in_flight() <= 7);
        }
        assert!(retired > 0);
    }

    #[test]
    fn test_relocations_are_patched() {
        let (sim, ch) = setup(4096);
        let data = sim.mem.alloc_words(&[0; 4]).unwrap();
        let target = sim.mem.alloc_words(&[0; 16]).unwrap();
        let relocs = [
            Relocation::new(data, 8, target, 0x10),
            Relocation::new(data, 12, target, 0x20).with_shift(4),
        ];
        let seg = incr_segment(&sim, SP, 1);
        submit(&ch, &[seg], &relocs, 1, false);

        let phys = sim.mem.phys_of(target).unwrap();
        assert_eq!(sim.mem.read32(data, 8), phys + 0x10);
        assert_eq!(sim.mem.read32(data, 12), (phys + 0x20) >> 4);
        // the target is pinned once for both relocations
        assert_eq!(sim.mem.pin_count(target), 1);
    }

    #[test]
    fn test_null_kickoff_writes_noops() {
        let (sim, ch) = setup(4096);
        let seg = incr_segment(&sim, SP, 2);
        submit(&ch, &[seg], &[], 2, true);

        assert_eq!(sim.host.fetched(CH), vec![Descriptor::noop()]);
        assert_eq!(sim.host.counter_value(SP), 0);
    }

    #[test]
    fn test_pin_failure_touches_no_hardware() {
        let (sim, ch) = setup(4096);
        let good = incr_segment(&sim, SP, 1);
        let bad = incr_segment(&sim, SP, 1);
        sim.mem.poison(bad.mem);

        let mut sub = ch.lock_submit();
        assert!(ch.prepare(&mut sub, &[good, bad], &[]).is_err());
        drop(sub);

        assert!(sim.host.fetched(CH).is_empty());
        assert_eq!(sim.mem.pin_count(good.mem), 0);
        assert_eq!(sim.mem.ref_count(good.mem), 1);
        assert!(ch.is_idle());
    }

    #[test]
    fn test_abort_releases_and_completes_counters() {
        let (sim, ch) = setup(4096);
        sim.host.set_paused(true);
        let segs = [incr_segment(&sim, SP, 1), incr_segment(&sim, SP, 1)];
        submit(&ch, &segs, &[], 2, false);

        ch.abort();
        assert!(ch.is_idle());
        assert_eq!(ch.in_flight(), 0);
        assert_eq!(sim.mem.pin_count(segs[0].mem), 0);
        assert_eq!(sim.host.counter_value(SP), 2);
        assert_eq!(sim.host.pending(CH), 0);
        assert_eq!(sim.host.dma_get(CH), sim.host.dma_put(CH));
    }

    #[test]
    fn test_close_waits_for_outstanding_work() {
        let (sim, ch) = setup(4096);
        sim.host.set_paused(true);
        let seg = incr_segment(&sim, SP, 1);
        submit(&ch, &[seg], &[], 1, false);

        let ch2 = Arc::clone(&ch);
        let closer = thread::spawn(move || ch2.release());
        thread::sleep(Duration::from_millis(30));
        assert!(!closer.is_finished());

        sim.host.set_paused(false);
        ch.drain();
        closer.join().unwrap();
        assert!(!ch.is_open());
        assert_eq!(sim.mem.pin_count(seg.mem), 0);
    }

    #[test]
    fn test_wait_idle_times_out() {
        let (sim, ch) = setup(4096);
        sim.host.set_paused(true);
        submit(&ch, &[incr_segment(&sim, SP, 1)], &[], 1, false);
        assert!(!ch.wait_idle(Duration::from_millis(20)));
        sim.host.set_paused(false);
        ch.drain();
        assert!(ch.wait_idle(Duration::from_millis(20)));
    }
}
