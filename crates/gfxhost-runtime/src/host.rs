//! The host context object
//!
//! `Host` owns everything the manager keeps for one accelerator: the
//! channel table, counter shadows, contexts, the wait list and its
//! worker, the power scheduler and its worker, and the module register
//! path. It is created once per device and torn down with `shutdown`
//! (or on drop).
//!
//! # Lock order
//!
//! power scheduler -> channel submit -> channel queue -> leaf locks
//! (contexts, counters, pins). Wait-list locks are leaves as seen from
//! here; its actions run with every wait-list lock released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gfxhost_core::constants::NB_COUNTERS;
use gfxhost_core::counter::reserved;
use gfxhost_core::error::{BusFault, HostError, HostResult};
use gfxhost_core::regs;
use gfxhost_core::traits::{IrqController, IrqLine, MemoryManager, Mmio, PowerControl};
use gfxhost_core::{kdebug, kinfo, kwarn, ChannelId, ContextId, CounterId, Fence, ModuleId, ModuleKind};

use crate::acm::{spawn_acm, AcmHandle, PowerScheduler, PowerStats};
use crate::channel::{Channel, ChannelStats};
use crate::clock::HostClock;
use crate::config::{HostConfig, RegisterPath};
use crate::context::{ContextSpec, Contexts, RetireAction};
use crate::device::Device;
use crate::intr::{init_host, scaled_timeout, FaultLog};
use crate::modregs::{module_registers, ModuleRegisters};
use crate::semaphore::{new_semaphore, Semaphore};
use crate::submit::{CounterTarget, Submission};
use crate::suspend::{self, SavedState};
use crate::syncpt::Counters;
use crate::waitlist::{spawn_worker, WaitAction, WaitList, WaitListHandle, WaitListStats};

/// Module mutexes shared between the CPU and the display channels
pub mod mlocks {
    pub const DISPLAY_A: u32 = 1;
    pub const DISPLAY_B: u32 = 2;
    pub const DSI: u32 = 3;
}

/// An open reference to a channel, returned by `Host::open`.
///
/// Give it back with `Host::close`; dropping it keeps the channel open.
pub struct ChannelHandle {
    channel: Arc<Channel>,
    modules: Vec<ModuleId>,
}

impl ChannelHandle {
    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Modules the handle was opened for
    pub fn modules(&self) -> &[ModuleId] {
        &self.modules
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

struct Workers {
    waitlist: WaitListHandle,
    acm: AcmHandle,
}

pub struct Host {
    config: HostConfig,
    regs: Arc<dyn Mmio>,
    power: Arc<dyn PowerControl>,
    irq: Arc<dyn IrqController>,
    clock: Arc<HostClock>,
    counters: Arc<Counters>,
    contexts: Arc<Contexts>,
    channels: Vec<Arc<Channel>>,
    waitlist: Arc<WaitList>,
    acm: Arc<PowerScheduler>,
    faults: Arc<FaultLog>,
    modregs: Box<dyn ModuleRegisters>,
    /// Host clock frequency granted at init
    granted_khz: u32,
    saved: Mutex<Option<SavedState>>,
    workers: Mutex<Option<Workers>>,
    closed: AtomicBool,
}

impl Host {
    /// Bring up the host on `device`: program its registers, hook both
    /// interrupt lines and start the wait-list and power workers.
    pub fn new(config: HostConfig, device: Device) -> HostResult<Self> {
        #[cfg(feature = "debug-logging")]
        gfxhost_core::kprint::set_log_level(gfxhost_core::kprint::LogLevel::Debug);

        config.validate()?;

        let granted_khz = device.power.set_host_clock_khz(config.host_clock_default_khz)?;
        let timeout = scaled_timeout(
            granted_khz,
            config.host_clock_default_khz,
            config.acm_fudge,
            config.acm_timeout,
        );
        if timeout != config.acm_timeout {
            kinfo!("host clock {} kHz, power timeout stretched to {:?}", granted_khz, timeout);
        }

        let clock = Arc::new(HostClock::new(Arc::clone(&device.power)));
        let counters = Arc::new(Counters::new(
            Arc::clone(&device.regs),
            config.reserved_counters,
            config.client_managed_counters,
        ));
        let contexts = Arc::new(Contexts::new(Arc::clone(&device.mem)));
        let mem: Arc<dyn MemoryManager> = Arc::clone(&device.mem);
        let channels = (0..config.num_channels)
            .map(|i| {
                Arc::new(Channel::new(
                    ChannelId::new(i as u32),
                    Arc::clone(&device.regs),
                    Arc::clone(&mem),
                    Arc::clone(&clock),
                    Arc::clone(&counters),
                    Arc::clone(&contexts),
                    config.pushbuffer_size,
                    config.sync_queue_words,
                ))
            })
            .collect();

        let kick = new_semaphore();
        let waitlist = Arc::new(WaitList::new(
            Arc::clone(&device.regs),
            Arc::clone(&clock),
            Arc::clone(&counters),
            Arc::clone(&kick),
            config.poll_mode,
        ));
        let acm = Arc::new(PowerScheduler::new(
            Arc::clone(&clock),
            Arc::clone(&device.power),
            Arc::clone(&counters),
            Arc::clone(&waitlist),
            Arc::clone(&device.clock),
            timeout,
            kick,
        ));
        let faults = Arc::new(FaultLog::new());
        let modregs = module_registers(
            config.register_path,
            Arc::clone(&device.regs),
            Arc::clone(&device.modules),
            Arc::clone(&clock),
            Arc::clone(&faults),
        );

        let host = Host {
            regs: device.regs,
            power: device.power,
            irq: device.irq,
            clock,
            counters,
            contexts,
            channels,
            waitlist,
            acm,
            faults,
            modregs,
            granted_khz,
            saved: Mutex::new(None),
            workers: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        };
        host.start()?;
        Ok(host)
    }

    /// Program the host, hook interrupts and spawn the workers. On
    /// error the caller drops the host, which undoes whatever started.
    fn start(&self) -> HostResult<()> {
        {
            let _clk = self.clock.guard();
            init_host(&*self.regs, self.granted_khz);
            for slot in 0..NB_COUNTERS as u32 {
                let id = CounterId::new(slot);
                if self.counters.is_reserved(id) {
                    self.counters.reset(id);
                }
            }
            self.waitlist.reset_interrupts();
        }

        let wl = Arc::clone(&self.waitlist);
        self.irq
            .register(IrqLine::Syncpt, Arc::new(move || wl.service_thresholds()))?;

        let (faults, regs, clock) = (
            Arc::clone(&self.faults),
            Arc::clone(&self.regs),
            Arc::clone(&self.clock),
        );
        self.irq.register(
            IrqLine::General,
            Arc::new(move || {
                let _clk = clock.guard();
                faults.service(&*regs);
            }),
        )?;

        let waitlist = spawn_worker(Arc::clone(&self.waitlist))?;
        let acm = spawn_acm(Arc::clone(&self.acm))?;
        *self.workers.lock().unwrap() = Some(Workers { waitlist, acm });

        kinfo!(
            "host up: {} channels, {} register path{}",
            self.channels.len(),
            match self.config.register_path {
                RegisterPath::Direct => "direct",
                RegisterPath::Indirect => "indirect",
            },
            if self.config.poll_mode { ", polling" } else { "" }
        );
        Ok(())
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_running(&self) -> HostResult<()> {
        if self.is_shutdown() {
            Err(HostError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Usable push-buffer slots; one is always left free.
    fn pushbuffer_capacity(&self) -> usize {
        self.config.pushbuffer_slots() as usize - 1
    }

    // --- channels --------------------------------------------------------

    /// Open the channel serving `modules`.
    ///
    /// Display wins the routing, then DSI, then the first module given.
    pub fn open(&self, modules: &[ModuleId]) -> HostResult<ChannelHandle> {
        self.check_running()?;
        let Some(first) = modules.first() else {
            return Err(HostError::InvalidArgument("no modules to open a channel for"));
        };
        if modules.iter().any(|m| m.kind == ModuleKind::Host) {
            return Err(HostError::InvalidArgument("the host is not a channel client"));
        }
        let kind = [ModuleKind::Display, ModuleKind::Dsi]
            .into_iter()
            .find(|k| modules.iter().any(|m| m.kind == *k))
            .unwrap_or(first.kind);

        let id = self.config.channel_for(kind);
        let channel = self
            .channels
            .get(id.as_usize())
            .ok_or(HostError::InvalidArgument("module routed to an unmanaged channel"))?;
        channel.acquire()?;
        Ok(ChannelHandle {
            channel: Arc::clone(channel),
            modules: modules.to_vec(),
        })
    }

    /// Drop a channel reference. The last one waits for outstanding
    /// work, stops the fetch unit and frees the push buffer.
    pub fn close(&self, handle: ChannelHandle) {
        handle.channel.release();
    }

    /// Queue `submission` on `handle`'s channel.
    ///
    /// Returns the fence the work retires at. May block for push-buffer
    /// or completion-queue space. On error nothing reached the hardware
    /// and every pin taken has been released.
    pub fn submit(&self, handle: &ChannelHandle, submission: &Submission<'_>) -> HostResult<Fence> {
        let mut st = self.acm.lock();
        self.check_running()?;
        if st.is_suspended() {
            return Err(HostError::InvalidState("host is suspended"));
        }
        submission.validate(self.config.submit_max_handles)?;
        Counters::check(submission.counter)?;

        let counter = submission.counter;
        let client_managed = self.counters.is_client_managed(counter);
        let own = match submission.target {
            CounterTarget::Increment(_) if client_managed => {
                return Err(HostError::InvalidArgument(
                    "client-managed counters take absolute values",
                ));
            }
            CounterTarget::Value(_) if client_managed => 0,
            CounterTarget::Increment(n) => n,
            CounterTarget::Value(v) => {
                let n = v.wrapping_sub(self.counters.read_max(counter)) as i32;
                if n < 0 {
                    return Err(HostError::InvalidArgument("target value is behind the counter"));
                }
                n as u32
            }
        };
        if client_managed && submission.null_kickoff {
            return Err(HostError::InvalidArgument(
                "null kickoff needs a counter the host drives",
            ));
        }

        let ch = &handle.channel;
        let mut sub = ch.lock_submit();

        let ctx = match submission.context {
            Some(id) => {
                let u = self.contexts.plan(id)?;
                if !handle.modules.contains(&u.module) {
                    return Err(HostError::InvalidArgument("context engine is not on this channel"));
                }
                Some(u)
            }
            None => None,
        };
        let mut segments = ctx.as_ref().map(|u| u.prefix()).unwrap_or_default();
        segments.extend_from_slice(submission.segments);
        if segments.len() > self.pushbuffer_capacity() {
            return Err(HostError::InvalidArgument("submission does not fit the push buffer"));
        }

        let prepared = ch.prepare(&mut sub, &segments, submission.relocs)?;

        // nothing below can fail
        let prev = ctx.as_ref().and_then(|u| u.prev.as_ref());
        let save = prev.map(|p| Fence::new(p.counter, self.counters.incr_max(p.counter, p.incrs)));
        let value = match submission.target {
            CounterTarget::Value(v) if client_managed => v,
            _ => self.counters.incr_max(counter, own),
        };

        let kick = self.acm.host_is_busy(&mut st);
        for &module in &handle.modules {
            self.acm.module_busy(&mut st, module, counter, value);
        }

        let mut retire = Vec::with_capacity(2);
        if let Some(u) = &ctx {
            if let (Some(p), Some(f)) = (prev, save) {
                retire.push((f.counter, f.value, RetireAction::Save(p.ctx, f)));
            }
            retire.push((counter, value, RetireAction::Ref(u.ctx)));
            self.contexts.commit(u, save);
        }
        ch.commit(&mut sub, prepared, counter, value, submission.null_kickoff, &retire);

        if submission.null_kickoff {
            let _clk = self.clock.guard();
            if let (Some(p), Some(f)) = (prev, save) {
                for _ in 0..p.incrs {
                    self.counters.cpu_incr(f.counter);
                }
            }
            for _ in 0..own {
                self.counters.cpu_incr(counter);
            }
        }
        drop(sub);
        drop(st);

        self.schedule_drain(ch, counter, value);
        if kick {
            self.acm.kick();
        }
        Ok(Fence::new(counter, value))
    }

    /// Have the wait list drain `ch` once `counter` reaches `value`,
    /// or drain inline if the wait cannot be queued.
    fn schedule_drain(&self, ch: &Arc<Channel>, counter: CounterId, value: u32) {
        if let Err(e) = self
            .waitlist
            .schedule(counter, value, WaitAction::Drain(Arc::clone(ch)))
        {
            kwarn!("{}: completion wait not queued ({}), draining inline", ch.id(), e);
            ch.drain_until_empty();
        }
    }

    /// Throw away everything queued on `handle`'s channel.
    ///
    /// Counters the discarded work would have advanced are completed
    /// from the CPU.
    pub fn abort_channel(&self, handle: &ChannelHandle) {
        let _st = self.acm.lock();
        let _sub = handle.channel.lock_submit();
        handle.channel.abort();
    }

    pub fn channel_stats(&self, handle: &ChannelHandle) -> ChannelStats {
        handle.channel.stats()
    }

    // --- counters --------------------------------------------------------

    /// Claim the lowest free counter and reset it.
    ///
    /// Every open channel is flushed first so no queued work still
    /// refers to a counter that may be handed out again.
    pub fn counter_alloc(&self) -> HostResult<CounterId> {
        self.check_running()?;
        for ch in self.channels.iter().filter(|c| c.is_open()) {
            let _sub = ch.lock_submit();
            ch.flush();
        }
        let id = self.counters.alloc()?;
        // waits a previous owner gave up on must not see the new values
        self.waitlist.reset_counter(id);

        let _clk = self.clock.guard();
        self.counters.reset(id);
        self.regs.write32(regs::syncpt_int_thresh(id.as_u32()), 0);
        kdebug!("{} allocated", id);
        Ok(id)
    }

    /// Return a counter to the pool. Reserved counters are kept.
    pub fn counter_free(&self, id: CounterId) {
        self.counters.free(id);
    }

    /// Hardware value
    pub fn counter_read(&self, id: CounterId) -> HostResult<u32> {
        Counters::check(id)?;
        let _clk = self.clock.guard();
        Ok(self.counters.read(id))
    }

    /// Value the counter reaches once all queued work retires
    pub fn counter_read_max(&self, id: CounterId) -> HostResult<u32> {
        Counters::check(id)?;
        Ok(self.counters.read_max(id))
    }

    /// Increment from the CPU; returns the new shadow value.
    pub fn counter_incr(&self, id: CounterId) -> HostResult<u32> {
        Counters::check(id)?;
        let _st = self.acm.lock();
        let value = if self.counters.is_client_managed(id) {
            self.counters.read_max(id)
        } else {
            self.counters.incr_max(id, 1)
        };
        let _clk = self.clock.guard();
        self.counters.cpu_incr(id);
        Ok(value)
    }

    fn fence_reached(&self, fence: Fence) -> bool {
        let _clk = self.clock.guard();
        self.counters.is_expired(fence.counter, fence.value)
    }

    /// Block until `fence` is reached or `timeout` passes.
    pub fn fence_wait(&self, fence: Fence, timeout: Duration) -> HostResult<()> {
        Counters::check(fence.counter)?;
        if self.fence_reached(fence) {
            return Ok(());
        }
        let sem = new_semaphore();
        self.waitlist
            .schedule(fence.counter, fence.value, WaitAction::Signal(Arc::clone(&sem)))?;
        if sem.wait(Some(timeout)) || self.fence_reached(fence) {
            Ok(())
        } else {
            Err(HostError::Timeout {
                counter: fence.counter.as_u32(),
                threshold: fence.value,
            })
        }
    }

    /// Post `sem` once `counter` reaches `threshold`.
    ///
    /// Returns true, without posting, if it already has.
    pub fn signal_semaphore(
        &self,
        counter: CounterId,
        threshold: u32,
        sem: Arc<dyn Semaphore>,
    ) -> HostResult<bool> {
        Counters::check(counter)?;
        let fence = Fence::new(counter, threshold);
        if self.fence_reached(fence) {
            return Ok(true);
        }
        self.waitlist.schedule(counter, threshold, WaitAction::Signal(sem))?;
        Ok(false)
    }

    /// Fixed counter a module signals on. Display has two: frame done
    /// (index 0) and vblank (index 1).
    pub fn module_counter(&self, module: ModuleId, index: u32) -> HostResult<CounterId> {
        match (module.kind, index, module.instance) {
            (ModuleKind::Display, 0, 0) => Ok(reserved::DISP0),
            (ModuleKind::Display, 0, _) => Ok(reserved::DISP1),
            (ModuleKind::Display, 1, 0) => Ok(reserved::VBLANK0),
            (ModuleKind::Display, 1, _) => Ok(reserved::VBLANK1),
            (ModuleKind::Dsi, 0, _) => Ok(reserved::DSI),
            (ModuleKind::Display, _, _) | (ModuleKind::Dsi, _, _) => {
                Err(HostError::InvalidArgument("module counter index out of range"))
            }
            _ => Err(HostError::NotSupported),
        }
    }

    /// Module mutex guarding a module shared with a channel
    pub fn module_mutex(&self, module: ModuleId, index: u32) -> HostResult<u32> {
        match (module.kind, index) {
            (ModuleKind::Display, 0) => Ok(mlocks::DISPLAY_A),
            (ModuleKind::Display, 1) => Ok(mlocks::DISPLAY_B),
            (ModuleKind::Dsi, _) => Ok(mlocks::DSI),
            (ModuleKind::Display, _) => {
                Err(HostError::InvalidArgument("module mutex index out of range"))
            }
            _ => Err(HostError::NotSupported),
        }
    }

    /// Take module mutex `index` for the CPU, spinning until it is free.
    pub fn mlock_lock(&self, index: u32) -> HostResult<()> {
        let _clk = self.clock.guard();
        suspend::mlock_lock(&*self.regs, index)
    }

    pub fn mlock_unlock(&self, index: u32) -> HostResult<()> {
        let _clk = self.clock.guard();
        suspend::mlock_unlock(&*self.regs, index)
    }

    // --- module registers ------------------------------------------------

    pub fn register_path(&self) -> RegisterPath {
        self.modregs.path()
    }

    pub fn read_module_regs(&self, module: ModuleId, offsets: &[u32], values: &mut [u32]) -> HostResult<()> {
        self.modregs.read(module, offsets, values)
    }

    pub fn write_module_regs(&self, module: ModuleId, offsets: &[u32], values: &[u32]) -> HostResult<()> {
        self.modregs.write(module, offsets, values)
    }

    /// Bus faults seen so far, newest last
    pub fn faults(&self) -> Vec<BusFault> {
        self.faults.recent()
    }

    pub fn fault_count(&self) -> u64 {
        self.faults.total()
    }

    // --- contexts --------------------------------------------------------

    pub fn context_register(&self, spec: ContextSpec) -> HostResult<ContextId> {
        Counters::check(spec.counter)?;
        if self.counters.is_client_managed(spec.counter) {
            return Err(HostError::InvalidArgument("context save needs a counter the host drives"));
        }
        self.contexts.register(spec)
    }

    /// Release a context once it is neither saving nor in flight.
    pub fn context_free(&self, id: ContextId) -> HostResult<()> {
        self.contexts.free(id)
    }

    /// Save `module`'s active context ahead of a power-down.
    ///
    /// Returns the fence the save retires at. `NotInitialized` when the
    /// module has no active context.
    pub fn prepare_for_powerdown(&self, handle: &ChannelHandle, module: ModuleId) -> HostResult<Fence> {
        let mut st = self.acm.lock();
        self.check_running()?;
        if !handle.modules.contains(&module) {
            return Err(HostError::InvalidArgument("module is not on this channel"));
        }
        let ch = &handle.channel;
        let mut sub = ch.lock_submit();
        let save = self.contexts.active_save(module)?;
        let prepared = ch.prepare(&mut sub, &save.save, &[])?;

        let value = self.counters.incr_max(save.counter, save.incrs);
        let fence = Fence::new(save.counter, value);
        let kick = self.acm.host_is_busy(&mut st);
        self.acm.module_busy(&mut st, module, save.counter, value);
        self.contexts.mark_pending_save(save.ctx, module, fence);
        ch.commit(
            &mut sub,
            prepared,
            save.counter,
            value,
            false,
            &[(save.counter, value, RetireAction::Save(save.ctx, fence))],
        );
        drop(sub);
        drop(st);

        self.schedule_drain(ch, save.counter, value);
        if kick {
            self.acm.kick();
        }
        Ok(fence)
    }

    // --- power -----------------------------------------------------------

    /// Idle timeout in effect after clock scaling
    pub fn power_timeout(&self) -> Duration {
        self.acm.timeout()
    }

    pub fn power_stats(&self) -> PowerStats {
        self.acm.stats()
    }

    pub fn waitlist_stats(&self) -> WaitListStats {
        self.waitlist.stats()
    }

    /// Power every module down and save host state for deep sleep.
    ///
    /// Submissions fail with `InvalidState` until `resume`, which powers
    /// the same modules back on.
    pub fn suspend(&self) -> HostResult<()> {
        let mut st = self.acm.lock();
        self.check_running()?;
        if st.is_suspended() {
            return Err(HostError::InvalidState("host is already suspended"));
        }
        self.acm.park(&mut st);
        let saved = {
            let _clk = self.clock.guard();
            SavedState::save(&*self.regs)
        };
        *self.saved.lock().unwrap() = Some(saved);
        st.set_suspended(true);
        kdebug!("host suspended");
        Ok(())
    }

    /// Leave deep sleep. Host registers are rebuilt only when the wake
    /// event says they were lost.
    pub fn resume(&self) -> HostResult<()> {
        let mut st = self.acm.lock();
        if !st.is_suspended() {
            return Err(HostError::InvalidState("host is not suspended"));
        }
        let wake = self.power.wake_event();
        let saved = self.saved.lock().unwrap().take();
        if wake.lost_state() {
            let saved = saved.ok_or(HostError::NotInitialized)?;
            {
                let _clk = self.clock.guard();
                init_host(&*self.regs, self.granted_khz);
                saved.restore(&*self.regs)?;
            }
            self.waitlist.restore();
            for ch in self.channels.iter().filter(|c| c.is_open()) {
                ch.restart_after_power_loss();
            }
        }
        let kick = self.acm.unpark(&mut st);
        st.set_suspended(false);
        drop(st);
        if kick {
            self.acm.kick();
        }
        kdebug!("host resumed ({:?})", wake);
        Ok(())
    }

    // --- teardown --------------------------------------------------------

    /// Abort unfinished work, stop both workers, fire every pending
    /// wait and unhook the interrupts. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.waitlist.close();
        let workers = self.workers.lock().unwrap().take();
        let (wl_worker, acm_worker) = match workers {
            Some(w) => (Some(w.waitlist), Some(w.acm)),
            None => (None, None),
        };

        // A submitter waiting for ring space holds the power lock until a
        // drain frees slots, so the wait-list worker keeps running until
        // the lock is ours.
        {
            let _st = self.acm.lock();
            for ch in self.channels.iter().filter(|c| c.is_open() && !c.is_idle()) {
                let _sub = ch.lock_submit();
                ch.abort();
            }
        }
        let wl_stats = wl_worker.map(|w| w.shutdown()).unwrap_or_default();
        let flushed = self.waitlist.flush_all();
        self.irq.unregister(IrqLine::Syncpt);
        self.irq.unregister(IrqLine::General);

        let acm_stats = acm_worker.map(|w| w.shutdown()).unwrap_or_default();
        kinfo!(
            "host down: {} waits fired by worker, {} flushed, {} power checks",
            wl_stats.fired,
            flushed,
            acm_stats.kicks + acm_stats.timeouts
        );
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextState;
    use crate::device::testing::{device_for, sim_device};
    use crate::submit::Segment;
    use gfxhost_core::error::FaultKind;
    use gfxhost_core::opcode::{self, COND_IMMEDIATE};
    use gfxhost_core::WakeEvent;
    use gfxhost_hw::{MlockOwner, SimBackend};
    use std::thread;
    use std::time::Instant;

    const GR2D: ModuleId = ModuleId::new(ModuleKind::Gr2d, 0);
    const GR3D: ModuleId = ModuleId::new(ModuleKind::Gr3d, 0);
    const DISP: ModuleId = ModuleId::new(ModuleKind::Display, 0);
    const DSI: ModuleId = ModuleId::new(ModuleKind::Dsi, 0);
    const LONG: Duration = Duration::from_secs(2);

    fn config() -> HostConfig {
        HostConfig::new().acm_timeout(Duration::from_millis(50))
    }

    fn host() -> (SimBackend, Host) {
        let (sim, dev) = sim_device();
        let host = Host::new(config(), dev).unwrap();
        (sim, host)
    }

    /// Segment whose `n` words each increment `id` once
    fn incr_segment(sim: &SimBackend, id: CounterId, n: u32) -> Segment {
        let words = vec![opcode::incr_syncpt(COND_IMMEDIATE, id.as_u32()); n as usize];
        Segment::new(sim.mem.alloc_words(&words).unwrap(), 0, n)
    }

    fn noop_segment(sim: &SimBackend, n: u32) -> Segment {
        let words = vec![opcode::NOOP; n as usize];
        Segment::new(sim.mem.alloc_words(&words).unwrap(), 0, n)
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + LONG;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_open_routes_by_affinity() {
        let (_sim, host) = host();
        let h = host.open(&[GR2D, DISP]).unwrap();
        assert_eq!(h.id(), ChannelId::new(0));
        let d = host.open(&[GR2D, DSI]).unwrap();
        assert_eq!(d.id(), ChannelId::new(6));
        let g = host.open(&[GR3D]).unwrap();
        assert_eq!(g.id(), ChannelId::new(2));
        assert!(g.channel().is_open());

        assert!(host.open(&[]).is_err());
        assert!(host.open(&[ModuleId::HOST]).is_err());

        host.close(h);
        host.close(d);
        host.close(g);
    }

    #[test]
    fn test_submit_retires_and_releases_everything() {
        let (sim, host) = host();
        let h = host.open(&[GR2D]).unwrap();
        let sp = host.counter_alloc().unwrap();
        host.counter_incr(sp).unwrap();
        host.counter_incr(sp).unwrap();
        assert_eq!(host.counter_read_max(sp).unwrap(), 2);

        let segs: Vec<Segment> = (0..3).map(|_| incr_segment(&sim, sp, 1)).collect();
        let fence = host
            .submit(&h, &Submission::new(&segs, sp, CounterTarget::Value(5)))
            .unwrap();
        assert_eq!(fence, Fence::new(sp, 5));
        assert_eq!(host.counter_read_max(sp).unwrap(), 5);

        host.fence_wait(fence, LONG).unwrap();
        assert!(h.channel().wait_idle(LONG));
        assert_eq!(h.channel().in_flight(), 0);
        for s in &segs {
            assert_eq!(sim.mem.pin_count(s.mem), 0);
        }
        let stats = host.channel_stats(&h);
        assert_eq!((stats.submits, stats.gathers, stats.drained), (1, 3, 1));
        host.close(h);
    }

    #[test]
    fn test_target_validation() {
        let (sim, host) = host();
        let h = host.open(&[GR2D]).unwrap();
        let sp = host.counter_alloc().unwrap();
        host.counter_incr(sp).unwrap();
        host.counter_incr(sp).unwrap();
        let segs = [incr_segment(&sim, sp, 1)];

        let behind = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Value(1)));
        assert!(matches!(behind, Err(HostError::InvalidArgument(_))));

        let vblank = reserved::VBLANK0;
        let incr = host.submit(&h, &Submission::new(&segs, vblank, CounterTarget::Increment(1)));
        assert!(matches!(incr, Err(HostError::InvalidArgument(_))));
        assert_eq!(host.channel_stats(&h).submits, 0);
        host.close(h);
    }

    #[test]
    fn test_client_managed_counter_leaves_shadow_alone() {
        let (sim, host) = host();
        let h = host.open(&[DISP]).unwrap();
        let vblank = host.module_counter(DISP, 1).unwrap();
        assert_eq!(vblank, reserved::VBLANK0);

        let segs = [noop_segment(&sim, 2)];
        let fence = host
            .submit(&h, &Submission::new(&segs, vblank, CounterTarget::Value(4)))
            .unwrap();
        assert_eq!(fence.value, 4);
        assert_eq!(host.counter_read_max(vblank).unwrap(), 0);
        assert!(!h.channel().is_idle());

        sim.host.advance_counter(vblank, 4);
        host.fence_wait(fence, LONG).unwrap();
        assert!(h.channel().wait_idle(LONG));
        host.close(h);
    }

    #[test]
    fn test_null_kickoff_completes_from_cpu() {
        let (sim, host) = host();
        let h = host.open(&[GR2D]).unwrap();
        let sp = host.counter_alloc().unwrap();
        let segs = [incr_segment(&sim, sp, 2), incr_segment(&sim, sp, 1)];
        let sub = Submission::new(&segs, sp, CounterTarget::Increment(3)).null_kickoff(true);
        let fence = host.submit(&h, &sub).unwrap();

        host.fence_wait(fence, LONG).unwrap();
        assert_eq!(host.counter_read(sp).unwrap(), 3);
        let ch = h.id().as_u32();
        assert!(sim
            .host
            .executed(ch)
            .iter()
            .all(|d| *d == gfxhost_core::Descriptor::noop()));
        assert!(h.channel().wait_idle(LONG));
        host.close(h);
    }

    #[test]
    fn test_fence_wait_times_out() {
        let (_sim, host) = host();
        let sp = host.counter_alloc().unwrap();
        let err = host
            .fence_wait(Fence::new(sp, 1), Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, HostError::Timeout { counter: sp.as_u32(), threshold: 1 });
    }

    #[test]
    fn test_signal_semaphore() {
        let (sim, host) = host();
        let sp = host.counter_alloc().unwrap();
        let sem = new_semaphore();
        assert!(host.signal_semaphore(sp, 0, sem.clone()).unwrap());
        assert!(!host.signal_semaphore(sp, 2, sem.clone()).unwrap());
        assert!(!sem.wait(Some(Duration::from_millis(20))));
        sim.host.advance_counter(sp, 2);
        assert!(sem.wait(Some(LONG)));
    }

    #[test]
    fn test_counter_alloc_and_free() {
        let (_sim, host) = host();
        let a = host.counter_alloc().unwrap();
        assert_eq!(a, CounterId::new(6));
        let b = host.counter_alloc().unwrap();
        assert_eq!(b, CounterId::new(7));
        host.counter_free(a);
        assert_eq!(host.counter_alloc().unwrap(), a);

        host.counter_free(reserved::DISP0);
        for _ in 8..32 {
            host.counter_alloc().unwrap();
        }
        assert!(matches!(host.counter_alloc(), Err(HostError::Exhausted(_))));
    }

    #[test]
    fn test_module_counters_and_mutexes() {
        let (sim, host) = host();
        let disp1 = ModuleId::new(ModuleKind::Display, 1);
        assert_eq!(host.module_counter(DISP, 0).unwrap(), reserved::DISP0);
        assert_eq!(host.module_counter(disp1, 0).unwrap(), reserved::DISP1);
        assert_eq!(host.module_counter(disp1, 1).unwrap(), reserved::VBLANK1);
        assert_eq!(host.module_counter(DSI, 0).unwrap(), reserved::DSI);
        assert_eq!(host.module_counter(GR2D, 0), Err(HostError::NotSupported));

        let m = host.module_mutex(DSI, 0).unwrap();
        assert_eq!(m, mlocks::DSI);
        host.mlock_lock(m).unwrap();
        assert_eq!(sim.host.mlock_owner(m as usize), MlockOwner::Cpu);
        host.mlock_unlock(m).unwrap();
        assert_eq!(sim.host.mlock_owner(m as usize), MlockOwner::Free);
    }

    #[test]
    fn test_module_registers_and_faults() {
        let (sim, host) = host();
        assert_eq!(host.register_path(), RegisterPath::Indirect);
        host.write_module_regs(GR2D, &[0x40, 0x48], &[0xabc, 0xdef]).unwrap();
        assert_eq!(sim.host.module_reg(GR2D, 0x48), 0xdef);
        let mut values = [0u32; 2];
        host.read_module_regs(GR2D, &[0x48, 0x40], &mut values).unwrap();
        assert_eq!(values, [0xdef, 0xabc]);

        sim.host.inject_bus_fault(FaultKind::Write, 0x5400_0040);
        assert!(wait_for(|| host.fault_count() == 1));
        assert_eq!(host.faults()[0], BusFault { kind: FaultKind::Write, addr: 0x5400_0040 });
        assert!(!sim.host.fault_pending());
    }

    #[test]
    fn test_context_switch_saves_previous() {
        let (sim, host) = host();
        let h = host.open(&[GR3D]).unwrap();
        let sp = host.counter_alloc().unwrap();
        let cs = host.counter_alloc().unwrap();
        let spec = || ContextSpec {
            module: GR3D,
            counter: cs,
            save: vec![incr_segment(&sim, cs, 3)],
            save_incrs: 3,
            restore: vec![noop_segment(&sim, 2)],
        };
        let a = host.context_register(spec()).unwrap();
        let b = host.context_register(spec()).unwrap();

        let work = [incr_segment(&sim, sp, 1)];
        let first = Submission::new(&work, sp, CounterTarget::Increment(1)).context(a);
        host.submit(&h, &first).unwrap();
        assert_eq!(host.counter_read_max(cs).unwrap(), 0);
        assert_eq!(host.contexts.active(GR3D), Some(a));

        let second = Submission::new(&work, sp, CounterTarget::Increment(1)).context(b);
        let fence = host.submit(&h, &second).unwrap();
        assert_eq!(host.counter_read_max(cs).unwrap(), 3);
        host.fence_wait(fence, LONG).unwrap();
        assert!(h.channel().wait_idle(LONG));

        assert_eq!(host.counter_read(cs).unwrap(), 3);
        assert_eq!(host.contexts.state(a), Some(ContextState::Inactive));
        assert_eq!(host.contexts.active(GR3D), Some(b));
        assert_eq!(host.contexts.refs(b), 0);

        let saved = host.prepare_for_powerdown(&h, GR3D).unwrap();
        assert_eq!(saved, Fence::new(cs, 6));
        host.fence_wait(saved, LONG).unwrap();
        assert!(h.channel().wait_idle(LONG));
        assert_eq!(host.contexts.state(b), Some(ContextState::Inactive));
        assert_eq!(host.contexts.active(GR3D), None);
        assert_eq!(host.prepare_for_powerdown(&h, GR3D), Err(HostError::NotInitialized));

        host.context_free(a).unwrap();
        assert_eq!(host.contexts.state(a), Some(ContextState::Freed));
        host.close(h);
    }

    #[test]
    fn test_context_must_belong_to_channel() {
        let (sim, host) = host();
        let h = host.open(&[GR2D]).unwrap();
        let cs = host.counter_alloc().unwrap();
        let ctx = host
            .context_register(ContextSpec {
                module: GR3D,
                counter: cs,
                save: vec![incr_segment(&sim, cs, 2)],
                save_incrs: 2,
                restore: vec![],
            })
            .unwrap();
        let work = [noop_segment(&sim, 1)];
        let sub = Submission::new(&work, cs, CounterTarget::Increment(0)).context(ctx);
        assert!(matches!(host.submit(&h, &sub), Err(HostError::InvalidArgument(_))));
        host.close(h);
    }

    #[test]
    fn test_idle_module_powers_down() {
        let (sim, host) = host();
        let h = host.open(&[GR2D]).unwrap();
        let sp = host.counter_alloc().unwrap();
        let segs = [incr_segment(&sim, sp, 1)];
        let fence = host
            .submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(1)))
            .unwrap();
        assert!(sim.power.clock_on(GR2D));
        host.fence_wait(fence, LONG).unwrap();

        sim.clock.advance(60);
        host.acm.kick();
        assert!(wait_for(|| !sim.power.clock_on(GR2D)));
        assert_eq!(host.power_stats().module_off, 1);
        host.close(h);
    }

    #[test]
    fn test_slow_host_clock_stretches_timeout() {
        let sim = SimBackend::with_host_khz(41_500);
        let host = Host::new(config(), device_for(&sim)).unwrap();
        assert_eq!(host.power_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn test_suspend_resume_after_state_loss() {
        let (sim, host) = host();
        let h = host.open(&[GR2D]).unwrap();
        let sp = host.counter_alloc().unwrap();
        let segs = [incr_segment(&sim, sp, 2)];
        let fence = host
            .submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(2)))
            .unwrap();
        host.fence_wait(fence, LONG).unwrap();
        assert!(h.channel().wait_idle(LONG));

        host.suspend().unwrap();
        assert!(!sim.power.clock_on(GR2D));
        let refused = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(2)));
        assert!(matches!(refused, Err(HostError::InvalidState(_))));

        sim.host.power_cycle();
        sim.power.set_wake_event(WakeEvent::Lp0);
        host.resume().unwrap();
        assert_eq!(sim.host.counter_value(sp), 2);
        assert!(sim.host.interrupts_configured());

        let fence = host
            .submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(2)))
            .unwrap();
        assert_eq!(fence.value, 4);
        host.fence_wait(fence, LONG).unwrap();
        assert!(h.channel().wait_idle(LONG));
        host.close(h);
    }

    #[test]
    fn test_resume_without_state_loss_restores_modules() {
        let (sim, host) = host();
        let h = host.open(&[GR2D]).unwrap();
        let sp = host.counter_alloc().unwrap();
        let segs = [incr_segment(&sim, sp, 1)];
        let fence = host
            .submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(1)))
            .unwrap();
        host.fence_wait(fence, LONG).unwrap();
        assert!(h.channel().wait_idle(LONG));
        assert!(sim.power.clock_on(GR2D));
        assert!(host.resume().is_err());

        host.suspend().unwrap();
        assert!(host.suspend().is_err());
        assert!(!sim.power.clock_on(GR2D));
        sim.power.set_wake_event(WakeEvent::None);
        host.resume().unwrap();

        assert_eq!(host.counter_read(sp).unwrap(), 1);
        assert_eq!(host.counter_read_max(sp).unwrap(), 1);
        assert!(sim.power.clock_on(GR2D));
        assert!(sim.power.voltage_on(GR2D));
        assert!(!sim.power.clock_on(GR3D));
        assert!(host.acm.is_busy());
        host.close(h);
    }

    #[test]
    fn test_abort_completes_discarded_work() {
        let (sim, host) = host();
        let h = host.open(&[GR2D]).unwrap();
        let sp = host.counter_alloc().unwrap();
        sim.host.set_paused(true);
        let segs = [incr_segment(&sim, sp, 2)];
        let fence = host
            .submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(2)))
            .unwrap();
        assert!(sim.mem.pin_count(segs[0].mem) > 0);

        host.abort_channel(&h);
        assert_eq!(host.counter_read(sp).unwrap(), fence.value);
        assert_eq!(sim.mem.pin_count(segs[0].mem), 0);
        assert!(h.channel().is_idle());
        host.fence_wait(fence, LONG).unwrap();
    }

    #[test]
    fn test_shutdown_flushes_and_unhooks() {
        let (sim, host) = host();
        let h = host.open(&[GR2D]).unwrap();
        let sp = host.counter_alloc().unwrap();
        sim.host.set_paused(true);
        let segs = [incr_segment(&sim, sp, 1)];
        let fence = host
            .submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(1)))
            .unwrap();

        host.shutdown();
        assert!(host.is_shutdown());
        assert_eq!(host.counter_read(sp).unwrap(), fence.value);
        assert!(!sim.host.has_irq_handler(IrqLine::Syncpt));
        assert!(!sim.host.has_irq_handler(IrqLine::General));
        assert!(!sim.power.clock_on(GR2D));

        let again = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(1)));
        assert_eq!(again.unwrap_err(), HostError::ShuttingDown);
        assert!(matches!(host.open(&[GR2D]), Err(HostError::ShuttingDown)));
        host.shutdown();
    }

    #[test]
    fn test_shutdown_with_submitter_blocked_on_full_ring() {
        let (sim, dev) = sim_device();
        let host = Arc::new(Host::new(config().pushbuffer_size(64), dev).unwrap());
        let h = Arc::new(host.open(&[GR2D]).unwrap());
        let sp = host.counter_alloc().unwrap();
        let seg = incr_segment(&sim, sp, 1);
        sim.host.set_paused(true);
        for _ in 0..7 {
            host.submit(&h, &Submission::new(&[seg], sp, CounterTarget::Increment(1)))
                .unwrap();
        }
        assert_eq!(h.channel().in_flight(), 7);

        let (tx, rx) = std::sync::mpsc::channel();
        let submitter = {
            let (host, h, tx) = (host.clone(), h.clone(), tx.clone());
            thread::spawn(move || {
                let r = host.submit(&h, &Submission::new(&[seg], sp, CounterTarget::Increment(1)));
                tx.send("submit").unwrap();
                r
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!submitter.is_finished());

        let stopper = {
            let host = host.clone();
            thread::spawn(move || {
                host.shutdown();
                tx.send("shutdown").unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        sim.host.set_paused(false);

        let mut finished = Vec::new();
        while finished.len() < 2 {
            match rx.recv_timeout(LONG) {
                Ok(who) => finished.push(who),
                Err(_) => panic!("shutdown deadlocked, finished: {:?}", finished),
            }
        }
        let fence = submitter.join().unwrap().unwrap();
        stopper.join().unwrap();
        assert_eq!(fence.value, 8);
        assert!(host.is_shutdown());
        assert_eq!(host.counter_read(sp).unwrap(), 8);
        assert!(h.channel().is_idle());
    }

    #[test]
    fn test_timed_out_wait_does_not_outlive_counter() {
        let (sim, host) = host();
        let sp = host.counter_alloc().unwrap();
        let err = host.fence_wait(Fence::new(sp, 5), Duration::from_millis(10));
        assert!(matches!(err, Err(HostError::Timeout { .. })));
        assert_eq!(host.waitlist_stats().pending, 1);

        host.counter_free(sp);
        assert_eq!(host.counter_alloc().unwrap(), sp);
        assert_eq!(host.waitlist_stats().pending, 0);
        assert_eq!(host.counter_read(sp).unwrap(), 0);

        let h = host.open(&[GR2D]).unwrap();
        let segs = [incr_segment(&sim, sp, 5)];
        let fence = host
            .submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(5)))
            .unwrap();
        assert_eq!(fence.value, 5);
        host.fence_wait(fence, LONG).unwrap();
        assert!(h.channel().wait_idle(LONG));
        host.close(h);
    }

    #[test]
    fn test_oversized_submission_rejected() {
        let (sim, dev) = sim_device();
        let host = Host::new(config().pushbuffer_size(64), dev).unwrap();
        let h = host.open(&[GR2D]).unwrap();
        let sp = host.counter_alloc().unwrap();
        let segs: Vec<Segment> = (0..8).map(|_| noop_segment(&sim, 1)).collect();
        let sub = Submission::new(&segs, sp, CounterTarget::Increment(0));
        assert!(matches!(host.submit(&h, &sub), Err(HostError::InvalidArgument(_))));
        for s in &segs {
            assert_eq!(sim.mem.pin_count(s.mem), 0);
        }

        let fence = host
            .submit(&h, &Submission::new(&segs[..7], sp, CounterTarget::Increment(0)))
            .unwrap();
        host.fence_wait(fence, LONG).unwrap();
        assert!(h.channel().wait_idle(LONG));
        host.close(h);
    }

    #[test]
    fn test_concurrent_submitters_on_one_channel() {
        let (sim, host) = host();
        let host = Arc::new(host);
        let h = Arc::new(host.open(&[GR2D]).unwrap());
        let sp = host.counter_alloc().unwrap();
        let segs: Vec<Segment> = (0..4).map(|_| incr_segment(&sim, sp, 1)).collect();

        let mut threads = Vec::new();
        for _ in 0..4 {
            let (host, h, segs) = (host.clone(), h.clone(), segs.clone());
            threads.push(thread::spawn(move || {
                for _ in 0..25 {
                    let sub = Submission::new(&segs, sp, CounterTarget::Increment(4));
                    host.submit(&h, &sub).unwrap();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        let fence = Fence::new(sp, host.counter_read_max(sp).unwrap());
        assert_eq!(fence.value, 400);
        host.fence_wait(fence, LONG).unwrap();
        assert!(h.channel().wait_idle(LONG));
        assert_eq!(host.channel_stats(&h).submits, 100);
    }
}
