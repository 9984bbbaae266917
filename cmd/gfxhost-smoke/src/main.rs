//! gfxhost End-to-End Smoke Test
//!
//! Drives a full `Host` against the simulated accelerator:
//!   Part A: channels, counters and fences
//!   Part B: push-buffer backpressure and concurrent submitters
//!   Part C: context switching
//!   Part D: module registers, mutexes and bus faults
//!   Part E: power scheduling, suspend and resume
//!   Part F: abort and shutdown
//!
//! Run: ./target/release/gfxhost-smoke
//! (GFXHOST_LOG_LEVEL=debug for driver logs)

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use gfxhost::opcode::{self, COND_IMMEDIATE};
use gfxhost::sim::{self, MlockOwner, SimBackend};
use gfxhost::{
    reserved, ContextSpec, CounterId, CounterTarget, FaultKind, Fence, Host, HostConfig,
    HostError, HostResult, IrqLine, ModuleId, ModuleKind, Segment, Semaphore, Submission, WakeEvent,
};

const GR2D: ModuleId = ModuleId::new(ModuleKind::Gr2d, 0);
const GR3D: ModuleId = ModuleId::new(ModuleKind::Gr3d, 0);
const DISP: ModuleId = ModuleId::new(ModuleKind::Display, 0);
const DSI: ModuleId = ModuleId::new(ModuleKind::Dsi, 0);
const LONG: Duration = Duration::from_secs(2);

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    /// Run one part; an error aborts the rest of it.
    fn part(&mut self, name: &str, f: impl FnOnce(&mut Self) -> HostResult<()>) {
        self.section(name);
        if let Err(e) = f(self) {
            self.fail("part aborted", &e.to_string());
        }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn config() -> HostConfig {
    HostConfig::from_env().acm_timeout(Duration::from_millis(50))
}

fn start(config: HostConfig) -> HostResult<(SimBackend, Host)> {
    let sim = SimBackend::new();
    let host = Host::new(config, sim::device(&sim))?;
    Ok((sim, host))
}

/// Segment of `n` words, each incrementing `id` once
fn incr_segment(sim: &SimBackend, id: CounterId, n: u32) -> HostResult<Segment> {
    let words = vec![opcode::incr_syncpt(COND_IMMEDIATE, id.as_u32()); n as usize];
    Ok(Segment::new(sim.mem.alloc_words(&words)?, 0, n))
}

fn noop_segment(sim: &SimBackend, n: u32) -> HostResult<Segment> {
    let words = vec![opcode::NOOP; n as usize];
    Ok(Segment::new(sim.mem.alloc_words(&words)?, 0, n))
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

// ════════════════════════════════════════════════════════════
// Part A: channels, counters, fences
// ════════════════════════════════════════════════════════════

fn test_submit(t: &mut TestRunner) -> HostResult<()> {
    let (sim, host) = start(config())?;

    let h = host.open(&[GR2D, DISP])?;
    t.check("open(gr2d, display) -> display channel", h.id().as_u32() == 0,
        &format!("got {}", h.id()));
    let g = host.open(&[GR3D])?;
    t.check("open(gr3d) -> gr3d channel", g.id().as_u32() == 2, &format!("got {}", g.id()));
    t.check("open(host) rejected",
        matches!(host.open(&[ModuleId::HOST]), Err(HostError::InvalidArgument(_))), "accepted");
    host.close(g);

    let sp = host.counter_alloc()?;
    t.check("counter_alloc skips reserved", sp.as_u32() == 6, &format!("got {}", sp));
    host.counter_incr(sp)?;
    host.counter_incr(sp)?;

    let segs = [incr_segment(&sim, sp, 1)?, incr_segment(&sim, sp, 1)?, incr_segment(&sim, sp, 1)?];
    let fence = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Value(5)))?;
    t.check("submit Value(5) -> fence 5", fence == Fence::new(sp, 5), &format!("{:?}", fence));
    host.fence_wait(fence, LONG)?;
    t.pass("fence_wait");
    t.check("channel drains", h.channel().wait_idle(LONG), "still busy");
    t.check("command buffers unpinned",
        segs.iter().all(|s| sim.mem.pin_count(s.mem) == 0), "pins leaked");

    let behind = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Value(1)));
    t.check("target behind shadow rejected",
        matches!(behind, Err(HostError::InvalidArgument(_))), &format!("{:?}", behind));

    let sub = Submission::new(&segs, sp, CounterTarget::Increment(3)).null_kickoff(true);
    let fence = host.submit(&h, &sub)?;
    host.fence_wait(fence, LONG)?;
    t.check("null kickoff completes from cpu", host.counter_read(sp)? == 8,
        &format!("counter {}", host.counter_read(sp)?));

    let other = host.counter_alloc()?;
    let timed_out = host.fence_wait(Fence::new(other, 1), Duration::from_millis(20));
    t.check("fence_wait times out",
        matches!(timed_out, Err(HostError::Timeout { .. })), &format!("{:?}", timed_out));

    let sem = gfxhost::new_semaphore();
    let pending = !host.signal_semaphore(other, 1, sem.clone())?;
    sim.host.advance_counter(other, 1);
    t.check("semaphore signalled at threshold", pending && sem.wait(Some(LONG)), "not signalled");

    host.close(h);
    Ok(())
}

// ════════════════════════════════════════════════════════════
// Part B: backpressure
// ════════════════════════════════════════════════════════════

fn test_backpressure(t: &mut TestRunner) -> HostResult<()> {
    // 64 bytes -> 7 usable slots
    let (sim, host) = start(config().pushbuffer_size(64))?;
    let h = host.open(&[GR2D])?;
    let sp = host.counter_alloc()?;

    let big: Vec<Segment> = (0..8).map(|_| noop_segment(&sim, 1)).collect::<HostResult<_>>()?;
    let oversized = host.submit(&h, &Submission::new(&big, sp, CounterTarget::Increment(0)));
    t.check("oversized submission rejected",
        matches!(oversized, Err(HostError::InvalidArgument(_))), &format!("{:?}", oversized));

    sim.host.set_paused(true);
    let first: Vec<Segment> = (0..5).map(|_| incr_segment(&sim, sp, 1)).collect::<HostResult<_>>()?;
    let second: Vec<Segment> = (0..4).map(|_| incr_segment(&sim, sp, 1)).collect::<HostResult<_>>()?;
    host.submit(&h, &Submission::new(&first, sp, CounterTarget::Increment(5)))?;

    let done = AtomicBool::new(false);
    let result = thread::scope(|s| {
        let waiter = s.spawn(|| {
            let r = host.submit(&h, &Submission::new(&second, sp, CounterTarget::Increment(4)));
            done.store(true, Ordering::Release);
            r
        });
        thread::sleep(Duration::from_millis(30));
        let blocked = !done.load(Ordering::Acquire);
        sim.host.set_paused(false);
        (blocked, waiter.join())
    });
    let (blocked, joined) = result;
    t.check("submit blocks on full push buffer", blocked, "did not block");
    let fence = match joined {
        Ok(r) => r?,
        Err(_) => return Err(HostError::InvalidState("submitter panicked")),
    };
    host.fence_wait(fence, LONG)?;
    t.check("blocked submit completes", fence.value == 9, &format!("{:?}", fence));

    let segs: Vec<Segment> = (0..4).map(|_| incr_segment(&sim, sp, 1)).collect::<HostResult<_>>()?;
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..25 {
                    let _ = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(4)));
                }
            });
        }
    });
    let max = host.counter_read_max(sp)?;
    host.fence_wait(Fence::new(sp, max), LONG)?;
    t.check("4 submitters x 25 -> 409", max == 409, &format!("max {}", max));
    t.check("channel drains", h.channel().wait_idle(LONG), "still busy");

    host.close(h);
    Ok(())
}

// ════════════════════════════════════════════════════════════
// Part C: contexts
// ════════════════════════════════════════════════════════════

fn test_contexts(t: &mut TestRunner) -> HostResult<()> {
    let (sim, host) = start(config())?;
    let h = host.open(&[GR3D])?;
    let sp = host.counter_alloc()?;
    let cs = host.counter_alloc()?;

    let mut ctxs = Vec::new();
    for _ in 0..2 {
        ctxs.push(host.context_register(ContextSpec {
            module: GR3D,
            counter: cs,
            save: vec![incr_segment(&sim, cs, 3)?],
            save_incrs: 3,
            restore: vec![noop_segment(&sim, 2)?],
        })?);
    }

    let work = [incr_segment(&sim, sp, 1)?];
    host.submit(&h, &Submission::new(&work, sp, CounterTarget::Increment(1)).context(ctxs[0]))?;
    t.check("first context: no save", host.counter_read_max(cs)? == 0, "save inserted");

    let fence = host.submit(&h, &Submission::new(&work, sp, CounterTarget::Increment(1)).context(ctxs[1]))?;
    host.fence_wait(fence, LONG)?;
    t.check("switch saves previous context", host.counter_read(cs)? == 3,
        &format!("save counter {}", host.counter_read(cs)?));

    let saved = host.prepare_for_powerdown(&h, GR3D)?;
    host.fence_wait(saved, LONG)?;
    t.check("powerdown save fence", saved == Fence::new(cs, 6), &format!("{:?}", saved));
    t.check("no active context left",
        host.prepare_for_powerdown(&h, GR3D) == Err(HostError::NotInitialized), "still active");

    h.channel().wait_idle(LONG);
    for ctx in ctxs {
        host.context_free(ctx)?;
    }
    t.pass("context_free");
    host.close(h);
    Ok(())
}

// ════════════════════════════════════════════════════════════
// Part D: module registers, mutexes, faults
// ════════════════════════════════════════════════════════════

fn test_modules(t: &mut TestRunner) -> HostResult<()> {
    let (sim, host) = start(config())?;

    host.write_module_regs(GR2D, &[0x40, 0x48], &[0xabc, 0xdef])?;
    let mut values = [0u32; 2];
    host.read_module_regs(GR2D, &[0x48, 0x40], &mut values)?;
    t.check(&format!("{:?} register round trip", host.register_path()),
        values == [0xdef, 0xabc], &format!("{:x?}", values));

    t.check("display counter", host.module_counter(DISP, 0)? == reserved::DISP0, "wrong id");
    t.check("gr2d has no module counter",
        host.module_counter(GR2D, 0) == Err(HostError::NotSupported), "mapped");

    let m = host.module_mutex(DSI, 0)?;
    host.mlock_lock(m)?;
    let held = sim.host.mlock_owner(m as usize) == MlockOwner::Cpu;
    host.mlock_unlock(m)?;
    t.check("dsi mlock lock/unlock",
        held && sim.host.mlock_owner(m as usize) == MlockOwner::Free, "owner mismatch");

    sim.host.inject_bus_fault(FaultKind::Write, 0x5400_0040);
    t.check("bus fault logged", wait_for(|| host.fault_count() == 1),
        &format!("{} faults", host.fault_count()));
    Ok(())
}

// ════════════════════════════════════════════════════════════
// Part E: power
// ════════════════════════════════════════════════════════════

fn test_power(t: &mut TestRunner) -> HostResult<()> {
    let (sim, host) = start(config())?;
    let h = host.open(&[GR2D])?;
    let sp = host.counter_alloc()?;
    let segs = [incr_segment(&sim, sp, 2)?];

    let fence = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(2)))?;
    t.check("busy module clocked", sim.power.clock_on(GR2D), "clock off");
    host.fence_wait(fence, LONG)?;
    sim.clock.advance(60);
    t.check("idle module powers down", wait_for(|| !sim.power.clock_on(GR2D)), "clock on");

    h.channel().wait_idle(LONG);
    host.suspend()?;
    let refused = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(2)));
    t.check("submit refused while suspended",
        matches!(refused, Err(HostError::InvalidState(_))), &format!("{:?}", refused));

    sim.host.power_cycle();
    sim.power.set_wake_event(WakeEvent::Lp0);
    host.resume()?;
    t.check("counters restored after state loss", sim.host.counter_value(sp) == 2,
        &format!("counter {}", sim.host.counter_value(sp)));

    let fence = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(2)))?;
    host.fence_wait(fence, LONG)?;
    t.check("submit after resume", fence.value == 4, &format!("{:?}", fence));

    let stats = host.power_stats();
    println!("       power: {} on / {} off", stats.module_on, stats.module_off);
    host.close(h);
    Ok(())
}

// ════════════════════════════════════════════════════════════
// Part F: abort, shutdown
// ════════════════════════════════════════════════════════════

fn test_teardown(t: &mut TestRunner) -> HostResult<()> {
    let (sim, host) = start(config())?;
    let h = host.open(&[GR2D])?;
    let sp = host.counter_alloc()?;
    let segs = [incr_segment(&sim, sp, 2)?];

    sim.host.set_paused(true);
    let fence = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(2)))?;
    host.abort_channel(&h);
    t.check("abort completes counter", host.counter_read(sp)? == fence.value,
        &format!("counter {}", host.counter_read(sp)?));
    t.check("abort unpins", sim.mem.pin_count(segs[0].mem) == 0, "pinned");

    let fence = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(2)))?;
    host.shutdown();
    t.check("shutdown completes pending work", host.counter_read(sp)? == fence.value,
        &format!("counter {}", host.counter_read(sp)?));
    t.check("shutdown unhooks interrupts",
        !sim.host.has_irq_handler(IrqLine::Syncpt) && !sim.host.has_irq_handler(IrqLine::General),
        "handler still registered");
    let again = host.submit(&h, &Submission::new(&segs, sp, CounterTarget::Increment(2)));
    t.check("submit after shutdown", again == Err(HostError::ShuttingDown), &format!("{:?}", again));
    Ok(())
}

// ════════════════════════════════════════════════════════════

fn main() {
    gfxhost::init_logging();
    println!("=== gfxhost End-to-End Smoke Test ===");

    let mut t = TestRunner::new();
    t.part("Part A: channels, counters, fences", test_submit);
    t.part("Part B: push-buffer backpressure", test_backpressure);
    t.part("Part C: context switching", test_contexts);
    t.part("Part D: module registers, mutexes, faults", test_modules);
    t.part("Part E: power scheduling, suspend, resume", test_power);
    t.part("Part F: abort, shutdown", test_teardown);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
