//! `SimHost` - register-level model of the host.
//!
//! Covers what the channel manager drives:
//!
//! - per-channel fetch unit (DMASTART/PUT/GET/END/CTRL) walking the
//!   push buffer in `SimMemory`, following RESTART and executing
//!   gathers; `INCR_SYNCPT` method writes bump counters
//! - 32 counters with thresholds, the 2-bit-per-counter interrupt
//!   mask, the CPU0 status latch and CPU increments
//! - mlocks with CPU/channel ownership
//! - the indirect module register port and direct module windows
//! - bus-timeout faults on the general interrupt line
//!
//! Every register access made while the host clock is off (according
//! to `SimPower`) is counted as a clock violation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use gfxhost_core::constants::{MAX_CHANNELS, NB_COUNTERS, NB_MLOCKS, NB_WAIT_BASES};
use gfxhost_core::error::{FaultKind, HostResult};
use gfxhost_core::opcode::{self, Descriptor};
use gfxhost_core::regs::{self, channel as chreg, dmactrl, indoff, sync};
use gfxhost_core::traits::{IrqController, IrqHandler, IrqLine, Mmio, ModuleAperture};
use gfxhost_core::{kdebug, reached, CounterId, ModuleId};

use super::irq::IrqThread;
use super::memory::SimMemory;
use super::power::SimPower;

/// Physical base of the module windows behind the host (fault addresses)
pub const MODULE_APERTURE_PHYS: u32 = 0x5400_0000;
const MODULE_STRIDE: u32 = 0x4_0000;

/// Depth of the per-channel descriptor logs
const LOG_DEPTH: usize = 4096;

/// Cap on descriptors walked per DMAPUT write
const FETCH_LIMIT: usize = 1 << 16;

/// Indirect write fifo depth reported in FIFOSTAT
const WRITE_FIFO_DEPTH: u32 = 32;

/// Who holds a module mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MlockOwner {
    #[default]
    Free,
    Cpu,
    Channel(u32),
}

#[derive(Default)]
struct SimChannel {
    dmastart: u32,
    dmaput: u32,
    dmaget: u32,
    dmaend: u32,
    dmactrl: u32,
    class: u32,
    fetched: VecDeque<Descriptor>,
    executed: VecDeque<Descriptor>,
    pending: VecDeque<Descriptor>,
    restarts: u64,
    faults: u64,
}

impl SimChannel {
    fn running(&self) -> bool {
        self.dmactrl & dmactrl::DMASTOP == 0
    }
}

#[derive(Default)]
struct IndirectPort {
    modid: u32,
    offset: u32,
    autoinc: bool,
    read_fifo: VecDeque<u32>,
}

struct SimState {
    syncpt: [u32; NB_COUNTERS],
    thresh: [u32; NB_COUNTERS],
    base: [u32; NB_WAIT_BASES],
    int_mask: [u32; 2],
    thresh_status: u32,
    intmask: u32,
    intc0mask: u32,
    hintmask: u32,
    hintmask_ext: u32,
    hintstatus: u32,
    hintstatus_ext: u32,
    read_timeout_addr: u32,
    write_timeout_addr: u32,
    ip_busy_timeout: u32,
    usec_clk: u32,
    mlocks: [MlockOwner; NB_MLOCKS],
    channels: Vec<SimChannel>,
    /// (bus module id, word offset) -> value; survives power cycles
    modules: HashMap<(u32, u32), u32>,
    unresponsive: HashSet<u32>,
    port: IndirectPort,
    paused: bool,
}

impl SimState {
    fn new() -> Self {
        Self {
            syncpt: [0; NB_COUNTERS],
            thresh: [0; NB_COUNTERS],
            base: [0; NB_WAIT_BASES],
            int_mask: [0; 2],
            thresh_status: 0,
            intmask: 0,
            intc0mask: 0,
            hintmask: 0,
            hintmask_ext: 0,
            hintstatus: 0,
            hintstatus_ext: 0,
            read_timeout_addr: 0,
            write_timeout_addr: 0,
            ip_busy_timeout: 0,
            usec_clk: 0,
            mlocks: [MlockOwner::Free; NB_MLOCKS],
            channels: (0..MAX_CHANNELS).map(|_| SimChannel::default()).collect(),
            modules: HashMap::new(),
            unresponsive: HashSet::new(),
            port: IndirectPort::default(),
            paused: false,
        }
    }

    fn int_enabled(&self, id: usize) -> bool {
        self.int_mask[id / 16] & (1 << ((id % 16) * 2)) != 0
    }

    /// Latch reached thresholds; true if the syncpt line should fire.
    fn evaluate(&mut self) -> bool {
        let mut enabled = 0u32;
        for id in 0..NB_COUNTERS {
            if self.int_enabled(id) {
                enabled |= 1 << id;
                if reached(self.syncpt[id], self.thresh[id]) {
                    self.thresh_status |= 1 << id;
                }
            }
        }
        self.thresh_status & enabled != 0
    }

    fn latch_fault(&mut self, kind: FaultKind, addr: u32) {
        match kind {
            FaultKind::Read => {
                self.hintstatus_ext |= sync::EXT_IP_READ_INT;
                self.read_timeout_addr = addr;
            }
            FaultKind::Write => {
                self.hintstatus_ext |= sync::EXT_IP_WRITE_INT;
                self.write_timeout_addr = addr;
            }
        }
        self.hintstatus |= sync::HINTSTATUS_EXT_PENDING;
    }

    /// Module register read; `Err` carries the faulting address.
    fn module_read(&mut self, modid: u32, word: u32) -> Result<u32, u32> {
        if self.unresponsive.contains(&modid) {
            return Err(MODULE_APERTURE_PHYS + modid * MODULE_STRIDE + word * 4);
        }
        Ok(self.modules.get(&(modid, word)).copied().unwrap_or(0))
    }

    fn module_write(&mut self, modid: u32, word: u32, value: u32) -> Result<(), u32> {
        if self.unresponsive.contains(&modid) {
            return Err(MODULE_APERTURE_PHYS + modid * MODULE_STRIDE + word * 4);
        }
        self.modules.insert((modid, word), value);
        Ok(())
    }

    fn method(&mut self, offset: u32, value: u32) {
        if offset == opcode::METHOD_INCR_SYNCPT {
            let id = (value & 0xff) as usize;
            if id < NB_COUNTERS {
                self.syncpt[id] = self.syncpt[id].wrapping_add(1);
            }
        }
    }

    /// Run one command stream; returns false if it could not be read.
    fn run_stream(&mut self, ch: usize, d: Descriptor, mem: &SimMemory) -> bool {
        if opcode::opcode_of(d.op) != opcode::OP_GATHER {
            return true;
        }
        let count = d.op & opcode::GATHER_MAX_WORDS;
        let Some(data) = mem.read_phys_range(d.addr, count) else {
            return false;
        };

        if d.op & (1 << 15) != 0 {
            let offset = (d.op >> 16) & 0xfff;
            let incr = d.op & (1 << 14) != 0;
            for (i, w) in data.iter().enumerate() {
                self.method(if incr { offset + i as u32 } else { offset }, *w);
            }
            return true;
        }

        let mut i = 0;
        let next = |i: &mut usize| -> Option<u32> {
            let w = data.get(*i).copied();
            *i += 1;
            w
        };
        while let Some(w) = next(&mut i) {
            let offset = (w >> 16) & 0xfff;
            match opcode::opcode_of(w) {
                opcode::OP_SETCLASS => {
                    self.channels[ch].class = (w >> 6) & 0x3ff;
                    for bit in 0..6 {
                        if w & (1 << bit) != 0 {
                            let Some(v) = next(&mut i) else { break };
                            self.method(offset + bit, v);
                        }
                    }
                }
                opcode::OP_INCR | opcode::OP_NONINCR => {
                    let step = opcode::opcode_of(w) == opcode::OP_INCR;
                    for k in 0..(w & 0xffff) {
                        let Some(v) = next(&mut i) else { break };
                        self.method(if step { offset + k } else { offset }, v);
                    }
                }
                opcode::OP_MASK => {
                    for bit in 0..16 {
                        if w & (1 << bit) != 0 {
                            let Some(v) = next(&mut i) else { break };
                            self.method(offset + bit, v);
                        }
                    }
                }
                opcode::OP_IMM => self.method(offset, w & 0xffff),
                _ => {}
            }
        }
        true
    }

    /// Execute up to `max` fetched descriptors on `ch`.
    fn execute(&mut self, ch: usize, max: usize, mem: &SimMemory) -> usize {
        let mut done = 0;
        while done < max {
            let Some(d) = self.channels[ch].pending.pop_front() else {
                break;
            };
            if !self.run_stream(ch, d, mem) {
                self.channels[ch].faults += 1;
            }
            push_log(&mut self.channels[ch].executed, d);
            done += 1;
        }
        done
    }

    /// Walk GET towards PUT, queueing descriptors.
    fn fetch(&mut self, ch: usize, mem: &SimMemory) {
        let c = &mut self.channels[ch];
        let mut walked = 0;
        while c.running() && c.dmaget != c.dmaput && walked < FETCH_LIMIT {
            walked += 1;
            let Some(op) = mem.read_phys(c.dmaget) else {
                kdebug!(target: "sim", "ch{} fetch from unmapped 0x{:08x}", ch, c.dmaget);
                c.faults += 1;
                c.dmactrl |= dmactrl::DMASTOP;
                break;
            };
            if opcode::opcode_of(op) == opcode::OP_RESTART {
                c.dmaget = (op & 0x0fff_ffff) << 4;
                c.restarts += 1;
                continue;
            }
            let addr = mem.read_phys(c.dmaget + 4).unwrap_or(0);
            let d = Descriptor { op, addr };
            push_log(&mut c.fetched, d);
            c.pending.push_back(d);
            c.dmaget = c.dmaget.wrapping_add(Descriptor::BYTES);
        }
        if !self.paused {
            self.execute(ch, usize::MAX, mem);
        }
    }
}

fn push_log(log: &mut VecDeque<Descriptor>, d: Descriptor) {
    if log.len() == LOG_DEPTH {
        log.pop_front();
    }
    log.push_back(d);
}

pub struct SimHost {
    state: Mutex<SimState>,
    mem: Arc<SimMemory>,
    power: Arc<SimPower>,
    irq: IrqThread,
    clock_violations: AtomicU64,
}

impl SimHost {
    pub fn new(mem: Arc<SimMemory>, power: Arc<SimPower>) -> Self {
        Self {
            state: Mutex::new(SimState::new()),
            mem,
            power,
            irq: IrqThread::spawn(),
            clock_violations: AtomicU64::new(0),
        }
    }

    fn check_clock(&self) {
        if !self.power.clock_on(ModuleId::HOST) {
            self.clock_violations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Register accesses made while the host clock was gated
    pub fn clock_violations(&self) -> u64 {
        self.clock_violations.load(Ordering::Relaxed)
    }

    // --- counters -------------------------------------------------------

    pub fn counter_value(&self, id: CounterId) -> u32 {
        self.state.lock().unwrap().syncpt[id.as_usize()]
    }

    /// Engine-side increments not driven by a command stream
    pub fn advance_counter(&self, id: CounterId, n: u32) {
        let mut st = self.state.lock().unwrap();
        st.syncpt[id.as_usize()] = st.syncpt[id.as_usize()].wrapping_add(n);
        if st.evaluate() {
            self.irq.shared().raise(IrqLine::Syncpt);
        }
    }

    pub fn threshold(&self, id: CounterId) -> u32 {
        self.state.lock().unwrap().thresh[id.as_usize()]
    }

    pub fn threshold_irq_enabled(&self, id: CounterId) -> bool {
        self.state.lock().unwrap().int_enabled(id.as_usize())
    }

    pub fn wait_base(&self, index: usize) -> u32 {
        self.state.lock().unwrap().base[index]
    }

    pub fn usec_clk(&self) -> u32 {
        self.state.lock().unwrap().usec_clk
    }

    pub fn interrupts_configured(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.intmask & sync::INTMASK_CPU0_ALL != 0 && st.hintmask_ext != 0
    }

    // --- fetch unit -----------------------------------------------------

    /// Hold fetched descriptors instead of executing them.
    pub fn set_paused(&self, paused: bool) {
        let mut st = self.state.lock().unwrap();
        st.paused = paused;
        if !paused {
            for ch in 0..MAX_CHANNELS {
                st.execute(ch, usize::MAX, &self.mem);
            }
            if st.evaluate() {
                self.irq.shared().raise(IrqLine::Syncpt);
            }
        }
    }

    /// Execute up to `max` held descriptors on `ch`.
    pub fn run_pending(&self, ch: u32, max: usize) -> usize {
        let mut st = self.state.lock().unwrap();
        let n = st.execute(ch as usize, max, &self.mem);
        if st.evaluate() {
            self.irq.shared().raise(IrqLine::Syncpt);
        }
        n
    }

    pub fn pending(&self, ch: u32) -> usize {
        self.state.lock().unwrap().channels[ch as usize].pending.len()
    }

    pub fn fetched(&self, ch: u32) -> Vec<Descriptor> {
        self.state.lock().unwrap().channels[ch as usize].fetched.iter().copied().collect()
    }

    pub fn executed(&self, ch: u32) -> Vec<Descriptor> {
        self.state.lock().unwrap().channels[ch as usize].executed.iter().copied().collect()
    }

    pub fn dma_get(&self, ch: u32) -> u32 {
        self.state.lock().unwrap().channels[ch as usize].dmaget
    }

    pub fn dma_put(&self, ch: u32) -> u32 {
        self.state.lock().unwrap().channels[ch as usize].dmaput
    }

    pub fn is_stopped(&self, ch: u32) -> bool {
        !self.state.lock().unwrap().channels[ch as usize].running()
    }

    pub fn restarts(&self, ch: u32) -> u64 {
        self.state.lock().unwrap().channels[ch as usize].restarts
    }

    pub fn fetch_faults(&self, ch: u32) -> u64 {
        self.state.lock().unwrap().channels[ch as usize].faults
    }

    /// Class last selected on `ch`
    pub fn class(&self, ch: u32) -> u32 {
        self.state.lock().unwrap().channels[ch as usize].class
    }

    // --- mlocks ---------------------------------------------------------

    pub fn mlock_owner(&self, index: usize) -> MlockOwner {
        self.state.lock().unwrap().mlocks[index]
    }

    /// Let a channel grab a module mutex, as a command stream would.
    pub fn channel_take_mlock(&self, index: usize, ch: u32) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.mlocks[index] != MlockOwner::Free {
            return false;
        }
        st.mlocks[index] = MlockOwner::Channel(ch);
        true
    }

    pub fn channel_release_mlock(&self, index: usize) {
        let mut st = self.state.lock().unwrap();
        if matches!(st.mlocks[index], MlockOwner::Channel(_)) {
            st.mlocks[index] = MlockOwner::Free;
        }
    }

    // --- modules and faults ---------------------------------------------

    pub fn module_reg(&self, module: ModuleId, offset: u32) -> u32 {
        let st = self.state.lock().unwrap();
        regs::bus_module_id(module)
            .and_then(|id| st.modules.get(&(id, offset >> 2)).copied())
            .unwrap_or(0)
    }

    pub fn set_module_reg(&self, module: ModuleId, offset: u32, value: u32) {
        if let Some(id) = regs::bus_module_id(module) {
            self.state.lock().unwrap().modules.insert((id, offset >> 2), value);
        }
    }

    /// Make accesses to `module` time out on the bus.
    pub fn set_unresponsive(&self, module: ModuleId, hung: bool) {
        let Some(id) = regs::bus_module_id(module) else { return };
        let mut st = self.state.lock().unwrap();
        if hung {
            st.unresponsive.insert(id);
        } else {
            st.unresponsive.remove(&id);
        }
    }

    pub fn inject_bus_fault(&self, kind: FaultKind, addr: u32) {
        self.state.lock().unwrap().latch_fault(kind, addr);
        self.irq.shared().raise(IrqLine::General);
    }

    pub fn fault_pending(&self) -> bool {
        self.state.lock().unwrap().hintstatus != 0
    }

    /// Drop every host register, as a deep sleep would. Module
    /// registers and memory are untouched.
    pub fn power_cycle(&self) {
        let mut st = self.state.lock().unwrap();
        let modules = std::mem::take(&mut st.modules);
        let unresponsive = std::mem::take(&mut st.unresponsive);
        *st = SimState::new();
        st.modules = modules;
        st.unresponsive = unresponsive;
    }

    pub fn has_irq_handler(&self, line: IrqLine) -> bool {
        self.irq.shared().has_handler(line)
    }

    // --- register decode ------------------------------------------------

    fn sync_read(&self, st: &mut SimState, rel: u32) -> u32 {
        match rel {
            sync::INTSTATUS => 0,
            sync::INTMASK => st.intmask,
            sync::INTC0MASK => st.intc0mask,
            sync::HINTSTATUS => st.hintstatus,
            sync::HINTMASK => st.hintmask,
            sync::HINTSTATUS_EXT => st.hintstatus_ext,
            sync::HINTMASK_EXT => st.hintmask_ext,
            sync::THRESH_CPU0_INT_STATUS => st.thresh_status,
            r if r == sync::THRESH_INT_MASK || r == sync::THRESH_INT_MASK + 4 => {
                st.int_mask[((r - sync::THRESH_INT_MASK) / 4) as usize]
            }
            sync::USEC_CLK => st.usec_clk,
            sync::IP_BUSY_TIMEOUT => st.ip_busy_timeout,
            sync::IP_READ_TIMEOUT_ADDR => st.read_timeout_addr,
            sync::IP_WRITE_TIMEOUT_ADDR => st.write_timeout_addr,
            r if (sync::MLOCK..sync::MLOCK + 4 * NB_MLOCKS as u32).contains(&r) => {
                let i = ((r - sync::MLOCK) / 4) as usize;
                if st.mlocks[i] == MlockOwner::Free {
                    st.mlocks[i] = MlockOwner::Cpu;
                    0
                } else {
                    1
                }
            }
            r if (sync::MLOCK_OWNER..sync::MLOCK_OWNER + 4 * NB_MLOCKS as u32).contains(&r) => {
                match st.mlocks[((r - sync::MLOCK_OWNER) / 4) as usize] {
                    MlockOwner::Free => 0,
                    MlockOwner::Cpu => sync::MLOCK_CPU_OWNS,
                    MlockOwner::Channel(c) => sync::MLOCK_CH_OWNS | (c << 8),
                }
            }
            r if (sync::CBSTAT..sync::CBSTAT + 4 * MAX_CHANNELS as u32).contains(&r) => {
                st.channels[((r - sync::CBSTAT) / 4) as usize].class << sync::CBSTAT_CLASS_SHIFT
            }
            r if (sync::SYNCPT..sync::SYNCPT + 4 * NB_COUNTERS as u32).contains(&r) => {
                st.syncpt[((r - sync::SYNCPT) / 4) as usize]
            }
            r if (sync::SYNCPT_INT_THRESH..sync::SYNCPT_INT_THRESH + 4 * NB_COUNTERS as u32)
                .contains(&r) =>
            {
                st.thresh[((r - sync::SYNCPT_INT_THRESH) / 4) as usize]
            }
            r if (sync::SYNCPT_BASE..sync::SYNCPT_BASE + 4 * NB_WAIT_BASES as u32).contains(&r) => {
                st.base[((r - sync::SYNCPT_BASE) / 4) as usize]
            }
            _ => 0,
        }
    }

    /// Returns the interrupt line to raise, if any.
    fn sync_write(&self, st: &mut SimState, rel: u32, v: u32) -> Option<IrqLine> {
        let mut recheck = false;
        match rel {
            sync::INTMASK => st.intmask = v,
            sync::INTC0MASK => st.intc0mask = v,
            sync::HINTSTATUS => st.hintstatus &= !v,
            sync::HINTMASK => st.hintmask = v,
            sync::HINTSTATUS_EXT => st.hintstatus_ext &= !v,
            sync::HINTMASK_EXT => st.hintmask_ext = v,
            sync::THRESH_CPU0_INT_STATUS => st.thresh_status &= !v,
            r if r == sync::THRESH_INT_MASK || r == sync::THRESH_INT_MASK + 4 => {
                st.int_mask[((r - sync::THRESH_INT_MASK) / 4) as usize] = v;
                recheck = true;
            }
            sync::USEC_CLK => st.usec_clk = v,
            sync::IP_BUSY_TIMEOUT => st.ip_busy_timeout = v,
            r if (sync::MLOCK..sync::MLOCK + 4 * NB_MLOCKS as u32).contains(&r) => {
                let i = ((r - sync::MLOCK) / 4) as usize;
                if v == 0 && st.mlocks[i] == MlockOwner::Cpu {
                    st.mlocks[i] = MlockOwner::Free;
                }
            }
            r if (sync::SYNCPT..sync::SYNCPT + 4 * NB_COUNTERS as u32).contains(&r) => {
                st.syncpt[((r - sync::SYNCPT) / 4) as usize] = v;
                recheck = true;
            }
            r if (sync::SYNCPT_INT_THRESH..sync::SYNCPT_INT_THRESH + 4 * NB_COUNTERS as u32)
                .contains(&r) =>
            {
                st.thresh[((r - sync::SYNCPT_INT_THRESH) / 4) as usize] = v;
                recheck = true;
            }
            r if (sync::SYNCPT_BASE..sync::SYNCPT_BASE + 4 * NB_WAIT_BASES as u32).contains(&r) => {
                st.base[((r - sync::SYNCPT_BASE) / 4) as usize] = v;
            }
            sync::SYNCPT_CPU_INCR => {
                for id in 0..NB_COUNTERS {
                    if v & (1 << id) != 0 {
                        st.syncpt[id] = st.syncpt[id].wrapping_add(1);
                    }
                }
                recheck = true;
            }
            _ => {}
        }
        if recheck && st.evaluate() {
            Some(IrqLine::Syncpt)
        } else {
            None
        }
    }

    fn channel_read(&self, st: &mut SimState, ch: usize, reg: u32) -> u32 {
        match reg {
            chreg::FIFOSTAT => {
                let out = (st.port.read_fifo.len() as u32).min(regs::fifostat::OUTFENTRIES_MASK);
                (out << regs::fifostat::OUTFENTRIES_SHIFT) | WRITE_FIFO_DEPTH
            }
            chreg::DMASTART => st.channels[ch].dmastart,
            chreg::DMAPUT => st.channels[ch].dmaput,
            chreg::DMAGET => st.channels[ch].dmaget,
            chreg::DMAEND => st.channels[ch].dmaend,
            chreg::DMACTRL => st.channels[ch].dmactrl,
            chreg::INDDATA => st.port.read_fifo.pop_front().unwrap_or(0),
            _ => 0,
        }
    }

    fn channel_write(&self, st: &mut SimState, ch: usize, reg: u32, v: u32) -> Option<IrqLine> {
        match reg {
            chreg::DMASTART => st.channels[ch].dmastart = v,
            chreg::DMAEND => st.channels[ch].dmaend = v,
            chreg::DMAPUT => {
                st.channels[ch].dmaput = v;
                st.fetch(ch, &self.mem);
            }
            chreg::DMACTRL => {
                let c = &mut st.channels[ch];
                c.dmactrl = v;
                if v & dmactrl::DMAGETRST != 0 {
                    c.dmaget = if v & dmactrl::DMAINITGET != 0 { c.dmaput } else { c.dmastart };
                    c.pending.clear();
                }
                if v & dmactrl::DMASTOP == 0 {
                    st.fetch(ch, &self.mem);
                }
            }
            chreg::INDOFF => {
                st.port.modid = indoff::modid(v);
                st.port.offset = indoff::word_offset(v);
                st.port.autoinc = v & indoff::AUTOINC != 0;
            }
            chreg::INDCNT => {
                for _ in 0..(v & 0xffff) {
                    let (modid, off) = (st.port.modid, st.port.offset);
                    match st.module_read(modid, off) {
                        Ok(val) => st.port.read_fifo.push_back(val),
                        Err(addr) => {
                            st.latch_fault(FaultKind::Read, addr);
                            st.port.read_fifo.push_back(0);
                            return Some(IrqLine::General);
                        }
                    }
                    if st.port.autoinc {
                        st.port.offset += 1;
                    }
                }
            }
            chreg::INDDATA => {
                let (modid, off) = (st.port.modid, st.port.offset);
                if st.port.autoinc {
                    st.port.offset += 1;
                }
                if let Err(addr) = st.module_write(modid, off, v) {
                    st.latch_fault(FaultKind::Write, addr);
                    return Some(IrqLine::General);
                }
            }
            _ => {}
        }
        if st.evaluate() {
            Some(IrqLine::Syncpt)
        } else {
            None
        }
    }
}

impl Mmio for SimHost {
    fn read32(&self, offset: u32) -> u32 {
        self.check_clock();
        let mut st = self.state.lock().unwrap();
        if (regs::SYNC_BASE..regs::SYNC_BASE + 0x800).contains(&offset) {
            self.sync_read(&mut st, offset - regs::SYNC_BASE)
        } else {
            let ch = (offset / regs::CHANNEL_STRIDE) as usize;
            if ch >= MAX_CHANNELS {
                return 0;
            }
            self.channel_read(&mut st, ch, offset % regs::CHANNEL_STRIDE)
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        self.check_clock();
        let mut st = self.state.lock().unwrap();
        let raise = if (regs::SYNC_BASE..regs::SYNC_BASE + 0x800).contains(&offset) {
            self.sync_write(&mut st, offset - regs::SYNC_BASE, value)
        } else {
            let ch = (offset / regs::CHANNEL_STRIDE) as usize;
            if ch >= MAX_CHANNELS {
                return;
            }
            self.channel_write(&mut st, ch, offset % regs::CHANNEL_STRIDE, value)
        };
        drop(st);
        if let Some(line) = raise {
            self.irq.shared().raise(line);
        }
    }
}

impl ModuleAperture for SimHost {
    fn read32(&self, module: ModuleId, offset: u32) -> u32 {
        self.check_clock();
        let Some(id) = regs::bus_module_id(module) else { return 0 };
        let mut st = self.state.lock().unwrap();
        match st.module_read(id, offset >> 2) {
            Ok(v) => v,
            Err(addr) => {
                st.latch_fault(FaultKind::Read, addr);
                drop(st);
                self.irq.shared().raise(IrqLine::General);
                0
            }
        }
    }

    fn write32(&self, module: ModuleId, offset: u32, value: u32) {
        self.check_clock();
        let Some(id) = regs::bus_module_id(module) else { return };
        let mut st = self.state.lock().unwrap();
        if let Err(addr) = st.module_write(id, offset >> 2, value) {
            st.latch_fault(FaultKind::Write, addr);
            drop(st);
            self.irq.shared().raise(IrqLine::General);
        }
    }
}

impl IrqController for SimHost {
    fn register(&self, line: IrqLine, handler: IrqHandler) -> HostResult<()> {
        self.irq.shared().register(line, handler)
    }

    fn unregister(&self, line: IrqLine) {
        self.irq.shared().unregister(line);
    }
}
