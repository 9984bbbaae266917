//! Module register access
//!
//! Registers of modules behind the host are reached either through
//! their own aperture (direct) or through the indirect port of the
//! protected channel (indirect). The path is picked once at init.
//!
//! A module that does not answer within the bus timeout latches a
//! fault on the general interrupt line. Both paths check the fault log
//! after each access and report the fault to the caller; the access
//! itself returns zeroes for the missing words.

use std::hint;
use std::sync::{Arc, Mutex};

use gfxhost_core::error::{HostError, HostResult};
use gfxhost_core::regs::{self, channel as chreg, fifostat, indoff, INDIRECT_CHANNEL};
use gfxhost_core::traits::{Mmio, ModuleAperture};
use gfxhost_core::{kwarn, ModuleId};

use crate::clock::HostClock;
use crate::config::RegisterPath;
use crate::intr::FaultLog;

/// Longest run of consecutive registers fetched with one INDCNT
const MAX_BURST: usize = 8;

/// FIFOSTAT polls before a port access is declared stalled
const FIFO_POLL_LIMIT: u32 = 10_000;

/// Register access to a module behind the host
pub trait ModuleRegisters: Send + Sync {
    /// Read the registers at byte `offsets` into `values`.
    fn read(&self, module: ModuleId, offsets: &[u32], values: &mut [u32]) -> HostResult<()>;

    /// Write `values` to the registers at byte `offsets`.
    fn write(&self, module: ModuleId, offsets: &[u32], values: &[u32]) -> HostResult<()>;

    /// Read consecutive registers starting at byte `offset`.
    fn read_block(&self, module: ModuleId, offset: u32, values: &mut [u32]) -> HostResult<()> {
        let offsets = block_offsets(offset, values.len());
        self.read(module, &offsets, values)
    }

    /// Write consecutive registers starting at byte `offset`.
    fn write_block(&self, module: ModuleId, offset: u32, values: &[u32]) -> HostResult<()> {
        let offsets = block_offsets(offset, values.len());
        self.write(module, &offsets, values)
    }

    fn path(&self) -> RegisterPath;
}

fn block_offsets(offset: u32, len: usize) -> Vec<u32> {
    (0..len as u32).map(|i| offset + i * 4).collect()
}

/// Common argument checks; returns the module's bus id.
fn check(module: ModuleId, offsets: &[u32], values: usize) -> HostResult<u32> {
    let modid = regs::bus_module_id(module)
        .ok_or(HostError::InvalidArgument("module has no register aperture"))?;
    if offsets.len() != values {
        return Err(HostError::InvalidArgument("offset and value counts differ"));
    }
    if offsets.iter().any(|o| o % 4 != 0) {
        return Err(HostError::InvalidArgument("register offset not word aligned"));
    }
    Ok(modid)
}

fn fault_result(faults: &FaultLog, regs: &dyn Mmio, before: u64) -> HostResult<()> {
    match faults.check_since(regs, before) {
        Some(fault) => Err(HostError::BusFault(fault)),
        None => Ok(()),
    }
}

/// Build the implementation for `path`.
pub fn module_registers(
    path: RegisterPath,
    regs: Arc<dyn Mmio>,
    aperture: Arc<dyn ModuleAperture>,
    clock: Arc<HostClock>,
    faults: Arc<FaultLog>,
) -> Box<dyn ModuleRegisters> {
    match path {
        RegisterPath::Direct => Box::new(DirectModuleRegisters::new(aperture, regs, clock, faults)),
        RegisterPath::Indirect => Box::new(IndirectModuleRegisters::new(regs, clock, faults)),
    }
}

// ============================================================================
// Direct
// ============================================================================

pub struct DirectModuleRegisters {
    aperture: Arc<dyn ModuleAperture>,
    regs: Arc<dyn Mmio>,
    clock: Arc<HostClock>,
    faults: Arc<FaultLog>,
}

impl DirectModuleRegisters {
    pub fn new(
        aperture: Arc<dyn ModuleAperture>,
        regs: Arc<dyn Mmio>,
        clock: Arc<HostClock>,
        faults: Arc<FaultLog>,
    ) -> Self {
        Self { aperture, regs, clock, faults }
    }
}

impl ModuleRegisters for DirectModuleRegisters {
    fn read(&self, module: ModuleId, offsets: &[u32], values: &mut [u32]) -> HostResult<()> {
        check(module, offsets, values.len())?;
        let _clk = self.clock.guard();
        let before = self.faults.total();
        for (v, &off) in values.iter_mut().zip(offsets) {
            *v = self.aperture.read32(module, off);
        }
        fault_result(&self.faults, &*self.regs, before)
    }

    fn write(&self, module: ModuleId, offsets: &[u32], values: &[u32]) -> HostResult<()> {
        check(module, offsets, values.len())?;
        let _clk = self.clock.guard();
        let before = self.faults.total();
        for (&v, &off) in values.iter().zip(offsets) {
            self.aperture.write32(module, off, v);
        }
        fault_result(&self.faults, &*self.regs, before)
    }

    fn path(&self) -> RegisterPath {
        RegisterPath::Direct
    }
}

// ============================================================================
// Indirect
// ============================================================================

/// Access through the protected channel's INDOFF/INDCNT/INDDATA port.
/// One access at a time; the port has a single address register.
pub struct IndirectModuleRegisters {
    regs: Arc<dyn Mmio>,
    clock: Arc<HostClock>,
    faults: Arc<FaultLog>,
    port: Mutex<()>,
}

impl IndirectModuleRegisters {
    pub fn new(regs: Arc<dyn Mmio>, clock: Arc<HostClock>, faults: Arc<FaultLog>) -> Self {
        Self {
            regs,
            clock,
            faults,
            port: Mutex::new(()),
        }
    }

    fn reg(reg: u32) -> u32 {
        regs::channel_reg(INDIRECT_CHANNEL, reg)
    }

    /// Wait for a FIFOSTAT field to become non-zero.
    fn poll_fifo(&self, field: fn(u32) -> u32) -> Option<u32> {
        for _ in 0..FIFO_POLL_LIMIT {
            let n = field(self.regs.read32(Self::reg(chreg::FIFOSTAT)));
            if n != 0 {
                return Some(n);
            }
            hint::spin_loop();
        }
        None
    }
}

impl ModuleRegisters for IndirectModuleRegisters {
    fn read(&self, module: ModuleId, offsets: &[u32], values: &mut [u32]) -> HostResult<()> {
        let modid = check(module, offsets, values.len())?;
        let _port = self.port.lock().unwrap();
        let _clk = self.clock.guard();
        let before = self.faults.total();
        let n = offsets.len();
        let mut stalled = false;

        let mut i = 0;
        while i < n {
            let first = offsets[i] >> 2;
            let mut count = 1;
            while i + count < n && count < MAX_BURST && offsets[i + count] >> 2 == first + count as u32 {
                count += 1;
            }

            self.regs
                .write32(Self::reg(chreg::INDOFF), indoff::encode(modid, first));
            self.regs.write32(Self::reg(chreg::INDCNT), count as u32);

            let end = i + count;
            while i < end {
                let Some(ready) = self.poll_fifo(fifostat::read_entries) else {
                    stalled = true;
                    break;
                };
                for _ in 0..(ready as usize).min(end - i) {
                    values[i] = self.regs.read32(Self::reg(chreg::INDDATA));
                    i += 1;
                }
            }
            if stalled {
                values[i..].fill(0);
                break;
            }
        }

        fault_result(&self.faults, &*self.regs, before)?;
        if stalled {
            kwarn!("{} indirect read stalled", module);
            return Err(HostError::InvalidState("indirect register port stalled"));
        }
        Ok(())
    }

    fn write(&self, module: ModuleId, offsets: &[u32], values: &[u32]) -> HostResult<()> {
        let modid = check(module, offsets, values.len())?;
        let _port = self.port.lock().unwrap();
        let _clk = self.clock.guard();
        let before = self.faults.total();

        // forces INDOFF on the first write
        let mut prev: u32 = 0xffff_fffe;
        let mut free = 0;
        for (&off, &v) in offsets.iter().zip(values) {
            if free == 0 {
                free = match self.poll_fifo(fifostat::free_write_entries) {
                    Some(n) => n,
                    None => {
                        fault_result(&self.faults, &*self.regs, before)?;
                        kwarn!("{} indirect write stalled", module);
                        return Err(HostError::InvalidState("indirect register port stalled"));
                    }
                };
            }
            let word = off >> 2;
            if prev.wrapping_add(1) != word {
                self.regs
                    .write32(Self::reg(chreg::INDOFF), indoff::encode(modid, word));
            }
            self.regs.write32(Self::reg(chreg::INDDATA), v);
            free -= 1;
            prev = word;
        }

        fault_result(&self.faults, &*self.regs, before)
    }

    fn path(&self) -> RegisterPath {
        RegisterPath::Indirect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxhost_core::error::{BusFault, FaultKind};
    use gfxhost_core::ModuleKind;
    use gfxhost_hw::SimBackend;

    const DISP: ModuleId = ModuleId::new(ModuleKind::Display, 0);
    const DSI: ModuleId = ModuleId::new(ModuleKind::Dsi, 0);

    fn both(sim: &SimBackend) -> [Box<dyn ModuleRegisters>; 2] {
        let clock = Arc::new(HostClock::new(sim.power.clone()));
        let faults = Arc::new(FaultLog::new());
        [RegisterPath::Direct, RegisterPath::Indirect].map(|path| {
            module_registers(path, sim.host.clone(), sim.host.clone(), clock.clone(), faults.clone())
        })
    }

    #[test]
    fn test_scattered_read() {
        let sim = SimBackend::new();
        for (i, off) in [0x10u32, 0x14, 0x18, 0x40].iter().enumerate() {
            sim.host.set_module_reg(DISP, *off, 100 + i as u32);
        }
        for mr in both(&sim) {
            let mut values = [0u32; 4];
            mr.read(DISP, &[0x10, 0x14, 0x18, 0x40], &mut values).unwrap();
            assert_eq!(values, [100, 101, 102, 103], "{:?}", mr.path());
        }
        assert_eq!(sim.host.clock_violations(), 0);
    }

    #[test]
    fn test_long_block_spans_bursts() {
        let sim = SimBackend::new();
        for i in 0..20u32 {
            sim.host.set_module_reg(DSI, i * 4, i * i);
        }
        for mr in both(&sim) {
            let mut values = [0u32; 20];
            mr.read_block(DSI, 0, &mut values).unwrap();
            let expected: Vec<u32> = (0..20).map(|i| i * i).collect();
            assert_eq!(values.to_vec(), expected, "{:?}", mr.path());
        }
    }

    #[test]
    fn test_write_then_read_back() {
        let sim = SimBackend::new();
        for (n, mr) in both(&sim).iter().enumerate() {
            let base = 0x100 * (n as u32 + 1);
            mr.write(DISP, &[base, base + 4, base + 0x20], &[1, 2, 3]).unwrap();
            assert_eq!(sim.host.module_reg(DISP, base), 1);
            assert_eq!(sim.host.module_reg(DISP, base + 4), 2);
            assert_eq!(sim.host.module_reg(DISP, base + 0x20), 3);

            mr.write_block(DISP, base + 0x40, &[7, 8]).unwrap();
            let mut back = [0u32; 2];
            mr.read_block(DISP, base + 0x40, &mut back).unwrap();
            assert_eq!(back, [7, 8]);
        }
    }

    #[test]
    fn test_hung_module_reports_bus_fault() {
        let sim = SimBackend::new();
        sim.host.set_unresponsive(DISP, true);
        for mr in both(&sim) {
            let mut values = [0xdead_beefu32; 3];
            let err = mr.read_block(DISP, 0x10, &mut values).unwrap_err();
            assert!(
                matches!(err, HostError::BusFault(BusFault { kind: FaultKind::Read, .. })),
                "{:?}: {:?}",
                mr.path(),
                err
            );
            assert_eq!(values[0], 0);

            let err = mr.write(DISP, &[0x10], &[1]).unwrap_err();
            assert!(matches!(err, HostError::BusFault(BusFault { kind: FaultKind::Write, .. })));
        }
        assert!(!sim.host.fault_pending());
    }

    #[test]
    fn test_argument_checks() {
        let sim = SimBackend::new();
        for mr in both(&sim) {
            let mut one = [0u32; 1];
            assert!(mr.read(ModuleId::new(ModuleKind::Dsi, 1), &[0], &mut one).is_err());
            assert!(mr.read(DISP, &[0, 4], &mut one).is_err());
            assert!(mr.write(DISP, &[2], &[0]).is_err());
        }
    }
}
