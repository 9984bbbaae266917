//! Host clock gate
//!
//! Every register access behind the host clock runs inside a
//! `ClockGuard`. The clock is switched on by the first reference and
//! off by the last.

use std::sync::{Arc, Mutex};

use gfxhost_core::traits::PowerControl;
use gfxhost_core::{kdebug, ModuleId};

pub struct HostClock {
    power: Arc<dyn PowerControl>,
    refs: Mutex<u32>,
}

impl HostClock {
    pub fn new(power: Arc<dyn PowerControl>) -> Self {
        Self {
            power,
            refs: Mutex::new(0),
        }
    }

    pub fn enable(&self) {
        let mut refs = self.refs.lock().unwrap();
        if *refs == 0 {
            kdebug!("host clock on");
            self.power.module_clock(ModuleId::HOST, true);
        }
        *refs += 1;
    }

    pub fn disable(&self) {
        let mut refs = self.refs.lock().unwrap();
        debug_assert!(*refs > 0, "host clock reference underflow");
        if *refs == 0 {
            return;
        }
        *refs -= 1;
        if *refs == 0 {
            kdebug!("host clock off");
            self.power.module_clock(ModuleId::HOST, false);
        }
    }

    /// Hold a clock reference for the guard's lifetime
    pub fn guard(&self) -> ClockGuard<'_> {
        self.enable();
        ClockGuard { clock: self }
    }

    pub fn refs(&self) -> u32 {
        *self.refs.lock().unwrap()
    }
}

#[must_use = "the clock is released when the guard drops"]
pub struct ClockGuard<'a> {
    clock: &'a HostClock,
}

impl Drop for ClockGuard<'_> {
    fn drop(&mut self) {
        self.clock.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxhost_hw::SimPower;

    #[test]
    fn test_first_and_last_reference_gate_clock() {
        let power = Arc::new(SimPower::new(83_000));
        let clock = HostClock::new(power.clone());
        assert!(!power.clock_on(ModuleId::HOST));

        clock.enable();
        {
            let _g = clock.guard();
            assert_eq!(clock.refs(), 2);
        }
        assert!(power.clock_on(ModuleId::HOST));
        clock.disable();
        assert!(!power.clock_on(ModuleId::HOST));
        assert_eq!(clock.refs(), 0);
    }

    #[test]
    fn test_guard_nesting_switches_once() {
        let power = Arc::new(SimPower::new(83_000));
        let clock = HostClock::new(power.clone());
        {
            let _a = clock.guard();
            let _b = clock.guard();
        }
        assert_eq!(power.events_for(ModuleId::HOST).len(), 2);
    }
}
