//! `SimPower` - records clock and rail state per module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use gfxhost_core::error::{HostError, HostResult};
use gfxhost_core::traits::{PowerControl, WakeEvent};
use gfxhost_core::{ktrace, ModuleId};

/// One recorded power transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Clock(ModuleId, bool),
    Voltage(ModuleId, bool),
}

#[derive(Default)]
struct PowerState {
    clocks: HashMap<ModuleId, bool>,
    rails: HashMap<ModuleId, bool>,
    log: Vec<PowerEvent>,
    wake: WakeEvent,
}

pub struct SimPower {
    state: Mutex<PowerState>,
    max_khz: AtomicU32,
}

impl SimPower {
    /// `max_khz` is the fastest host clock the platform will grant.
    pub fn new(max_khz: u32) -> Self {
        Self { state: Mutex::new(PowerState::default()), max_khz: AtomicU32::new(max_khz) }
    }

    pub fn clock_on(&self, module: ModuleId) -> bool {
        let st = self.state.lock().unwrap();
        st.clocks.get(&module).copied().unwrap_or(false)
    }

    pub fn voltage_on(&self, module: ModuleId) -> bool {
        let st = self.state.lock().unwrap();
        st.rails.get(&module).copied().unwrap_or(false)
    }

    /// Every transition so far, oldest first
    pub fn events(&self) -> Vec<PowerEvent> {
        self.state.lock().unwrap().log.clone()
    }

    /// Transitions of a single module
    pub fn events_for(&self, module: ModuleId) -> Vec<PowerEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, PowerEvent::Clock(m, _) | PowerEvent::Voltage(m, _) if *m == module))
            .collect()
    }

    pub fn clear_events(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn set_wake_event(&self, wake: WakeEvent) {
        self.state.lock().unwrap().wake = wake;
    }

    pub fn set_max_khz(&self, khz: u32) {
        self.max_khz.store(khz, Ordering::Relaxed);
    }
}

impl PowerControl for SimPower {
    fn module_clock(&self, module: ModuleId, on: bool) {
        ktrace!(target: "sim", "clock {} {}", module, if on { "on" } else { "off" });
        let mut st = self.state.lock().unwrap();
        st.clocks.insert(module, on);
        st.log.push(PowerEvent::Clock(module, on));
    }

    fn module_voltage(&self, module: ModuleId, on: bool) {
        ktrace!(target: "sim", "rail {} {}", module, if on { "on" } else { "off" });
        let mut st = self.state.lock().unwrap();
        st.rails.insert(module, on);
        st.log.push(PowerEvent::Voltage(module, on));
    }

    fn wake_event(&self) -> WakeEvent {
        self.state.lock().unwrap().wake
    }

    fn set_host_clock_khz(&self, target_khz: u32) -> HostResult<u32> {
        let max = self.max_khz.load(Ordering::Relaxed);
        if max == 0 {
            return Err(HostError::NotSupported);
        }
        Ok(target_khz.min(max))
    }
}
