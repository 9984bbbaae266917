//! Context-switch manager
//!
//! Context-switched engines (3D, MPE) are shared by clients that each
//! expect their own register state. A registered context carries the
//! command segments that save the engine state and those that restore
//! it. When a submission names a context other than the one the engine
//! holds, the channel runs `save(active) -> restore(new) -> work` as one
//! submission.
//!
//! ```text
//!   register          switch to          switch away         save retired
//! Inactive ──────────▶ Active ─────────▶ PendingSave ─────────▶ Inactive
//!     │                                                            │
//!     └────────── free (no refs, not pending a save) ──▶ Freed ◀──┘
//! ```
//!
//! A context never touches hardware itself. State changes driven by the
//! hardware arrive as `RetireAction`s from the completion queue drain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gfxhost_core::error::{HostError, HostResult, ResourceError};
use gfxhost_core::traits::MemoryManager;
use gfxhost_core::{kdebug, reached, ContextId, CounterId, Fence, ModuleId};

use crate::submit::Segment;
use crate::syncpt::Counters;

/// Contexts alive at once
pub const MAX_CONTEXTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSpec {
    pub module: ModuleId,
    /// Counter the save segments increment
    pub counter: CounterId,
    pub save: Vec<Segment>,
    /// Increments the save segments perform (2 or 3)
    pub save_incrs: u32,
    /// Restore segments; they must not increment any counter
    pub restore: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Inactive,
    Active,
    PendingSave,
    Freed,
}

/// Completion-queue follow-up once a counter threshold retires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireAction {
    /// The context's save segments, ending at the fence, have run
    Save(ContextId, Fence),
    /// A submission depending on the context has run
    Ref(ContextId),
}

struct Slot {
    spec: Option<ContextSpec>,
    state: ContextState,
    refs: u32,
    free_requested: bool,
    save_fence: Option<Fence>,
}

impl Slot {
    fn vacant() -> Self {
        Slot {
            spec: None,
            state: ContextState::Freed,
            refs: 0,
            free_requested: false,
            save_fence: None,
        }
    }
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    active: HashMap<ModuleId, ContextId>,
}

/// Save of the context leaving the engine
#[derive(Debug, Clone)]
pub(crate) struct PrevSave {
    pub ctx: ContextId,
    pub counter: CounterId,
    pub save: Vec<Segment>,
    pub incrs: u32,
}

/// How a submission uses its context
#[derive(Debug, Clone)]
pub(crate) struct ContextUse {
    pub ctx: ContextId,
    pub module: ModuleId,
    pub switching: bool,
    pub prev: Option<PrevSave>,
    pub restore: Vec<Segment>,
}

impl ContextUse {
    /// Segments to run ahead of the client's own
    pub fn prefix(&self) -> Vec<Segment> {
        let mut segs = Vec::new();
        if let Some(prev) = &self.prev {
            segs.extend_from_slice(&prev.save);
        }
        if self.switching {
            segs.extend_from_slice(&self.restore);
        }
        segs
    }
}

pub struct Contexts {
    mem: Arc<dyn MemoryManager>,
    inner: Mutex<Inner>,
}

impl Contexts {
    pub fn new(mem: Arc<dyn MemoryManager>) -> Self {
        Self {
            mem,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn register(&self, spec: ContextSpec) -> HostResult<ContextId> {
        if !spec.module.kind.is_context_switched() {
            return Err(HostError::InvalidArgument("module is not context switched"));
        }
        if spec.save.is_empty() || !(2..=3).contains(&spec.save_incrs) {
            return Err(HostError::InvalidArgument("context save must take 2 or 3 increments"));
        }
        Counters::check(spec.counter)?;

        let mut inner = self.inner.lock().unwrap();
        let idx = match inner
            .slots
            .iter()
            .position(|s| s.state == ContextState::Freed)
        {
            Some(i) => i,
            None if inner.slots.len() < MAX_CONTEXTS => {
                inner.slots.push(Slot::vacant());
                inner.slots.len() - 1
            }
            None => return Err(ResourceError::NoFreeContext.into()),
        };

        for seg in spec.save.iter().chain(&spec.restore) {
            self.mem.incr_ref(seg.mem);
        }
        let id = ContextId::new(idx as u32);
        kdebug!("{} registered for {}", id, spec.module);
        inner.slots[idx] = Slot {
            spec: Some(spec),
            state: ContextState::Inactive,
            refs: 0,
            free_requested: false,
            save_fence: None,
        };
        Ok(id)
    }

    /// Ask for the context to go away once nothing depends on it.
    pub fn free(&self, id: ContextId) -> HostResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = Self::live_slot(&mut inner, id)?;
        slot.free_requested = true;
        let module = slot.spec.as_ref().map(|s| s.module);
        if slot.state == ContextState::Active {
            slot.state = ContextState::Inactive;
        }
        if let Some(m) = module {
            if inner.active.get(&m) == Some(&id) {
                inner.active.remove(&m);
            }
        }
        self.maybe_release(&mut inner, id);
        Ok(())
    }

    pub fn state(&self, id: ContextId) -> Option<ContextState> {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(id.as_usize()).map(|s| s.state)
    }

    pub fn refs(&self, id: ContextId) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(id.as_usize()).map_or(0, |s| s.refs)
    }

    pub fn active(&self, module: ModuleId) -> Option<ContextId> {
        self.inner.lock().unwrap().active.get(&module).copied()
    }

    /// Threshold at which a pending save completes
    pub fn save_fence(&self, id: ContextId) -> Option<Fence> {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(id.as_usize()).and_then(|s| s.save_fence)
    }

    fn live_slot(inner: &mut Inner, id: ContextId) -> HostResult<&mut Slot> {
        match inner.slots.get_mut(id.as_usize()) {
            Some(s) if s.state != ContextState::Freed && !s.free_requested => Ok(s),
            _ => Err(HostError::InvalidArgument("unknown context")),
        }
    }

    /// Work out what running on `id` costs; nothing changes yet.
    pub(crate) fn plan(&self, id: ContextId) -> HostResult<ContextUse> {
        let mut inner = self.inner.lock().unwrap();
        let slot = Self::live_slot(&mut inner, id)?;
        let Some(spec) = slot.spec.as_ref() else {
            return Err(HostError::InvalidArgument("unknown context"));
        };
        let (module, restore) = (spec.module, spec.restore.clone());

        let current = inner.active.get(&module).copied();
        if current == Some(id) {
            return Ok(ContextUse { ctx: id, module, switching: false, prev: None, restore });
        }
        let prev = current.and_then(|p| {
            inner.slots[p.as_usize()].spec.as_ref().map(|s| PrevSave {
                ctx: p,
                counter: s.counter,
                save: s.save.clone(),
                incrs: s.save_incrs,
            })
        });
        Ok(ContextUse { ctx: id, module, switching: true, prev, restore })
    }

    /// Apply a planned use once its submission is committed.
    pub(crate) fn commit(&self, u: &ContextUse, prev_fence: Option<Fence>) {
        let mut inner = self.inner.lock().unwrap();
        if let (Some(prev), Some(fence)) = (&u.prev, prev_fence) {
            let slot = &mut inner.slots[prev.ctx.as_usize()];
            slot.state = ContextState::PendingSave;
            slot.save_fence = Some(fence);
        }
        let slot = &mut inner.slots[u.ctx.as_usize()];
        slot.refs += 1;
        if u.switching {
            slot.state = ContextState::Active;
            inner.active.insert(u.module, u.ctx);
        }
    }

    /// The active context of `module` and its save, for power-down.
    pub(crate) fn active_save(&self, module: ModuleId) -> HostResult<PrevSave> {
        let inner = self.inner.lock().unwrap();
        let id = *inner.active.get(&module).ok_or(HostError::NotInitialized)?;
        let spec = inner.slots[id.as_usize()]
            .spec
            .as_ref()
            .ok_or(HostError::NotInitialized)?;
        Ok(PrevSave {
            ctx: id,
            counter: spec.counter,
            save: spec.save.clone(),
            incrs: spec.save_incrs,
        })
    }

    /// The engine is being saved ahead of power-down.
    pub(crate) fn mark_pending_save(&self, id: ContextId, module: ModuleId, fence: Fence) {
        let mut inner = self.inner.lock().unwrap();
        if inner.active.get(&module) == Some(&id) {
            inner.active.remove(&module);
        }
        let slot = &mut inner.slots[id.as_usize()];
        slot.state = ContextState::PendingSave;
        slot.save_fence = Some(fence);
    }

    pub(crate) fn retire(&self, action: RetireAction) {
        let mut inner = self.inner.lock().unwrap();
        let id = match action {
            RetireAction::Save(id, done) => {
                let slot = &mut inner.slots[id.as_usize()];
                // an older save retiring leaves a newer one pending
                let covers = slot.save_fence.map_or(true, |pending| {
                    pending.counter != done.counter || reached(done.value, pending.value)
                });
                if slot.state == ContextState::PendingSave && covers {
                    slot.state = ContextState::Inactive;
                    slot.save_fence = None;
                }
                id
            }
            RetireAction::Ref(id) => {
                let slot = &mut inner.slots[id.as_usize()];
                debug_assert!(slot.refs > 0, "{} reference underflow", id);
                slot.refs = slot.refs.saturating_sub(1);
                id
            }
        };
        self.maybe_release(&mut inner, id);
    }

    fn maybe_release(&self, inner: &mut Inner, id: ContextId) {
        let slot = &mut inner.slots[id.as_usize()];
        if !slot.free_requested || slot.refs > 0 || slot.state == ContextState::PendingSave {
            return;
        }
        if let Some(spec) = slot.spec.take() {
            for seg in spec.save.iter().chain(&spec.restore) {
                self.mem.decr_ref(seg.mem);
            }
        }
        *slot = Slot::vacant();
        kdebug!("{} freed", id);
    }
}
