//! Interrupt delivery for the simulated host.
//!
//! Raising a line never runs the handler inline: the register write
//! that caused it may come from code holding host locks the handler
//! also takes. A dedicated thread plays the role of the CPU taking the
//! interrupt. Raises coalesce per line until the handler runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use gfxhost_core::error::{HostError, HostResult};
use gfxhost_core::traits::{IrqHandler, IrqLine};

const LINES: usize = 2;

fn line_index(line: IrqLine) -> usize {
    match line {
        IrqLine::Syncpt => 0,
        IrqLine::General => 1,
    }
}

pub(crate) struct IrqShared {
    queue: ArrayQueue<IrqLine>,
    pending: [AtomicBool; LINES],
    handlers: Mutex<HashMap<IrqLine, IrqHandler>>,
    shutdown: AtomicBool,
    thread: Mutex<Option<Thread>>,
}

impl IrqShared {
    fn new() -> Self {
        Self {
            queue: ArrayQueue::new(LINES * 2),
            pending: [AtomicBool::new(false), AtomicBool::new(false)],
            handlers: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    /// Assert a line. Safe to call with any lock held.
    pub(crate) fn raise(&self, line: IrqLine) {
        if self.pending[line_index(line)].swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.queue.push(line);
        if let Some(t) = self.thread.lock().unwrap().as_ref() {
            t.unpark();
        }
    }

    pub(crate) fn register(&self, line: IrqLine, handler: IrqHandler) -> HostResult<()> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&line) {
            return Err(HostError::InvalidState("irq line already claimed"));
        }
        handlers.insert(line, handler);
        Ok(())
    }

    pub(crate) fn unregister(&self, line: IrqLine) {
        self.handlers.lock().unwrap().remove(&line);
    }

    pub(crate) fn has_handler(&self, line: IrqLine) -> bool {
        self.handlers.lock().unwrap().contains_key(&line)
    }
}

/// Owns the delivery thread
pub(crate) struct IrqThread {
    shared: Arc<IrqShared>,
    handle: Option<JoinHandle<u64>>,
}

impl IrqThread {
    pub(crate) fn spawn() -> Self {
        let shared = Arc::new(IrqShared::new());
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("gfxhost-sim-irq".into())
            .spawn(move || irq_loop(worker))
            .expect("failed to spawn sim irq thread");
        *shared.thread.lock().unwrap() = Some(handle.thread().clone());
        Self { shared, handle: Some(handle) }
    }

    pub(crate) fn shared(&self) -> &Arc<IrqShared> {
        &self.shared
    }
}

impl Drop for IrqThread {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            h.thread().unpark();
            let _ = h.join();
        }
    }
}

/// Returns the number of handler invocations.
fn irq_loop(shared: Arc<IrqShared>) -> u64 {
    let mut delivered = 0u64;
    loop {
        while let Some(line) = shared.queue.pop() {
            shared.pending[line_index(line)].store(false, Ordering::Release);
            let handler = shared.handlers.lock().unwrap().get(&line).cloned();
            if let Some(h) = handler {
                h();
                delivered += 1;
            }
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        thread::park_timeout(Duration::from_millis(20));
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_delivers_on_thread() {
        let irq = IrqThread::spawn();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        irq.shared()
            .register(IrqLine::Syncpt, Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        irq.shared().raise(IrqLine::Syncpt);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_register_rejected() {
        let irq = IrqThread::spawn();
        irq.shared().register(IrqLine::General, Arc::new(|| {})).unwrap();
        assert!(irq.shared().register(IrqLine::General, Arc::new(|| {})).is_err());
        irq.shared().unregister(IrqLine::General);
        assert!(!irq.shared().has_handler(IrqLine::General));
    }
}
