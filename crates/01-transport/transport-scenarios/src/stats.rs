use parking_lot::Mutex;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct ScenarioStats {
    /// Frames the transport accepted.
    pub produced: u32,
    /// Accepted frames that landed in the send queue instead of the OS.
    pub queued: u32,
    /// Transfers rejected with backpressure (retried later).
    pub backpressured: u32,
    pub max_queue_depth: u32,
}

pub trait StatsSink: Clone + 'static {
    fn with_stats<R>(&self, f: impl FnOnce(&mut ScenarioStats) -> R) -> R;
}

impl StatsSink for Rc<RefCell<ScenarioStats>> {
    fn with_stats<R>(&self, f: impl FnOnce(&mut ScenarioStats) -> R) -> R {
        f(&mut self.borrow_mut())
    }
}

impl StatsSink for Arc<Mutex<ScenarioStats>> {
    fn with_stats<R>(&self, f: impl FnOnce(&mut ScenarioStats) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }
}
