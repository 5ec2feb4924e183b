use crate::queue::{QueueSnapshot, RequestQueue};

/// Read-only view of the generation queue for status endpoints.
///
/// Holds no state of its own; every call recomputes the snapshot from the
/// queue under its short bookkeeping lock, never waiting on the worker.
#[derive(Clone)]
pub struct StatusReporter {
    queue: RequestQueue,
}

impl StatusReporter {
    pub const fn new(queue: RequestQueue) -> Self {
        Self { queue }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }
}
