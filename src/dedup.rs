use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

/// Single-flight guard: at most one extraction job per principal.
#[derive(Default)]
pub struct TaskDeduplicator {
    active: Mutex<HashSet<u64>>,
}

impl TaskDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, principal: u64) -> bool {
        self.lock().insert(principal)
    }

    pub fn release(&self, principal: u64) {
        self.lock().remove(&principal);
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    /// Like [`try_acquire`](Self::try_acquire), but the slot is released when
    /// the returned guard drops, including on panic unwind.
    pub fn acquire_slot(self: &Arc<Self>, principal: u64) -> Option<JobSlot> {
        self.try_acquire(principal).then(|| JobSlot {
            owner: self.clone(),
            principal,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct JobSlot {
    owner: Arc<TaskDeduplicator>,
    principal: u64,
}

impl JobSlot {
    pub fn principal(&self) -> u64 {
        self.principal
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        self.owner.release(self.principal);
    }
}
