use std::cell::UnsafeCell;
use std::sync::Arc;

use parking_lot::Mutex;

use object::Value;

use crate::error::{FatalError, UncaughtException};
use crate::frame::Frame;

/// Lifecycle of a VM thread. `Suspended` means parked at a safepoint with
/// its frame chain published for scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Running,
    Suspended,
    Terminated,
}

/// How a thread finished.
#[derive(Debug)]
pub enum ThreadOutcome {
    /// Root frame returned; the value is the entry function's result.
    Normal(Option<Value>),
    /// A managed exception reached the root frame of this thread.
    Exception(UncaughtException),
    /// The machine is dead.
    Fatal(FatalError),
}

/// The part of a VM thread both sides touch: the interpreter mutates the
/// frame chain while Running, the collector reads it while the thread is
/// Suspended.
#[derive(Debug)]
pub struct VmThread {
    pub id: u64,
    state: Mutex<ThreadState>,
    frames: UnsafeCell<Vec<Frame>>,
    /// References held by the interpreter across an allocation inside one
    /// instruction, visible to the collector like any other root.
    scratch: UnsafeCell<Vec<Value>>,
}

// SAFETY: `frames` and `scratch` are written only by the owning OS thread
// while the state is Running; the collector reads them only while the state
// is Suspended, and the safepoint protocol makes those phases disjoint.
unsafe impl Send for VmThread {}
// SAFETY: see above.
unsafe impl Sync for VmThread {}

impl VmThread {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(ThreadState::Created),
            frames: UnsafeCell::new(Vec::new()),
            scratch: UnsafeCell::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }

    /// # Safety
    ///
    /// Only the owning thread may call this, and only while Running. The
    /// borrow must end before the next safepoint or allocation.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn frames_mut(&self) -> &mut Vec<Frame> {
        // SAFETY: per contract.
        unsafe { &mut *self.frames.get() }
    }

    /// # Safety
    ///
    /// Caller must either be the owning thread, or hold the thread
    /// Suspended/Terminated for the duration of the borrow.
    pub(crate) unsafe fn frames(&self) -> &Vec<Frame> {
        // SAFETY: per contract.
        unsafe { &*self.frames.get() }
    }

    /// # Safety
    ///
    /// Same contract as [`frames_mut`](Self::frames_mut).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn scratch_mut(&self) -> &mut Vec<Value> {
        // SAFETY: per contract.
        unsafe { &mut *self.scratch.get() }
    }

    /// # Safety
    ///
    /// Same contract as [`frames`](Self::frames).
    pub(crate) unsafe fn scratch(&self) -> &Vec<Value> {
        // SAFETY: per contract.
        unsafe { &*self.scratch.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_observable() {
        let t = VmThread::new(1);
        assert_eq!(t.state(), ThreadState::Created);
        t.set_state(ThreadState::Running);
        assert_eq!(t.state(), ThreadState::Running);
        t.set_state(ThreadState::Suspended);
        t.set_state(ThreadState::Running);
        t.set_state(ThreadState::Terminated);
        assert_eq!(t.state(), ThreadState::Terminated);
    }
}
