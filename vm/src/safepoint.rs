//! The stop-the-world rendezvous.
//!
//! One flag, one registry, two condition variables. A collector raises the
//! flag and waits until every registered thread has parked at a safepoint
//! (or terminated); parked threads sleep until the collector drops the flag
//! and wakes them. The protocol is plain state-machine transitions so it
//! can be exercised without a heap or an interpreter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::FatalError;
use crate::thread::{ThreadState, VmThread};

pub struct GcCoordinator {
    /// Set while a collection is pending or in progress; every thread polls
    /// this at its safepoints.
    requested: AtomicBool,
    threads: Mutex<Vec<Arc<VmThread>>>,
    /// Signaled whenever a thread parks, terminates or (de)registers.
    changed: Condvar,
    /// Signaled when the collection is over.
    resume: Condvar,
    timeout: Duration,
}

impl GcCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            requested: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            changed: Condvar::new(),
            resume: Condvar::new(),
            timeout,
        }
    }

    pub fn register(&self, thread: Arc<VmThread>) {
        let mut threads = self.threads.lock();
        debug_assert!(threads.iter().all(|t| t.id != thread.id));
        threads.push(thread);
        self.changed.notify_all();
    }

    pub fn deregister(&self, id: u64) {
        let mut threads = self.threads.lock();
        threads.retain(|t| t.id != id);
        self.changed.notify_all();
    }

    /// Polled by the dispatch loop at every safepoint.
    #[inline(always)]
    pub fn should_park(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Park the calling VM thread until the pending collection finishes.
    /// The thread's frame chain and pc must already describe a safepoint.
    pub fn park(&self, me: &VmThread) {
        me.set_state(ThreadState::Suspended);
        let mut guard = self.threads.lock();
        self.changed.notify_all();
        while self.requested.load(Ordering::Acquire) {
            self.resume.wait(&mut guard);
        }
        drop(guard);
        me.set_state(ThreadState::Running);
    }

    /// Wake the quiescence waiter after a state change made outside
    /// [`park`] (thread termination).
    pub fn notify_exit(&self) {
        let _guard = self.threads.lock();
        self.changed.notify_all();
    }

    /// Attempt to become the collector. Fails if a collection is already
    /// pending; the caller should park with everyone else instead.
    pub(crate) fn try_begin(&self) -> bool {
        self.requested
            .compare_exchange(
                false,
                true,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Block until every registered thread is Suspended or Terminated.
    /// (A collecting VM thread suspends itself before calling.) A thread
    /// stuck between safepoints past the timeout is a fatal liveness bug.
    pub(crate) fn wait_quiescent(
        &self,
    ) -> Result<Vec<Arc<VmThread>>, FatalError> {
        let deadline = Instant::now() + self.timeout;
        let mut guard = self.threads.lock();
        loop {
            let quiescent = guard.iter().all(|t| {
                matches!(
                    t.state(),
                    ThreadState::Suspended | ThreadState::Terminated
                )
            });
            if quiescent {
                return Ok(guard.clone());
            }
            if self.changed.wait_until(&mut guard, deadline).timed_out() {
                return Err(FatalError::GcTimeout(self.timeout));
            }
        }
    }

    /// End the pause and release every parked thread.
    pub(crate) fn finish(&self) {
        self.requested.store(false, Ordering::Release);
        let _guard = self.threads.lock();
        self.resume.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn coordinator() -> Arc<GcCoordinator> {
        Arc::new(GcCoordinator::new(Duration::from_secs(2)))
    }

    /// A mutator that spins, parking whenever asked, until told to stop.
    fn spawn_mutator(
        coord: &Arc<GcCoordinator>,
        thread: Arc<VmThread>,
        stop: Arc<AtomicBool>,
        parks: Arc<AtomicUsize>,
    ) -> thread::JoinHandle<()> {
        let coord = Arc::clone(coord);
        thread::spawn(move || {
            thread.set_state(ThreadState::Running);
            while !stop.load(Ordering::Relaxed) {
                if coord.should_park() {
                    parks.fetch_add(1, Ordering::Relaxed);
                    coord.park(&thread);
                }
                std::hint::spin_loop();
            }
            thread.set_state(ThreadState::Terminated);
            coord.notify_exit();
        })
    }

    #[test]
    fn all_mutators_park_and_resume() {
        let coord = coordinator();
        let stop = Arc::new(AtomicBool::new(false));
        let parks = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for id in 0..4 {
            let t = VmThread::new(id);
            coord.register(Arc::clone(&t));
            handles.push(spawn_mutator(
                &coord,
                t,
                Arc::clone(&stop),
                Arc::clone(&parks),
            ));
        }

        assert!(coord.try_begin());
        let threads = coord.wait_quiescent().expect("threads must park");
        assert_eq!(threads.len(), 4);
        for t in &threads {
            assert_eq!(t.state(), ThreadState::Suspended);
        }
        assert_eq!(parks.load(Ordering::Relaxed), 4);

        coord.finish();
        stop.store(true, Ordering::Relaxed);
        for h in handles {
            h.join().expect("mutator exits");
        }
        assert!(!coord.should_park());
    }

    #[test]
    fn only_one_collector_wins() {
        let coord = coordinator();
        assert!(coord.try_begin());
        assert!(!coord.try_begin());
        coord.finish();
        assert!(coord.try_begin());
        coord.finish();
    }

    #[test]
    fn terminated_threads_do_not_block_quiescence() {
        let coord = coordinator();
        let t = VmThread::new(7);
        coord.register(Arc::clone(&t));
        t.set_state(ThreadState::Terminated);

        assert!(coord.try_begin());
        let threads = coord.wait_quiescent().expect("no live threads");
        assert_eq!(threads.len(), 1);
        coord.finish();
    }

    #[test]
    fn stuck_thread_times_out_as_fatal() {
        let coord = Arc::new(GcCoordinator::new(Duration::from_millis(50)));
        let t = VmThread::new(1);
        t.set_state(ThreadState::Running); // never parks
        coord.register(t);

        assert!(coord.try_begin());
        let err = coord.wait_quiescent().unwrap_err();
        assert!(matches!(err, FatalError::GcTimeout(_)));
        coord.finish();
    }

    #[test]
    fn park_returns_immediately_when_no_collection_pending() {
        let coord = coordinator();
        let t = VmThread::new(1);
        t.set_state(ThreadState::Running);

        let started = Instant::now();
        coord.park(&t);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(t.state(), ThreadState::Running);
    }
}
