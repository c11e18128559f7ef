use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use heap::{AllocError, CollectionStats, Heap, HeapSettings};
use object::{ClassId, FunctionId, GcRef, Value};

use crate::assembly::Assembly;
use crate::error::{FatalError, MachineError};
use crate::interp;
use crate::roots;
use crate::safepoint::GcCoordinator;
use crate::thread::{ThreadOutcome, ThreadState, VmThread};

/// Construction parameters for one machine instance.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    pub heap: HeapSettings,
    /// Call depth at which further calls raise StackOverflowException.
    pub max_frames: usize,
    /// How long a collection waits for every thread to reach a safepoint
    /// before declaring the machine broken.
    pub gc_timeout: Duration,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            heap: HeapSettings::default(),
            max_frames: 1024,
            gc_timeout: Duration::from_secs(5),
        }
    }
}

/// A spawned VM thread; join it for the outcome.
pub struct ThreadHandle {
    thread: Arc<VmThread>,
    join: JoinHandle<ThreadOutcome>,
}

impl ThreadHandle {
    pub fn id(&self) -> u64 {
        self.thread.id
    }

    pub fn join(self) -> ThreadOutcome {
        match self.join.join() {
            Ok(outcome) => outcome,
            Err(_) => ThreadOutcome::Fatal(FatalError::HeapConsistency(
                "worker thread panicked".into(),
            )),
        }
    }
}

/// The owner of everything process-wide: the loaded assembly, the heap,
/// the thread registry and the collection protocol. No global state; drop
/// the machine and it is all gone.
pub struct Machine {
    pub(crate) assembly: Arc<Assembly>,
    pub(crate) heap: Heap,
    pub(crate) coord: GcCoordinator,
    pub(crate) max_frames: usize,
    next_thread_id: AtomicU64,
}

impl Machine {
    pub fn new(assembly: Assembly, options: MachineOptions) -> Arc<Self> {
        Arc::new(Self {
            assembly: Arc::new(assembly),
            heap: Heap::new(options.heap),
            coord: GcCoordinator::new(options.gc_timeout),
            max_frames: options.max_frames,
            next_thread_id: AtomicU64::new(0),
        })
    }

    pub fn assembly(&self) -> &Assembly {
        &self.assembly
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Execute `entry` on the calling OS thread until it returns or dies.
    /// The exit code is the entry function's integer return value (0 for a
    /// void entry); an exception that reaches the root frame is fatal for
    /// the machine and reported with its trace.
    pub fn run(
        self: &Arc<Self>,
        entry: FunctionId,
        args: Vec<Value>,
    ) -> Result<i32, MachineError> {
        let thread = self.attach_thread();
        let outcome = interp::run_thread(self, &thread, entry, args);
        self.coord.deregister(thread.id);
        match outcome {
            ThreadOutcome::Normal(Some(Value::Int(code))) => Ok(code as i32),
            ThreadOutcome::Normal(_) => Ok(0),
            ThreadOutcome::Exception(exc) => {
                Err(MachineError::UncaughtException(exc))
            }
            ThreadOutcome::Fatal(err) => Err(MachineError::Fatal(err)),
        }
    }

    /// Start `function` on a fresh OS thread. An uncaught exception there
    /// terminates only that thread; the machine keeps running.
    pub fn spawn(
        self: &Arc<Self>,
        function: FunctionId,
        args: Vec<Value>,
    ) -> ThreadHandle {
        let thread = self.attach_thread();
        let machine = Arc::clone(self);
        let shared = Arc::clone(&thread);
        let join = std::thread::spawn(move || {
            let outcome =
                interp::run_thread(&machine, &shared, function, args);
            machine.coord.deregister(shared.id);
            outcome
        });
        ThreadHandle { thread, join }
    }

    /// Manual collection trigger for the embedding host. Blocks until a
    /// full cycle has run.
    pub fn request_collection(&self) -> Result<CollectionStats, FatalError> {
        while !self.coord.try_begin() {
            // Another cycle is in flight; let it finish, then run our own
            // so the caller observes a full collection.
            std::thread::yield_now();
        }
        self.run_collection()
    }

    fn attach_thread(&self) -> Arc<VmThread> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let thread = VmThread::new(id);
        self.coord.register(Arc::clone(&thread));
        thread
    }

    // ── allocation / collection ────────────────────────────────────

    /// Allocate for a running thread, collecting and retrying once if the
    /// growth threshold is hit. The caller must be at a safepoint with its
    /// frame state published (pc at the allocating instruction).
    pub(crate) fn allocate(
        &self,
        me: &VmThread,
        class: ClassId,
        length: u32,
    ) -> Result<GcRef, FatalError> {
        let classes = &self.assembly.classes;
        match self.heap.allocate(classes, class, length) {
            Ok(r) => Ok(r),
            Err(AllocError::NeedsGc) => {
                self.collect_from(me)?;
                self.heap
                    .allocate_after_collect(classes, class, length)
                    .map_err(|_| self.oom(class, length))
            }
            Err(AllocError::Exhausted) => Err(self.oom(class, length)),
        }
    }

    fn oom(&self, class: ClassId, length: u32) -> FatalError {
        let requested = 16
            + self.assembly.classes.get(class).payload_size(length);
        FatalError::OutOfMemory { requested }
    }

    /// Run (or join) a collection cycle from a mutator thread parked at an
    /// allocation safepoint.
    pub(crate) fn collect_from(
        &self,
        me: &VmThread,
    ) -> Result<(), FatalError> {
        if !self.coord.try_begin() {
            // Someone else is collecting; park with everyone, then let the
            // caller retry its allocation against the swept heap.
            self.coord.park(me);
            return Ok(());
        }
        me.set_state(ThreadState::Suspended);
        let result = self.run_collection();
        me.set_state(ThreadState::Running);
        result.map(|_| ())
    }

    /// The coordinator side of a cycle: quiesce, gather roots, mark-sweep,
    /// resume. The pause flag is always cleared, even on a fatal error, so
    /// parked threads can drain while the machine reports the failure.
    fn run_collection(&self) -> Result<CollectionStats, FatalError> {
        let result = (|| {
            let threads = self.coord.wait_quiescent()?;
            let mut root_list = Vec::new();
            for thread in &threads {
                if thread.state() != ThreadState::Suspended {
                    continue;
                }
                // SAFETY: the thread stays suspended until we finish the
                // cycle, so its frames and scratch are stable.
                let frames = unsafe { thread.frames() };
                for frame in frames {
                    roots::frame_roots(&self.assembly, frame, &mut root_list)?;
                }
                // SAFETY: same suspension argument.
                roots::scratch_roots(
                    unsafe { thread.scratch() },
                    &mut root_list,
                );
            }
            roots::static_roots(&self.assembly.classes, &mut root_list);
            Ok(self.heap.collect(&root_list, &self.assembly.classes))
        })();
        self.coord.finish();
        result
    }
}
