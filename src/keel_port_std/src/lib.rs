//! Hosted simulation port for the keel kernel.
//!
//! Every kernel task is backed by one host thread; a virtual CPU token
//! makes exactly one of them runnable at a time, so the simulated system is
//! single-core like the real target. The port keeps a virtual interrupt
//! mask: pended events (tick interrupts and the deferred context switch)
//! are delivered only at *preemption points* — critical-section boundaries,
//! `yield_now`, and `wait_for_interrupt` — which mirrors interrupts firing
//! the moment the hardware mask drops.
//!
//! Context switches follow the real protocol end to end: the kernel pends
//! the switch, the port "takes the interrupt" at the next preemption point
//! by calling [`PortToKernel::switch_context`] with the outgoing thread's
//! handle, and then hands the CPU token to the thread behind the returned
//! handle. A task's "stack pointer" is just its slot key in the port's
//! thread registry.
//!
//! Time is virtual. [`SimKernel::advance`] injects ticks one by one and
//! returns only after the kernel's tick path — including any context
//! switch it decided — has completed, which makes scenario tests
//! deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread;

use slab::Slab;
use spin::Mutex as SpinMutex;

use keel_kernel::{
    Kernel, Port, PortToKernel, Priority, StackRegion, TaskEntry, TaskId, TaskOptions,
};

/// One registered task thread. The slab key doubles as the task's saved
/// "stack pointer".
struct TaskThread {
    thread: thread::Thread,
}

/// Virtual CPU state.
struct VCpu {
    /// The thread currently holding the CPU; `None` until the first
    /// dispatch.
    owner: Option<thread::ThreadId>,
    /// Holder of the virtual interrupt-mask critical section. Unlike on
    /// real hardware, an outside observer (the test driver) may call
    /// kernel services too, so the mask is a re-entrant lock rather than a
    /// bare nesting counter.
    lock_holder: Option<thread::ThreadId>,
    lock_depth: u32,
    /// Tick interrupts waiting to be taken.
    pending_ticks: u32,
    /// Ticks fully processed, for the driver's handshake.
    ticks_done: u64,
    /// The deferred-switch interrupt is pended.
    switch_pending: bool,
    /// An event is being delivered; nested delivery is suppressed the same
    /// way a running handler keeps its own line masked.
    in_delivery: bool,
    threads: Slab<TaskThread>,
}

struct Shared {
    vcpu: Mutex<VCpu>,
    cond: Condvar,
    kernel: OnceLock<&'static dyn PortToKernel>,
    output: SpinMutex<Vec<u8>>,
}

/// The hosted port.
pub struct StdPort {
    shared: Arc<Shared>,
}

impl Default for StdPort {
    fn default() -> Self {
        Self::new()
    }
}

impl StdPort {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                vcpu: Mutex::new(VCpu {
                    owner: None,
                    lock_holder: None,
                    lock_depth: 0,
                    pending_ticks: 0,
                    ticks_done: 0,
                    switch_pending: false,
                    in_delivery: false,
                    threads: Slab::new(),
                }),
                cond: Condvar::new(),
                kernel: OnceLock::new(),
                output: SpinMutex::new(Vec::new()),
            }),
        }
    }

    fn kernel(&self) -> &'static dyn PortToKernel {
        *self.shared.kernel.get().expect("port not attached")
    }

    fn vcpu(&self) -> MutexGuard<'_, VCpu> {
        self.shared.vcpu.lock().unwrap()
    }

    /// `true` when the calling thread may take a pended event now.
    fn deliverable(c: &VCpu) -> bool {
        c.lock_holder.is_none()
            && !c.in_delivery
            && c.owner == Some(thread::current().id())
            && (c.pending_ticks > 0 || c.switch_pending)
    }

    /// Take pended events until none remain for this thread. May hand the
    /// CPU away and park; returns once the thread owns the CPU again with
    /// nothing left to deliver.
    fn deliver_pending(&self) {
        enum Ev {
            Tick,
            Switch,
        }
        loop {
            let ev = {
                let mut c = self.vcpu();
                if !Self::deliverable(&c) {
                    return;
                }
                if c.switch_pending {
                    c.switch_pending = false;
                    c.in_delivery = true;
                    Ev::Switch
                } else {
                    c.pending_ticks -= 1;
                    c.in_delivery = true;
                    Ev::Tick
                }
            };
            match ev {
                Ev::Tick => {
                    log::trace!("delivering tick");
                    self.kernel().tick();
                    // Commit a switch the tick decided before reporting the
                    // tick done, so the driver observes post-switch state.
                    let switched = {
                        let mut c = self.vcpu();
                        core::mem::replace(&mut c.switch_pending, false)
                    };
                    let handoff = if switched { self.begin_switch() } else { None };
                    {
                        let mut c = self.vcpu();
                        c.ticks_done += 1;
                        c.in_delivery = false;
                        self.shared.cond.notify_all();
                    }
                    if handoff.is_some() {
                        wait_until_owner(&self.shared);
                    }
                }
                Ev::Switch => {
                    let handoff = self.begin_switch();
                    {
                        let mut c = self.vcpu();
                        c.in_delivery = false;
                        self.shared.cond.notify_all();
                    }
                    if handoff.is_some() {
                        wait_until_owner(&self.shared);
                    }
                }
            }
        }
    }

    /// Run the deferred-switch handler. If the kernel elected another
    /// thread, transfer CPU ownership to it (the caller parks afterwards).
    fn begin_switch(&self) -> Option<usize> {
        let me = thread::current().id();
        let my_key = {
            let c = self.vcpu();
            c.threads
                .iter()
                .find(|(_, t)| t.thread.id() == me)
                .map(|(k, _)| k)
                .expect("switch from an unregistered thread")
        };
        let next = self.kernel().switch_context(my_key);
        if next == my_key {
            return None;
        }
        log::trace!("context switch: {my_key} -> {next}");
        {
            let mut c = self.vcpu();
            let target = c.threads[next].thread.id();
            c.owner = Some(target);
            self.shared.cond.notify_all();
        }
        Some(next)
    }
}

/// Block until the calling thread owns the virtual CPU.
fn wait_until_owner(shared: &Shared) {
    let me = thread::current().id();
    let mut c = shared.vcpu.lock().unwrap();
    while c.owner != Some(me) {
        c = shared.cond.wait(c).unwrap();
    }
}

impl Port for StdPort {
    fn attach(&self, kernel: &'static dyn PortToKernel) {
        self.shared
            .kernel
            .set(kernel)
            .unwrap_or_else(|_| panic!("port attached twice"));
    }

    fn enter_critical(&self) {
        // Pended interrupts fire just before the mask goes up, like on
        // hardware where they would have fired anywhere before this point.
        let me = thread::current().id();
        loop {
            let mut c = self.vcpu();
            if c.lock_holder == Some(me) {
                c.lock_depth += 1;
                return;
            }
            if c.lock_holder.is_some() {
                // Another context is inside the kernel; wait it out.
                let _guard = self.shared.cond.wait(c).unwrap();
                continue;
            }
            if Self::deliverable(&c) {
                drop(c);
                self.deliver_pending();
                continue;
            }
            c.lock_holder = Some(me);
            c.lock_depth = 1;
            return;
        }
    }

    fn exit_critical(&self) {
        let deliver = {
            let mut c = self.vcpu();
            debug_assert_eq!(
                c.lock_holder,
                Some(thread::current().id()),
                "unbalanced critical section"
            );
            c.lock_depth -= 1;
            if c.lock_depth > 0 {
                return;
            }
            c.lock_holder = None;
            self.shared.cond.notify_all();
            Self::deliverable(&c)
        };
        if deliver {
            self.deliver_pending();
        }
    }

    fn pend_switch(&self) {
        let mut c = self.vcpu();
        c.switch_pending = true;
        // An idle owner parked in `wait_for_interrupt` must see this.
        self.shared.cond.notify_all();
    }

    fn yield_now(&self) {
        let deliver = {
            let c = self.vcpu();
            Self::deliverable(&c)
        };
        if deliver {
            self.deliver_pending();
        }
    }

    fn init_task_stack(&self, _stack: StackRegion, entry: TaskEntry, param: usize) -> usize {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("keel-task-{param:#x}"))
            .spawn(move || task_thread_main(shared, entry, param))
            .expect("failed to spawn task thread");
        let key = self
            .vcpu()
            .threads
            .insert(TaskThread {
                thread: handle.thread().clone(),
            });
        log::trace!("registered task thread {key}");
        key
    }

    fn start_first_task(&self, sp: usize) -> ! {
        {
            let mut c = self.vcpu();
            let target = c.threads[sp].thread.id();
            c.owner = Some(target);
            self.shared.cond.notify_all();
        }
        // The boot context is done for good.
        loop {
            thread::park();
        }
    }

    fn wait_for_interrupt(&self) {
        {
            let mut c = self.vcpu();
            let me = thread::current().id();
            while !(c.owner == Some(me)
                && c.lock_holder.is_none()
                && (c.pending_ticks > 0 || c.switch_pending))
            {
                c = self.shared.cond.wait(c).unwrap();
            }
        }
        self.deliver_pending();
    }

    fn putc(&self, byte: u8) {
        self.shared.output.lock().push(byte);
    }
}

/// Body of every task thread: wait for the first dispatch, run the entry,
/// and trap forever if it returns (the task-exit sentinel).
fn task_thread_main(shared: Arc<Shared>, entry: TaskEntry, param: usize) {
    wait_until_owner(&shared);
    entry(param);
    log::warn!("task entry returned; trapping in the exit sentinel");
    loop {
        thread::park();
    }
}

/// Adapt a closure to the kernel's `fn(usize)` task entry convention.
///
/// The closure is boxed and leaked; the trampoline reclaims and runs it on
/// first (and only) use.
pub fn closure_entry(f: impl FnOnce() + Send + 'static) -> (TaskEntry, usize) {
    let boxed: Box<Box<dyn FnOnce() + Send + 'static>> = Box::new(Box::new(f));
    (closure_trampoline, Box::into_raw(boxed) as usize)
}

fn closure_trampoline(param: usize) {
    // Safety: `param` came out of `closure_entry`'s `Box::into_raw` and is
    // consumed exactly once (a task entry runs once).
    let f = unsafe { Box::from_raw(param as *mut Box<dyn FnOnce() + Send + 'static>) };
    f()
}

/// A kernel instance wired to a [`StdPort`] plus the virtual-time driver,
/// ready for scenario tests.
pub struct SimKernel {
    kernel: &'static Kernel<StdPort>,
    shared: Arc<Shared>,
    injected: AtomicU64,
}

impl SimKernel {
    /// Build and initialize a kernel with a heap of `heap_bytes`.
    pub fn new(heap_bytes: usize) -> Self {
        let port = StdPort::new();
        let shared = port.shared.clone();
        let kernel: &'static Kernel<StdPort> = Box::leak(Box::new(Kernel::new(port)));
        kernel
            .init(Box::leak(vec![0u8; heap_bytes].into_boxed_slice()))
            .expect("heap init failed");
        Self {
            kernel,
            shared,
            injected: AtomicU64::new(0),
        }
    }

    pub fn kernel(&self) -> &'static Kernel<StdPort> {
        self.kernel
    }

    /// Create a task from a closure.
    pub fn spawn(&self, name: &str, priority: Priority, f: impl FnOnce() + Send + 'static) -> TaskId {
        let (entry, param) = closure_entry(f);
        self.kernel
            .create_task(&TaskOptions {
                entry,
                param,
                priority,
                name,
                stack_size: 4096,
            })
            .expect("create_task failed")
    }

    /// Start the scheduler on a background boot thread; returns once the
    /// first task has been dispatched.
    pub fn start(&self) {
        let kernel = self.kernel;
        thread::Builder::new()
            .name("keel-boot".into())
            .spawn(move || kernel.start())
            .expect("failed to spawn boot thread");
        let mut c = self.shared.vcpu.lock().unwrap();
        while c.owner.is_none() {
            c = self.shared.cond.wait(c).unwrap();
        }
    }

    /// Inject `n` tick interrupts, one at a time. Each call returns only
    /// after the tick — and any context switch it caused — has been fully
    /// processed, so observations in between are deterministic.
    pub fn advance(&self, n: u32) {
        for _ in 0..n {
            let target = self.injected.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut c = self.shared.vcpu.lock().unwrap();
                c.pending_ticks += 1;
                self.shared.cond.notify_all();
            }
            let mut c = self.shared.vcpu.lock().unwrap();
            while !(c.ticks_done >= target && !c.switch_pending && !c.in_delivery) {
                c = self.shared.cond.wait(c).unwrap();
            }
        }
    }

    /// Everything the kernel printed so far.
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.shared.output.lock()).into_owned()
    }

    /// Name of the task currently holding the CPU.
    pub fn current_task_name(&self) -> String {
        let id = self.kernel.current_task().expect("no current task");
        self.kernel.task_name(id).expect("task vanished").to_string()
    }
}
