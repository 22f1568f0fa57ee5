//! A small priority-preemptive RTOS kernel.
//!
//! The kernel is an explicit object, [`Kernel`], generic over a [`Port`]
//! supplying the handful of operations only the target hardware can do:
//! masking interrupts, pending the deferred context-switch interrupt,
//! building initial exception frames, dispatching the first task, and
//! character output. Everything else — task states, the priority-bitmap
//! scheduler with round-robin slicing, the first-fit heap, counting
//! semaphores, recursive mutexes with chained priority inheritance, bounded
//! message queues, and software timers — is portable code living behind the
//! kernel's single critical section.
//!
//! A port's interrupt handlers call back into the kernel through
//! [`PortToKernel`]: the periodic tick ISR invokes [`PortToKernel::tick`]
//! and the deferred-switch ISR invokes [`PortToKernel::switch_context`]
//! around its register save/restore.
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod kprint;

mod cfg;
mod error;
mod heap;
mod hooks;
mod klock;
mod mutex;
mod queue;
mod sched;
mod semaphore;
mod task;
mod time;
mod timer;
mod utils;
mod wait;

pub use cfg::*;
pub use error::{Error, Result};
pub use heap::HeapStats;
pub use hooks::{AllocFailedHook, IdleHook, StackOverflowHook, SwitchHook, TickHook};
pub use mutex::MutexId;
pub use queue::QueueId;
pub use semaphore::SemaphoreId;
pub use task::{Priority, TaskEntry, TaskId, TaskOptions, TaskState};
pub use time::{Tick, TIMEOUT_MAX, WAIT_FOREVER};
pub use timer::{TimerHandler, TimerId, TimerMode};

use utils::Init;

/// A task stack handed to [`Port::init_task_stack`].
#[derive(Clone, Copy, Debug)]
pub struct StackRegion {
    /// Lowest address of the stack.
    pub base: *mut u8,
    /// Size in bytes.
    pub size: usize,
}

/// The hardware abstraction consumed by the kernel.
///
/// Implementations must make [`enter_critical`]/[`exit_critical`] behave as
/// a reentrant interrupt-priority mask: while the outermost section is open,
/// no kernel-calling interrupt may run and no context switch may occur.
/// [`pend_switch`] asserts the lowest-priority software interrupt whose
/// handler performs the register save/restore around
/// [`PortToKernel::switch_context`].
///
/// [`enter_critical`]: Port::enter_critical
/// [`exit_critical`]: Port::exit_critical
/// [`pend_switch`]: Port::pend_switch
pub trait Port: Send + Sync + Sized + 'static {
    fn enter_critical(&self);
    fn exit_critical(&self);
    fn pend_switch(&self);

    /// Build the initial exception frame on `stack` so that dispatching the
    /// returned stack pointer enters `entry(param)`, with a return landing
    /// in the port's task-exit sentinel (which masks interrupts and stops).
    fn init_task_stack(&self, stack: StackRegion, entry: TaskEntry, param: usize) -> usize;

    /// Dispatch the very first task. Never returns.
    fn start_first_task(&self, sp: usize) -> !;

    /// Give a pending deferred switch a chance to run now. On hardware the
    /// pended interrupt fires as soon as the mask drops, so this is a no-op;
    /// simulation ports drain their pending events here.
    fn yield_now(&self) {}

    /// Idle-loop body; typically a wait-for-interrupt instruction.
    fn wait_for_interrupt(&self) {}

    /// Emit one byte of console output.
    fn putc(&self, byte: u8);

    /// Called once from [`Kernel::start`] so interrupt-side code can reach
    /// the kernel entry points.
    fn attach(&self, kernel: &'static dyn PortToKernel) {
        let _ = kernel;
    }
}

/// Kernel entry points invoked from the port's interrupt handlers.
pub trait PortToKernel: Sync {
    /// The periodic tick: advances time, wakes expired waits, applies
    /// round-robin, and drives the software timers.
    fn tick(&self);

    /// The deferred-switch handler body. Receives the outgoing task's saved
    /// stack pointer and returns the incoming task's.
    fn switch_context(&self, outgoing_sp: usize) -> usize;
}

/// All mutable kernel state, guarded by the critical section.
pub(crate) struct KernelState {
    pub(crate) time: time::Clock,
    pub(crate) heap: heap::Heap,
    pub(crate) tasks: task::TaskPool,
    pub(crate) sched: sched::Scheduler,
    pub(crate) semaphores: [semaphore::SemaphoreCb; SEMAPHORE_POOL_CAPACITY],
    pub(crate) mutexes: [mutex::MutexCb; MUTEX_POOL_CAPACITY],
    pub(crate) queues: [queue::QueueCb; QUEUE_POOL_CAPACITY],
    pub(crate) timers: timer::TimerWheel,
    pub(crate) hooks: hooks::HookTable,
    pub(crate) started: bool,
}

impl Init for KernelState {
    const INIT: Self = Self {
        time: Init::INIT,
        heap: Init::INIT,
        tasks: Init::INIT,
        sched: Init::INIT,
        semaphores: Init::INIT,
        mutexes: Init::INIT,
        queues: Init::INIT,
        timers: Init::INIT,
        hooks: Init::INIT,
        started: false,
    };
}

/// The kernel.
pub struct Kernel<P: Port> {
    pub(crate) port: P,
    pub(crate) state: klock::KLock<KernelState>,
}

impl<P: Port> Kernel<P> {
    pub const fn new(port: P) -> Self {
        Self {
            port,
            state: klock::KLock::new(KernelState::INIT),
        }
    }

    /// Bring the subsystems up. `heap_region` becomes the kernel heap, from
    /// which task stacks and queue buffers are carved.
    pub fn init(&self, heap_region: &'static mut [u8]) -> Result {
        let mut g = self.lock();
        if g.heap.is_initialized() {
            return Err(Error::InvalidState);
        }
        g.heap.init(heap_region)
        // The remaining subsystems are const-initialized; their pools start
        // with every slot unused.
    }

    /// Create the idle task, elect the first task, and hand the CPU to it.
    ///
    /// Panics if [`init`](Kernel::init) has not run. Never returns.
    pub fn start(&'static self) -> ! {
        self.port.attach(self);
        let first_sp = {
            let mut g = self.lock();
            assert!(g.heap.is_initialized(), "kernel not initialized");
            assert!(!g.started, "scheduler already started");

            self.spawn(
                &mut g,
                idle_entry::<P>,
                self as *const Self as usize,
                PRIORITY_IDLE,
                "idle",
                IDLE_STACK_SIZE,
            )
            .expect("failed to create the idle task");

            let st = &mut *g;
            let first = sched::highest_ready(&st.sched).expect("no ready task");
            st.sched.current = Some(first);
            st.tasks[first].last_switch_in = st.time.total_run;
            st.started = true;
            st.tasks[first].sp
        };
        self.port.start_first_task(first_sp)
    }

    /// The port backing this kernel.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Current kernel time in ticks.
    pub fn time(&self) -> Tick {
        self.lock().time.current
    }

    /// Allocate from the kernel heap. A zero-size request yields a null
    /// pointer; exhaustion reports [`Error::OutOfMemory`] after invoking
    /// the allocation-failure hook.
    pub fn alloc(&self, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Ok(core::ptr::null_mut());
        }
        let mut g = self.lock();
        if !g.heap.is_initialized() {
            return Err(Error::InvalidState);
        }
        match g.heap.alloc(size) {
            Ok(off) => Ok(g.heap.base_ptr().wrapping_add(off as usize)),
            Err(e) => {
                let hook = g.hooks.alloc_failed;
                drop(g);
                if let Some(h) = hook {
                    h(size);
                }
                Err(e)
            }
        }
    }

    /// Return a block to the kernel heap. Freeing null is a no-op.
    pub fn free(&self, ptr: *mut u8) -> Result {
        if ptr.is_null() {
            return Ok(());
        }
        let mut g = self.lock();
        if !g.heap.is_initialized() {
            return Err(Error::InvalidState);
        }
        let base = g.heap.base_ptr() as usize;
        let off = (ptr as usize)
            .checked_sub(base)
            .filter(|&o| o <= u32::MAX as usize)
            .ok_or(Error::MemoryCorruption)?;
        g.heap.free(off as u32)
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.lock().heap.stats()
    }
}

impl<P: Port> PortToKernel for Kernel<P> {
    fn tick(&self) {
        self.tick_impl();
    }

    fn switch_context(&self, outgoing_sp: usize) -> usize {
        self.switch_context_impl(outgoing_sp)
    }
}

/// Body of the idle task: run the idle hook and sleep until an interrupt.
fn idle_entry<P: Port>(param: usize) {
    // Safety: `param` is the address of the 'static kernel that created the
    // idle task in `Kernel::start`.
    let kernel = unsafe { &*(param as *const Kernel<P>) };
    loop {
        let hook = kernel.lock().hooks.idle;
        if let Some(h) = hook {
            h();
        }
        kernel.port.wait_for_interrupt();
    }
}
