//! User hook registry.
//!
//! Five optional callbacks the kernel invokes at fixed points. The tick and
//! task-switch hooks run in interrupt context and must be short; the idle,
//! stack-overflow, and allocation-failure hooks run in the context that
//! triggered them. Registration passes `Some(f)`, unregistration `None`.

use crate::task::TaskId;
use crate::utils::Init;
use crate::{Kernel, Port};

pub type IdleHook = fn();
pub type TickHook = fn();
/// Called on every context switch with (outgoing, incoming).
pub type SwitchHook = fn(TaskId, TaskId);
pub type StackOverflowHook = fn(TaskId);
/// Called with the requested size when the heap cannot satisfy it.
pub type AllocFailedHook = fn(usize);

pub(crate) struct HookTable {
    pub(crate) idle: Option<IdleHook>,
    pub(crate) tick: Option<TickHook>,
    pub(crate) task_switch: Option<SwitchHook>,
    pub(crate) stack_overflow: Option<StackOverflowHook>,
    pub(crate) alloc_failed: Option<AllocFailedHook>,
}

impl Init for HookTable {
    const INIT: Self = Self {
        idle: None,
        tick: None,
        task_switch: None,
        stack_overflow: None,
        alloc_failed: None,
    };
}

impl<P: Port> Kernel<P> {
    pub fn set_idle_hook(&self, hook: Option<IdleHook>) {
        self.lock().hooks.idle = hook;
    }

    pub fn set_tick_hook(&self, hook: Option<TickHook>) {
        self.lock().hooks.tick = hook;
    }

    pub fn set_switch_hook(&self, hook: Option<SwitchHook>) {
        self.lock().hooks.task_switch = hook;
    }

    pub fn set_stack_overflow_hook(&self, hook: Option<StackOverflowHook>) {
        self.lock().hooks.stack_overflow = hook;
    }

    pub fn set_alloc_failed_hook(&self, hook: Option<AllocFailedHook>) {
        self.lock().hooks.alloc_failed = hook;
    }
}
