//! Tasks.
//!
//! Task control blocks live in a fixed arena and are addressed by [`TaskId`]
//! handles. A TCB embeds two link words: `state_link` enrolls it on exactly
//! one state list (a ready list, the delay list, the suspend list, or the
//! timed-wait list), and `event_link` enrolls it on the waiter list of at
//! most one IPC object. A task blocked with a deadline is therefore on two
//! lists at once; an endlessly blocked task only on the waiter list.

use arrayvec::ArrayString;

use crate::cfg::{ALIGN, PRIORITY_IDLE, TASK_NAME_CAPACITY, TASK_POOL_CAPACITY};
use crate::error::{Error, Result};
use crate::klock::KGuard;
use crate::sched;
use crate::time::{self, Tick, WAIT_FOREVER};
use crate::utils::index_list::{Link, ListAccessor, PoolIndex};
use crate::utils::{align_up, Init};
use crate::wait::WaitSrc;
use crate::{Kernel, KernelState, Port, StackRegion};

/// Task priority; numerically lower is more urgent, 0 is the most urgent.
pub type Priority = u8;

/// The entry function of a task, called with the task's creation parameter.
pub type TaskEntry = fn(usize);

/// Byte the kernel fills fresh stacks with; stack hygiene checks look for it.
pub(crate) const STACK_FILL: u8 = 0xA5;

/// Smallest stack the kernel will allocate.
const STACK_SIZE_MIN: usize = 64;

/// Stable handle of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u8);

impl TaskId {
    /// The arena slot behind this handle.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl PoolIndex for TaskId {
    fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Externally observable task states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// The arena slot is unused.
    Free,
    /// Runnable; on the ready list of its priority. The running task keeps
    /// this state and stays on its ready list.
    Ready,
    /// Sleeping until a wake-up tick; on the delay list.
    Delayed,
    /// Suspended by request; on the suspend list.
    Suspended,
    /// Waiting on an IPC object without a deadline.
    Blocked,
    /// Waiting on an IPC object with a deadline; also on the timed-wait
    /// list.
    BlockedTimeout,
}

/// Parameter bundle for [`Kernel::create_task`].
pub struct TaskOptions<'a> {
    pub entry: TaskEntry,
    pub param: usize,
    pub priority: Priority,
    pub name: &'a str,
    pub stack_size: usize,
}

/// Task control block.
pub(crate) struct TaskCb {
    pub(crate) state: TaskState,
    pub(crate) name: ArrayString<TASK_NAME_CAPACITY>,

    /// Effective priority; may be raised above `base_priority` by mutex
    /// priority inheritance (numerically lowered, never the other way).
    pub(crate) priority: Priority,
    pub(crate) base_priority: Priority,

    /// Link on the state list matching `state`.
    pub(crate) state_link: Option<Link<TaskId>>,
    /// Link on an IPC object's waiter list.
    pub(crate) event_link: Option<Link<TaskId>>,

    /// Which object the task is blocked on, while `Blocked`/`BlockedTimeout`.
    pub(crate) waiting_on: Option<WaitSrc>,
    /// Outcome of the last wait, set by the waker or the timeout scanner.
    pub(crate) wait_result: Result,
    /// Absolute wake-up tick, while `Delayed` or `BlockedTimeout`.
    pub(crate) wake_at: Tick,

    /// Saved stack pointer while not running.
    pub(crate) sp: usize,
    /// Heap offset of the stack's user area.
    pub(crate) stack_off: u32,
    pub(crate) stack_size: usize,

    /// Ticks spent running, accumulated at switch-out.
    pub(crate) run_ticks: Tick,
    pub(crate) last_switch_in: Tick,

    /// Head of the singly-linked list of mutexes this task holds, threaded
    /// through `MutexCb::next_held`.
    pub(crate) held_mutexes: Option<crate::mutex::MutexId>,
}

impl Init for TaskCb {
    const INIT: Self = Self {
        state: TaskState::Free,
        name: ArrayString::new_const(),
        priority: 0,
        base_priority: 0,
        state_link: None,
        event_link: None,
        waiting_on: None,
        wait_result: Ok(()),
        wake_at: 0,
        sp: 0,
        stack_off: 0,
        stack_size: 0,
        run_ticks: 0,
        last_switch_in: 0,
        held_mutexes: None,
    };
}

/// The task arena.
pub(crate) struct TaskPool {
    pub(crate) slots: [TaskCb; TASK_POOL_CAPACITY],
}

impl Init for TaskPool {
    const INIT: Self = Self { slots: Init::INIT };
}

impl TaskPool {
    fn free_slot(&self) -> Option<TaskId> {
        self.slots
            .iter()
            .position(|t| t.state == TaskState::Free)
            .map(|i| TaskId(i as u8))
    }
}

impl core::ops::Index<TaskId> for TaskPool {
    type Output = TaskCb;

    fn index(&self, id: TaskId) -> &TaskCb {
        &self.slots[id.as_index()]
    }
}

impl core::ops::IndexMut<TaskId> for TaskPool {
    fn index_mut(&mut self, id: TaskId) -> &mut TaskCb {
        &mut self.slots[id.as_index()]
    }
}

/// Fail with `TaskNotFound` unless `id` names a live task.
pub(crate) fn live_task(st: &KernelState, id: TaskId) -> Result {
    if id.as_index() >= TASK_POOL_CAPACITY || st.tasks[id].state == TaskState::Free {
        Err(Error::TaskNotFound)
    } else {
        Ok(())
    }
}

/// `true` if the low-address watch window of the task's stack was written.
pub(crate) fn stack_prefix_dirty(st: &KernelState, id: TaskId) -> bool {
    let t = &st.tasks[id];
    let n = t.stack_size.min(16);
    st.heap
        .user_slice_ref(t.stack_off, n)
        .iter()
        .any(|&b| b != STACK_FILL)
}

impl<P: Port> Kernel<P> {
    /// Create a task and make it ready. Preempts immediately if the new
    /// task outranks the running one.
    pub fn create_task(&self, options: &TaskOptions<'_>) -> Result<TaskId> {
        if options.priority > PRIORITY_IDLE {
            return Err(Error::OutOfRange);
        }
        if options.priority == PRIORITY_IDLE {
            // The lowest level belongs to the idle task.
            return Err(Error::PriorityConflict);
        }
        if options.name.len() > TASK_NAME_CAPACITY || options.stack_size == 0 {
            return Err(Error::InvalidParam);
        }

        let mut g = self.lock();
        if !g.heap.is_initialized() {
            return Err(Error::InvalidState);
        }
        match self.spawn(
            &mut g,
            options.entry,
            options.param,
            options.priority,
            options.name,
            options.stack_size,
        ) {
            Ok(id) => {
                if g.started {
                    self.reschedule_locked(&mut g);
                }
                Ok(id)
            }
            Err(e @ Error::OutOfMemory) => {
                let hook = g.hooks.alloc_failed;
                let size = options.stack_size;
                drop(g);
                if let Some(h) = hook {
                    h(size);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Allocate and initialize a TCB and its stack; enters the ready list.
    pub(crate) fn spawn(
        &self,
        g: &mut KGuard<'_, P>,
        entry: TaskEntry,
        param: usize,
        priority: Priority,
        name: &str,
        stack_size: usize,
    ) -> Result<TaskId> {
        let name = ArrayString::from(name).map_err(|_| Error::InvalidParam)?;
        let stack_size = align_up(stack_size.max(STACK_SIZE_MIN), ALIGN);
        let id = g.tasks.free_slot().ok_or(Error::NoResource)?;
        let stack_off = g.heap.alloc(stack_size)?;
        g.heap.user_slice(stack_off, stack_size).fill(STACK_FILL);

        let base = g.heap.base_ptr().wrapping_add(stack_off as usize);
        let sp = self
            .port
            .init_task_stack(StackRegion { base, size: stack_size }, entry, param);

        let st = &mut **g;
        let t = &mut st.tasks[id];
        t.name = name;
        t.priority = priority;
        t.base_priority = priority;
        t.state_link = None;
        t.event_link = None;
        t.waiting_on = None;
        t.wait_result = Ok(());
        t.wake_at = 0;
        t.sp = sp;
        t.stack_off = stack_off;
        t.stack_size = stack_size;
        t.run_ticks = 0;
        t.last_switch_in = 0;
        t.held_mutexes = None;

        sched::ready_insert(&mut st.sched, &mut st.tasks, id);
        Ok(id)
    }

    /// Put the running task to sleep for `ticks` ticks.
    pub fn delay(&self, ticks: u32) -> Result {
        if ticks == 0 || ticks == WAIT_FOREVER {
            return Err(Error::InvalidParam);
        }
        time::check_timeout(ticks)?;

        let mut g = self.lock();
        if !g.started {
            return Err(Error::InvalidState);
        }
        let cur = g.sched.current.ok_or(Error::InvalidState)?;
        if g.sched.suspend_nesting > 0 {
            // Sleeping while switches are deferred would leave the runner
            // in a dead end.
            return Err(Error::InvalidState);
        }
        {
            let st = &mut *g;
            sched::ready_remove(&mut st.sched, &mut st.tasks, cur);
            st.tasks[cur].state = TaskState::Delayed;
            st.tasks[cur].wake_at = st.time.current.wrapping_add(ticks);
            ListAccessor::new(&mut st.sched.delayed, &mut st.tasks.slots, |t: &mut TaskCb| {
                &mut t.state_link
            })
            .push_back(cur);
        }
        self.reschedule_locked(&mut g);
        let _g = self.wait_until_woken(g, cur);
        Ok(())
    }

    /// Offer the CPU to an equal-priority peer.
    pub fn yield_now(&self) -> Result {
        let mut g = self.lock();
        if g.started {
            self.reschedule_locked(&mut g);
        }
        Ok(())
    }

    /// Suspend a task. Suspending the running task blocks until resumed;
    /// only Ready tasks (or the runner) can be suspended.
    pub fn suspend_task(&self, id: TaskId) -> Result {
        let mut g = self.lock();
        live_task(&g, id)?;
        if g.tasks[id].state != TaskState::Ready {
            return Err(Error::InvalidState);
        }
        let is_self = g.sched.current == Some(id);
        if is_self && g.sched.suspend_nesting > 0 {
            return Err(Error::InvalidState);
        }
        {
            let st = &mut *g;
            sched::ready_remove(&mut st.sched, &mut st.tasks, id);
            st.tasks[id].state = TaskState::Suspended;
            ListAccessor::new(&mut st.sched.suspended, &mut st.tasks.slots, |t: &mut TaskCb| {
                &mut t.state_link
            })
            .push_back(id);
        }
        self.reschedule_locked(&mut g);
        if is_self {
            let _g = self.wait_until_woken(g, id);
        }
        Ok(())
    }

    /// Make a suspended task ready again.
    pub fn resume_task(&self, id: TaskId) -> Result {
        let mut g = self.lock();
        live_task(&g, id)?;
        if g.tasks[id].state != TaskState::Suspended {
            return Err(Error::InvalidState);
        }
        {
            let st = &mut *g;
            ListAccessor::new(&mut st.sched.suspended, &mut st.tasks.slots, |t: &mut TaskCb| {
                &mut t.state_link
            })
            .remove(id);
            sched::ready_insert(&mut st.sched, &mut st.tasks, id);
        }
        if g.started {
            self.reschedule_locked(&mut g);
        }
        Ok(())
    }

    /// Handle of the running task.
    pub fn current_task(&self) -> Result<TaskId> {
        self.lock().sched.current.ok_or(Error::TaskNotFound)
    }

    pub fn task_state(&self, id: TaskId) -> Result<TaskState> {
        let g = self.lock();
        live_task(&g, id)?;
        Ok(g.tasks[id].state)
    }

    pub fn task_name(&self, id: TaskId) -> Result<ArrayString<TASK_NAME_CAPACITY>> {
        let g = self.lock();
        live_task(&g, id)?;
        Ok(g.tasks[id].name)
    }

    /// Effective priority, inheritance boosts included.
    pub fn task_priority(&self, id: TaskId) -> Result<Priority> {
        let g = self.lock();
        live_task(&g, id)?;
        Ok(g.tasks[id].priority)
    }

    /// Creation-time (base) priority.
    pub fn task_base_priority(&self, id: TaskId) -> Result<Priority> {
        let g = self.lock();
        live_task(&g, id)?;
        Ok(g.tasks[id].base_priority)
    }

    /// Change a task's base priority. An inheritance boost in effect stays
    /// in force unless the new base outranks it.
    pub fn set_task_priority(&self, id: TaskId, priority: Priority) -> Result {
        if priority > PRIORITY_IDLE {
            return Err(Error::OutOfRange);
        }
        if priority == PRIORITY_IDLE {
            return Err(Error::PriorityConflict);
        }
        let mut g = self.lock();
        live_task(&g, id)?;
        {
            let st = &mut *g;
            let boosted = st.tasks[id].priority != st.tasks[id].base_priority;
            st.tasks[id].base_priority = priority;
            if !boosted || priority < st.tasks[id].priority {
                sched::set_effective_priority(st, id, priority);
            }
        }
        if g.started {
            self.reschedule_locked(&mut g);
        }
        Ok(())
    }

    /// Scan the low-address watch window of a task's stack; invokes the
    /// stack-overflow hook and reports `true` when it was overwritten.
    pub fn check_stack_overflow(&self, id: TaskId) -> Result<bool> {
        let g = self.lock();
        live_task(&g, id)?;
        let dirty = stack_prefix_dirty(&g, id);
        let hook = g.hooks.stack_overflow;
        drop(g);
        if dirty {
            if let Some(h) = hook {
                h(id);
            }
        }
        Ok(dirty)
    }

    /// Bytes of the task's stack that have ever been written.
    pub fn stack_usage(&self, id: TaskId) -> Result<usize> {
        let g = self.lock();
        live_task(&g, id)?;
        let t = &g.tasks[id];
        let untouched = g
            .heap
            .user_slice_ref(t.stack_off, t.stack_size)
            .iter()
            .take_while(|&&b| b == STACK_FILL)
            .count();
        Ok(t.stack_size - untouched)
    }

    /// CPU time of the task in 1/10000 of total run time.
    pub fn cpu_usage_permyriad(&self, id: TaskId) -> Result<u32> {
        let g = self.lock();
        live_task(&g, id)?;
        let total = g.time.total_run;
        if total == 0 {
            return Ok(0);
        }
        Ok(((g.tasks[id].run_ticks as u64 * 10_000) / total as u64) as u32)
    }

    /// Spin through the deferred switch until this task is running again.
    ///
    /// Mirrors the hardware flow: dropping the guard unmasks interrupts, so
    /// the pended switch fires; when the task is dispatched again the loop
    /// observes itself as current and returns with a fresh guard.
    pub(crate) fn wait_until_woken<'a>(
        &'a self,
        mut g: KGuard<'a, P>,
        id: TaskId,
    ) -> KGuard<'a, P> {
        loop {
            drop(g);
            self.port.yield_now();
            g = self.lock();
            if g.sched.current == Some(id) {
                return g;
            }
        }
    }
}
