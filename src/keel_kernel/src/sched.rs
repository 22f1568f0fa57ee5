//! The scheduler.
//!
//! Selection is O(1): the active bitmap has one bit per priority level, and
//! the next task is the head of the first non-empty ready list. Every state
//! change that may alter the ready set funnels through
//! [`Kernel::reschedule_locked`] (or the tick's slice-gated variant), which
//! recomputes the scheduling decision and, when the winner differs from the
//! running task, records it in `switch_next` and pends the deferred switch.
//! The switch handler consumes `switch_next`; a stale pend with no decision
//! left is a no-op.

use arrayvec::ArrayVec;

use crate::cfg::{PRIORITY_COUNT, ROUND_ROBIN_SLICE, TASK_POOL_CAPACITY};
use crate::error::{Error, Result};
use crate::klock::KGuard;
use crate::task::{TaskCb, TaskId, TaskPool, TaskState};
use crate::time;
use crate::utils::index_list::{ListAccessor, ListHead};
use crate::utils::prio_bitmap::PrioBitmap;
use crate::utils::Init;
use crate::wait;
use crate::{Kernel, KernelState, Port};

pub(crate) struct Scheduler {
    /// Per-priority ready lists. The running task stays on its list.
    pub(crate) ready: [ListHead<TaskId>; PRIORITY_COUNT],
    /// Bit `i` set iff `ready[i]` is non-empty.
    pub(crate) ready_bitmap: PrioBitmap,

    pub(crate) delayed: ListHead<TaskId>,
    pub(crate) suspended: ListHead<TaskId>,
    /// Tasks blocked on an IPC object with a deadline.
    pub(crate) timed_wait: ListHead<TaskId>,

    /// The running task.
    pub(crate) current: Option<TaskId>,
    /// The task the pended deferred switch will dispatch.
    pub(crate) switch_next: Option<TaskId>,

    pub(crate) suspend_nesting: u32,
    pub(crate) resched_pending: bool,
    pub(crate) slice_left: u32,
}

impl Init for Scheduler {
    const INIT: Self = Self {
        ready: Init::INIT,
        ready_bitmap: Init::INIT,
        delayed: Init::INIT,
        suspended: Init::INIT,
        timed_wait: Init::INIT,
        current: None,
        switch_next: None,
        suspend_nesting: 0,
        resched_pending: false,
        slice_left: ROUND_ROBIN_SLICE,
    };
}

/// Link a task onto the ready list of its priority and mark it Ready.
pub(crate) fn ready_insert(sched: &mut Scheduler, tasks: &mut TaskPool, id: TaskId) {
    let prio = tasks[id].priority as usize;
    ListAccessor::new(&mut sched.ready[prio], &mut tasks.slots, |t: &mut TaskCb| {
        &mut t.state_link
    })
    .push_back(id);
    sched.ready_bitmap.set(prio);
    tasks[id].state = TaskState::Ready;
    debug_assert!(sched.ready_bitmap.get(prio) && !sched.ready[prio].is_empty());
}

/// Unlink a task from its ready list; the caller assigns the next state.
pub(crate) fn ready_remove(sched: &mut Scheduler, tasks: &mut TaskPool, id: TaskId) {
    let prio = tasks[id].priority as usize;
    let mut acc = ListAccessor::new(&mut sched.ready[prio], &mut tasks.slots, |t: &mut TaskCb| {
        &mut t.state_link
    });
    acc.remove(id);
    let empty = acc.is_empty();
    drop(acc);
    if empty {
        sched.ready_bitmap.clear(prio);
    }
    debug_assert_eq!(sched.ready_bitmap.get(prio), !sched.ready[prio].is_empty());
}

/// Head of the first non-empty ready list.
pub(crate) fn highest_ready(sched: &Scheduler) -> Option<TaskId> {
    sched
        .ready_bitmap
        .find_first_set()
        .and_then(|p| sched.ready[p].front())
}

/// Change a task's effective priority, repositioning it on whichever
/// priority-ordered structure it currently occupies.
pub(crate) fn set_effective_priority(st: &mut KernelState, id: TaskId, new: u8) {
    if st.tasks[id].priority == new {
        return;
    }
    match st.tasks[id].state {
        TaskState::Ready => {
            ready_remove(&mut st.sched, &mut st.tasks, id);
            st.tasks[id].priority = new;
            ready_insert(&mut st.sched, &mut st.tasks, id);
        }
        TaskState::Blocked | TaskState::BlockedTimeout => {
            st.tasks[id].priority = new;
            wait::requeue_waiter(st, id);
        }
        _ => st.tasks[id].priority = new,
    }
}

impl<P: Port> Kernel<P> {
    /// Record a switch decision and pend the deferred switch interrupt.
    fn request_switch(&self, st: &mut KernelState, next: TaskId) {
        if st.sched.current == Some(next) {
            return;
        }
        st.sched.switch_next = Some(next);
        self.port.pend_switch();
    }

    /// The scheduling decision, entered from task code and IPC operations.
    ///
    /// With the scheduler suspended the request is only latched. Otherwise:
    /// a higher-priority ready task preempts; an equal-priority peer
    /// triggers rotation (the runner goes to the tail and the new head
    /// takes over) unless the runner is alone on its list.
    pub(crate) fn reschedule_locked(&self, g: &mut KGuard<'_, P>) {
        let st = &mut **g;
        if !st.started {
            return;
        }
        if st.sched.suspend_nesting > 0 {
            st.sched.resched_pending = true;
            return;
        }
        // Recompute from scratch; a previously recorded decision may have
        // been invalidated by the state change that brought us here.
        st.sched.switch_next = None;

        let Some(next_prio) = st.sched.ready_bitmap.find_first_set() else {
            return;
        };
        let cur = st.sched.current;
        let cur_is_ready = cur.map_or(false, |c| st.tasks[c].state == TaskState::Ready);
        match cur {
            Some(c) if cur_is_ready => {
                let cur_prio = st.tasks[c].priority as usize;
                if next_prio != cur_prio {
                    if let Some(n) = st.sched.ready[next_prio].front() {
                        self.request_switch(st, n);
                    }
                } else if !single_ready_task(&st.sched, cur_prio, c) {
                    ListAccessor::new(
                        &mut st.sched.ready[cur_prio],
                        &mut st.tasks.slots,
                        |t: &mut TaskCb| &mut t.state_link,
                    )
                    .move_to_back(c);
                    if let Some(n) = st.sched.ready[cur_prio].front() {
                        self.request_switch(st, n);
                    }
                }
            }
            _ => {
                // The runner is gone or no longer runnable.
                if let Some(n) = st.sched.ready[next_prio].front() {
                    self.request_switch(st, n);
                }
            }
        }
    }

    /// The tick handler: advance time, wake expired delays and timed waits,
    /// then apply the slice-gated scheduling decision. Outside the critical
    /// section, drive the software timers and the tick hook.
    pub(crate) fn tick_impl(&self) {
        let mut g = self.lock();
        if g.sched.suspend_nesting == 0 {
            {
                let st = &mut *g;
                st.time.current = st.time.current.wrapping_add(1);
                st.time.total_run = st.time.total_run.wrapping_add(1);
                let now = st.time.current;

                // Wake delayed tasks whose time has come.
                let due = scan_due(&mut st.sched.delayed, &mut st.tasks, now);
                for id in due {
                    ListAccessor::new(
                        &mut st.sched.delayed,
                        &mut st.tasks.slots,
                        |t: &mut TaskCb| &mut t.state_link,
                    )
                    .remove(id);
                    ready_insert(&mut st.sched, &mut st.tasks, id);
                }

                // Expire timed waits: leave the event queue, flag the
                // timeout, and make the task ready.
                let expired = scan_due(&mut st.sched.timed_wait, &mut st.tasks, now);
                for id in expired {
                    ListAccessor::new(
                        &mut st.sched.timed_wait,
                        &mut st.tasks.slots,
                        |t: &mut TaskCb| &mut t.state_link,
                    )
                    .remove(id);
                    wait::leave_event_queue(st, id);
                    st.tasks[id].waiting_on = None;
                    st.tasks[id].wait_result = Err(Error::Timeout);
                    ready_insert(&mut st.sched, &mut st.tasks, id);
                }
            }
            self.tick_schedule(&mut g);
        }
        drop(g);

        self.run_expired_timers();

        let hook = self.lock().hooks.tick;
        if let Some(h) = hook {
            h();
        }
    }

    /// Like [`reschedule_locked`](Self::reschedule_locked), but rotation
    /// among equal-priority peers is gated by the round-robin slice.
    fn tick_schedule(&self, g: &mut KGuard<'_, P>) {
        let st = &mut **g;
        if !st.started {
            return;
        }
        st.sched.switch_next = None;

        let Some(next_prio) = st.sched.ready_bitmap.find_first_set() else {
            return;
        };
        let cur = st.sched.current;
        let cur_is_ready = cur.map_or(false, |c| st.tasks[c].state == TaskState::Ready);
        match cur {
            Some(c) if cur_is_ready => {
                let cur_prio = st.tasks[c].priority as usize;
                if next_prio != cur_prio {
                    if let Some(n) = st.sched.ready[next_prio].front() {
                        self.request_switch(st, n);
                    }
                } else if single_ready_task(&st.sched, cur_prio, c) {
                    st.sched.slice_left = ROUND_ROBIN_SLICE;
                } else {
                    st.sched.slice_left = st.sched.slice_left.saturating_sub(1);
                    if st.sched.slice_left == 0 {
                        st.sched.slice_left = ROUND_ROBIN_SLICE;
                        ListAccessor::new(
                            &mut st.sched.ready[cur_prio],
                            &mut st.tasks.slots,
                            |t: &mut TaskCb| &mut t.state_link,
                        )
                        .move_to_back(c);
                        if let Some(n) = st.sched.ready[cur_prio].front() {
                            self.request_switch(st, n);
                        }
                    }
                }
            }
            _ => {
                if let Some(n) = st.sched.ready[next_prio].front() {
                    self.request_switch(st, n);
                }
            }
        }
    }

    /// The deferred-switch handler body. The shim saves callee-saved
    /// registers, hands in the outgoing stack pointer, and restores from
    /// the one returned.
    pub(crate) fn switch_context_impl(&self, outgoing_sp: usize) -> usize {
        let mut g = self.lock();
        let st = &mut *g;
        let Some(next) = st.sched.switch_next.take() else {
            return outgoing_sp;
        };
        let prev = st.sched.current;
        if prev == Some(next) {
            return outgoing_sp;
        }

        let now = st.time.total_run;
        let mut overflowed = None;
        if let Some(p) = prev {
            st.tasks[p].sp = outgoing_sp;
            let ran = now.wrapping_sub(st.tasks[p].last_switch_in);
            st.tasks[p].run_ticks = st.tasks[p].run_ticks.wrapping_add(ran);
            if crate::task::stack_prefix_dirty(st, p) {
                overflowed = Some(p);
            }
        }
        st.tasks[next].last_switch_in = now;
        st.sched.current = Some(next);
        let incoming_sp = st.tasks[next].sp;

        let switch_hook = st.hooks.task_switch;
        let overflow_hook = st.hooks.stack_overflow;
        drop(g);

        if let (Some(h), Some(p)) = (switch_hook, prev) {
            h(p, next);
        }
        if let (Some(h), Some(t)) = (overflow_hook, overflowed) {
            h(t);
        }
        incoming_sp
    }

    /// Defer all context switches until the matching resume.
    pub fn suspend_scheduler(&self) {
        self.lock().sched.suspend_nesting += 1;
    }

    /// Undo one [`suspend_scheduler`](Self::suspend_scheduler); the
    /// outermost resume performs any scheduling request that arrived in
    /// between.
    pub fn resume_scheduler(&self) -> Result {
        let mut g = self.lock();
        if g.sched.suspend_nesting == 0 {
            return Err(Error::InvalidState);
        }
        g.sched.suspend_nesting -= 1;
        if g.sched.suspend_nesting == 0 && g.sched.resched_pending {
            g.sched.resched_pending = false;
            self.reschedule_locked(&mut g);
        }
        Ok(())
    }
}

/// `true` iff `c` is the only task on ready list `prio`.
fn single_ready_task(sched: &Scheduler, prio: usize, c: TaskId) -> bool {
    sched.ready[prio].first == Some(c) && sched.ready[prio].last == Some(c)
}

/// Collect the tasks on `list` whose wake-up tick has been reached.
fn scan_due(
    list: &mut ListHead<TaskId>,
    tasks: &mut TaskPool,
    now: time::Tick,
) -> ArrayVec<TaskId, TASK_POOL_CAPACITY> {
    let mut due = ArrayVec::new();
    let mut acc = ListAccessor::new(list, &mut tasks.slots, |t: &mut TaskCb| &mut t.state_link);
    let mut cur = acc.front();
    while let Some(id) = cur {
        cur = acc.next(id);
        if time::reached(now, acc.node(id).wake_at) {
            due.push(id);
        }
    }
    due
}
