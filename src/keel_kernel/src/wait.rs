//! Event wait queues.
//!
//! Every IPC object owns a waiter list threaded through the TCB's
//! `event_link`. Insertion is priority-ordered (most urgent at the head,
//! FIFO among equals) and wake-up always pops the head, so wakeups are
//! observed in priority order.
//!
//! Blocking with a deadline additionally enrolls the task on the scheduler's
//! timed-wait list via `state_link`; the tick scanner is the only
//! cancellation vector and reports `Error::Timeout` through the TCB's
//! `wait_result`.

use crate::klock::KGuard;
use crate::mutex::MutexId;
use crate::queue::QueueId;
use crate::semaphore::SemaphoreId;
use crate::sched;
use crate::task::{TaskCb, TaskId, TaskState};
use crate::time::Tick;
use crate::utils::index_list::{ListAccessor, ListHead};
use crate::{Error, Kernel, KernelState, Port, Result};

/// The object a blocked task is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitSrc {
    Semaphore(SemaphoreId),
    Mutex(MutexId),
    QueueRead(QueueId),
    QueueWrite(QueueId),
}

/// Insert `id` into `queue` ordered by effective priority, after all
/// equal-priority waiters already present.
pub(crate) fn enqueue_by_priority(
    queue: &mut ListHead<TaskId>,
    tasks: &mut crate::task::TaskPool,
    id: TaskId,
) {
    let prio = tasks[id].priority;
    let mut acc = ListAccessor::new(queue, &mut tasks.slots, |t: &mut TaskCb| &mut t.event_link);
    let mut insert_at = None;
    let mut cur = acc.front();
    while let Some(c) = cur {
        if acc.node(c).priority > prio {
            insert_at = Some(c);
            break;
        }
        cur = acc.next(c);
    }
    match insert_at {
        Some(at) => acc.insert_before(id, at),
        None => acc.push_back(id),
    }
}

/// Project the waiter list the task is enrolled on out of the kernel state,
/// apply `f` to it, and hand the task pool alongside.
fn with_event_queue<R>(
    st: &mut KernelState,
    src: WaitSrc,
    f: impl FnOnce(&mut ListHead<TaskId>, &mut crate::task::TaskPool) -> R,
) -> R {
    match src {
        WaitSrc::Semaphore(i) => f(&mut st.semaphores[i.as_index()].wait_queue, &mut st.tasks),
        WaitSrc::Mutex(i) => f(&mut st.mutexes[i.as_index()].wait_queue, &mut st.tasks),
        WaitSrc::QueueRead(i) => f(&mut st.queues[i.as_index()].reader_queue, &mut st.tasks),
        WaitSrc::QueueWrite(i) => f(&mut st.queues[i.as_index()].writer_queue, &mut st.tasks),
    }
}

/// Remove a blocked task from the waiter list it is on (timeout/cancel
/// path; the waker path pops the head itself).
pub(crate) fn leave_event_queue(st: &mut KernelState, id: TaskId) {
    let Some(src) = st.tasks[id].waiting_on else {
        return;
    };
    with_event_queue(st, src, |queue, tasks| {
        ListAccessor::new(queue, &mut tasks.slots, |t: &mut TaskCb| &mut t.event_link).remove(id);
    });
}

/// Re-sort a blocked task after its effective priority changed.
pub(crate) fn requeue_waiter(st: &mut KernelState, id: TaskId) {
    let Some(src) = st.tasks[id].waiting_on else {
        return;
    };
    with_event_queue(st, src, |queue, tasks| {
        ListAccessor::new(queue, &mut tasks.slots, |t: &mut TaskCb| &mut t.event_link).remove(id);
        enqueue_by_priority(queue, tasks, id);
    });
}

/// End `id`'s wait with `result` and make it ready. The task must already
/// be off its waiter list; a timed wait is also withdrawn from the
/// timed-wait list here.
pub(crate) fn complete_wait(st: &mut KernelState, id: TaskId, result: Result) {
    if st.tasks[id].state == TaskState::BlockedTimeout {
        ListAccessor::new(
            &mut st.sched.timed_wait,
            &mut st.tasks.slots,
            |t: &mut TaskCb| &mut t.state_link,
        )
        .remove(id);
    }
    st.tasks[id].waiting_on = None;
    st.tasks[id].wait_result = result;
    sched::ready_insert(&mut st.sched, &mut st.tasks, id);
}

/// Wake the head waiter of `queue` with `result`. Returns the woken task.
pub(crate) fn wake_one(
    st: &mut KernelState,
    src: WaitSrc,
    result: Result,
) -> Option<TaskId> {
    let id = with_event_queue(st, src, |queue, tasks| {
        ListAccessor::new(queue, &mut tasks.slots, |t: &mut TaskCb| &mut t.event_link).pop_front()
    })?;
    complete_wait(st, id, result);
    Some(id)
}

/// Wake every waiter of `queue` with `result` (object destruction).
pub(crate) fn wake_all(st: &mut KernelState, src: WaitSrc, result: Result) -> bool {
    let mut any = false;
    while wake_one(st, src, result).is_some() {
        any = true;
    }
    any
}

impl<P: Port> Kernel<P> {
    /// Take the running task off the ready set and enroll it as a waiter of
    /// `src`, endlessly or until `deadline`. The caller performs any
    /// protocol-specific work (e.g. priority inheritance) and then calls
    /// `reschedule_locked` itself.
    pub(crate) fn block_current(
        &self,
        g: &mut KGuard<'_, P>,
        src: WaitSrc,
        deadline: Option<Tick>,
    ) -> Result<TaskId> {
        let st = &mut **g;
        let cur = st.sched.current.ok_or(Error::InvalidState)?;
        if st.sched.suspend_nesting > 0 {
            // Blocking is forbidden while context switches are deferred.
            return Err(Error::InvalidState);
        }
        debug_assert_eq!(st.tasks[cur].state, TaskState::Ready);

        sched::ready_remove(&mut st.sched, &mut st.tasks, cur);
        st.tasks[cur].waiting_on = Some(src);
        st.tasks[cur].wait_result = Ok(());
        with_event_queue(st, src, |queue, tasks| {
            enqueue_by_priority(queue, tasks, cur);
        });

        match deadline {
            Some(at) => {
                st.tasks[cur].state = TaskState::BlockedTimeout;
                st.tasks[cur].wake_at = at;
                ListAccessor::new(
                    &mut st.sched.timed_wait,
                    &mut st.tasks.slots,
                    |t: &mut TaskCb| &mut t.state_link,
                )
                .push_back(cur);
            }
            None => st.tasks[cur].state = TaskState::Blocked,
        }
        Ok(cur)
    }
}
