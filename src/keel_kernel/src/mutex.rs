//! Recursive mutexes with chained priority inheritance.
//!
//! Ownership hand-off is direct: unlocking passes the mutex to the
//! highest-priority waiter. Each task threads the mutexes it holds on a
//! singly-linked list (`TaskCb::held_mutexes` → `MutexCb::next_held`);
//! releasing recomputes the owner's effective priority from its base and
//! the head waiters of everything still held, so the restore is exact even
//! with several boosting mutexes outstanding.
//!
//! When a task blocks, the inheritance boost walks the owner chain: the
//! owner is raised to the waiter's priority, and if that owner is itself
//! blocked on another mutex, the walk continues there, up to a fixed depth
//! that bounds the work done with the kernel locked.

use crate::cfg::MUTEX_CHAIN_DEPTH_MAX;
use crate::sched;
use crate::task::{Priority, TaskId};
use crate::time::{self, WAIT_FOREVER};
use crate::utils::index_list::ListHead;
use crate::utils::Init;
use crate::wait::{self, WaitSrc};
use crate::{Error, Kernel, KernelState, Port, Result};

/// Stable handle of a mutex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutexId(pub(crate) u8);

impl MutexId {
    pub(crate) fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Mutex control block.
pub(crate) struct MutexCb {
    pub(crate) in_use: bool,
    pub(crate) owner: Option<TaskId>,
    /// Recursive acquisition depth; zero only while unowned.
    pub(crate) hold_count: u32,
    pub(crate) wait_queue: ListHead<TaskId>,
    /// Next mutex on the owner's held list.
    pub(crate) next_held: Option<MutexId>,
}

impl Init for MutexCb {
    const INIT: Self = Self {
        in_use: false,
        owner: None,
        hold_count: 0,
        wait_queue: ListHead::INIT,
        next_held: None,
    };
}

/// Record `task` as the owner of `mid` and push the mutex onto its held
/// list.
fn claim(st: &mut KernelState, mid: MutexId, task: TaskId) {
    let m = &mut st.mutexes[mid.as_index()];
    debug_assert!(m.owner.is_none());
    m.owner = Some(task);
    m.hold_count = 1;
    m.next_held = st.tasks[task].held_mutexes;
    st.tasks[task].held_mutexes = Some(mid);
}

/// Drop `mid` from `task`'s held list (it is not necessarily the head).
fn remove_held(st: &mut KernelState, task: TaskId, mid: MutexId) {
    let mut cur = st.tasks[task].held_mutexes;
    if cur == Some(mid) {
        st.tasks[task].held_mutexes = st.mutexes[mid.as_index()].next_held;
    } else {
        while let Some(c) = cur {
            let next = st.mutexes[c.as_index()].next_held;
            if next == Some(mid) {
                st.mutexes[c.as_index()].next_held = st.mutexes[mid.as_index()].next_held;
                break;
            }
            cur = next;
        }
    }
    st.mutexes[mid.as_index()].next_held = None;
}

/// The priority `task` is entitled to: its base, raised to the most urgent
/// head waiter over all mutexes it still holds.
fn entitled_priority(st: &KernelState, task: TaskId) -> Priority {
    let mut prio = st.tasks[task].base_priority;
    let mut cur = st.tasks[task].held_mutexes;
    while let Some(mid) = cur {
        let m = &st.mutexes[mid.as_index()];
        if let Some(w) = m.wait_queue.front() {
            prio = prio.min(st.tasks[w].priority);
        }
        cur = m.next_held;
    }
    prio
}

/// Raise the owners along the mutex chain to at least `waiter_prio`.
fn propagate_inheritance(st: &mut KernelState, from: MutexId, waiter_prio: Priority) {
    let mut mid = from;
    for _ in 0..MUTEX_CHAIN_DEPTH_MAX {
        let Some(owner) = st.mutexes[mid.as_index()].owner else {
            break;
        };
        if st.tasks[owner].priority > waiter_prio {
            sched::set_effective_priority(st, owner, waiter_prio);
        }
        match st.tasks[owner].waiting_on {
            Some(WaitSrc::Mutex(next)) => mid = next,
            _ => break,
        }
    }
}

impl<P: Port> Kernel<P> {
    /// Take a mutex from the pool.
    pub fn mutex_create(&self) -> Result<MutexId> {
        let mut g = self.lock();
        let slot = g
            .mutexes
            .iter()
            .position(|m| !m.in_use)
            .ok_or(Error::NoResource)?;
        let m = &mut g.mutexes[slot];
        m.in_use = true;
        m.owner = None;
        m.hold_count = 0;
        m.wait_queue = ListHead::INIT;
        m.next_held = None;
        Ok(MutexId(slot as u8))
    }

    /// Acquire the mutex, waiting up to `timeout` ticks. Re-acquisition by
    /// the owner nests.
    pub fn mutex_lock(&self, id: MutexId, timeout: u32) -> Result {
        time::check_timeout(timeout)?;
        let mut g = self.lock();
        if !g.mutexes.get(id.as_index()).map_or(false, |m| m.in_use) {
            return Err(Error::InvalidHandle);
        }
        let cur = g.sched.current.ok_or(Error::InvalidState)?;

        match g.mutexes[id.as_index()].owner {
            None => {
                claim(&mut *g, id, cur);
                Ok(())
            }
            Some(owner) if owner == cur => {
                let m = &mut g.mutexes[id.as_index()];
                m.hold_count = m.hold_count.checked_add(1).ok_or(Error::SyncOverflow)?;
                Ok(())
            }
            Some(_) => {
                if timeout == 0 {
                    return Err(Error::WouldBlock);
                }
                let deadline =
                    (timeout != WAIT_FOREVER).then(|| g.time.current.wrapping_add(timeout));
                let waiter_prio = g.tasks[cur].priority;
                self.block_current(&mut g, WaitSrc::Mutex(id), deadline)?;
                propagate_inheritance(&mut *g, id, waiter_prio);
                self.reschedule_locked(&mut g);
                let g = self.wait_until_woken(g, cur);
                // `Ok` means the releasing task handed us the ownership.
                g.tasks[cur].wait_result
            }
        }
    }

    /// Release one level of ownership. Dropping the last level restores the
    /// caller's entitled priority and hands the mutex to the next waiter.
    pub fn mutex_unlock(&self, id: MutexId) -> Result {
        let mut g = self.lock();
        if !g.mutexes.get(id.as_index()).map_or(false, |m| m.in_use) {
            return Err(Error::InvalidHandle);
        }
        let cur = g.sched.current.ok_or(Error::InvalidState)?;
        {
            let m = &mut g.mutexes[id.as_index()];
            if m.owner != Some(cur) || m.hold_count == 0 {
                return Err(Error::NotOwner);
            }
            m.hold_count -= 1;
            if m.hold_count > 0 {
                return Ok(());
            }
            m.owner = None;
        }
        {
            let st = &mut *g;
            remove_held(st, cur, id);
            let entitled = entitled_priority(st, cur);
            sched::set_effective_priority(st, cur, entitled);

            // Hand over to the most urgent waiter, if any.
            if st.mutexes[id.as_index()].wait_queue.front().is_some() {
                let next = wait::wake_one(st, WaitSrc::Mutex(id), Ok(())).unwrap();
                claim(st, id, next);
            }
        }
        self.reschedule_locked(&mut g);
        Ok(())
    }

    /// Return the mutex to the pool. Fails while owned.
    pub fn mutex_destroy(&self, id: MutexId) -> Result {
        let mut g = self.lock();
        let m = g
            .mutexes
            .get_mut(id.as_index())
            .filter(|m| m.in_use)
            .ok_or(Error::InvalidHandle)?;
        if m.owner.is_some() {
            return Err(Error::InvalidState);
        }
        m.in_use = false;
        Ok(())
    }
}
