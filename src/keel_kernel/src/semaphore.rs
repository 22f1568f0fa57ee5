//! Counting semaphores.
use crate::time::{self, WAIT_FOREVER};
use crate::utils::index_list::ListHead;
use crate::utils::Init;
use crate::wait::{self, WaitSrc};
use crate::{Error, Kernel, Port, Result, TaskId};

/// Stable handle of a semaphore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreId(pub(crate) u8);

impl SemaphoreId {
    pub(crate) fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Semaphore control block.
pub(crate) struct SemaphoreCb {
    pub(crate) in_use: bool,
    pub(crate) count: u32,
    pub(crate) max: u32,
    pub(crate) wait_queue: ListHead<TaskId>,
}

impl Init for SemaphoreCb {
    const INIT: Self = Self {
        in_use: false,
        count: 0,
        max: 0,
        wait_queue: ListHead::INIT,
    };
}

impl<P: Port> Kernel<P> {
    /// Take a semaphore from the pool with `initial` permits and a ceiling
    /// of `max`.
    pub fn semaphore_create(&self, initial: u32, max: u32) -> Result<SemaphoreId> {
        if max == 0 || initial > max {
            return Err(Error::InvalidParam);
        }
        let mut g = self.lock();
        let slot = g
            .semaphores
            .iter()
            .position(|s| !s.in_use)
            .ok_or(Error::NoResource)?;
        let s = &mut g.semaphores[slot];
        s.in_use = true;
        s.count = initial;
        s.max = max;
        s.wait_queue = ListHead::INIT;
        Ok(SemaphoreId(slot as u8))
    }

    /// Take one permit, waiting up to `timeout` ticks. A zero timeout never
    /// blocks and fails with [`Error::WouldBlock`] on an empty semaphore.
    pub fn semaphore_acquire(&self, id: SemaphoreId, timeout: u32) -> Result {
        time::check_timeout(timeout)?;
        let mut g = self.lock();
        let s = g
            .semaphores
            .get_mut(id.as_index())
            .filter(|s| s.in_use)
            .ok_or(Error::InvalidHandle)?;
        if s.count > 0 {
            s.count -= 1;
            return Ok(());
        }
        if timeout == 0 {
            return Err(Error::WouldBlock);
        }

        let deadline = (timeout != WAIT_FOREVER).then(|| g.time.current.wrapping_add(timeout));
        let cur = self.block_current(&mut g, WaitSrc::Semaphore(id), deadline)?;
        self.reschedule_locked(&mut g);
        let g = self.wait_until_woken(g, cur);
        // The waker hands the permit over directly; `Ok` means we own one.
        g.tasks[cur].wait_result
    }

    /// Release one permit. A waiting task receives it directly (the count
    /// is not touched); otherwise the count grows up to the ceiling.
    pub fn semaphore_release(&self, id: SemaphoreId) -> Result {
        let mut g = self.lock();
        let woke = {
            let st = &mut *g;
            let s = st
                .semaphores
                .get_mut(id.as_index())
                .filter(|s| s.in_use)
                .ok_or(Error::InvalidHandle)?;
            if s.wait_queue.is_empty() {
                if s.count == s.max {
                    return Err(Error::SyncOverflow);
                }
                s.count += 1;
                false
            } else {
                wait::wake_one(st, WaitSrc::Semaphore(id), Ok(())).is_some()
            }
        };
        if woke {
            self.reschedule_locked(&mut g);
        }
        Ok(())
    }

    /// Current permit count.
    pub fn semaphore_count(&self, id: SemaphoreId) -> Result<u32> {
        let g = self.lock();
        g.semaphores
            .get(id.as_index())
            .filter(|s| s.in_use)
            .map(|s| s.count)
            .ok_or(Error::InvalidHandle)
    }

    /// Return the semaphore to the pool. Every waiter wakes with
    /// [`Error::InvalidState`].
    pub fn semaphore_destroy(&self, id: SemaphoreId) -> Result {
        let mut g = self.lock();
        let woke = {
            let st = &mut *g;
            let s = st
                .semaphores
                .get_mut(id.as_index())
                .filter(|s| s.in_use)
                .ok_or(Error::InvalidHandle)?;
            s.in_use = false;
            s.count = 0;
            s.max = 0;
            wait::wake_all(st, WaitSrc::Semaphore(id), Err(Error::InvalidState))
        };
        if woke {
            self.reschedule_locked(&mut g);
        }
        Ok(())
    }
}
