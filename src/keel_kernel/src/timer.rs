//! Software timers.
//!
//! Armed timers sit on one list sorted ascending by expiry tick. The tick
//! path drains every expired timer into a bounded local list under the
//! critical section, then runs each handler with no kernel lock held —
//! callbacks never extend a critical section. After a handler returns, a
//! fresh critical section re-arms an auto-reload timer (from its previous
//! expiry, so handler latency cannot drift the schedule) or parks a
//! one-shot.

use arrayvec::ArrayVec;

use crate::cfg::TIMER_POOL_CAPACITY;
use crate::time::{self, Tick, TIMEOUT_MAX};
use crate::utils::index_list::{Link, ListAccessor, ListHead, PoolIndex};
use crate::utils::Init;
use crate::{Error, Kernel, Port, Result};

/// Stable handle of a software timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerId(pub(crate) u8);

impl PoolIndex for TimerId {
    fn as_index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    AutoReload,
}

/// Timer callback; runs in the tick context with no kernel lock held.
pub type TimerHandler = fn(usize);

fn handler_unset(_: usize) {}

/// Timer control block.
pub(crate) struct TimerCb {
    pub(crate) in_use: bool,
    pub(crate) running: bool,
    pub(crate) mode: TimerMode,
    pub(crate) interval: Tick,
    /// Absolute expiry tick, while armed.
    pub(crate) expiry: Tick,
    pub(crate) handler: TimerHandler,
    pub(crate) param: usize,
    /// Link on the armed list.
    pub(crate) link: Option<Link<TimerId>>,
}

impl Init for TimerCb {
    const INIT: Self = Self {
        in_use: false,
        running: false,
        mode: TimerMode::OneShot,
        interval: 0,
        expiry: 0,
        handler: handler_unset,
        param: 0,
        link: None,
    };
}

/// The timer manager: the pool plus the armed list.
pub(crate) struct TimerWheel {
    pub(crate) slots: [TimerCb; TIMER_POOL_CAPACITY],
    pub(crate) armed: ListHead<TimerId>,
}

impl Init for TimerWheel {
    const INIT: Self = Self {
        slots: Init::INIT,
        armed: ListHead::INIT,
    };
}

impl TimerWheel {
    /// Link `id` into the armed list, keeping it sorted by expiry.
    fn arm(&mut self, id: TimerId) {
        let expiry = self.slots[id.as_index()].expiry;
        let mut acc = ListAccessor::new(&mut self.armed, &mut self.slots, |t: &mut TimerCb| {
            &mut t.link
        });
        let mut insert_at = None;
        let mut cur = acc.front();
        while let Some(c) = cur {
            // Later expiry sorts later; comparison is wrap-safe because all
            // armed expiries lie within half the counter range.
            if (acc.node(c).expiry.wrapping_sub(expiry) as i32) > 0 {
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

    fn disarm(&mut self, id: TimerId) {
        if self.slots[id.as_index()].link.is_some() {
            ListAccessor::new(&mut self.armed, &mut self.slots, |t: &mut TimerCb| &mut t.link)
                .remove(id);
        }
    }
}

fn check_interval(interval: Tick) -> Result {
    if interval == 0 {
        Err(Error::InvalidParam)
    } else if interval >= TIMEOUT_MAX {
        Err(Error::OutOfRange)
    } else {
        Ok(())
    }
}

impl<P: Port> Kernel<P> {
    /// Take a timer from the pool. The timer starts stopped.
    pub fn timer_create(
        &self,
        mode: TimerMode,
        interval: Tick,
        handler: TimerHandler,
        param: usize,
    ) -> Result<TimerId> {
        check_interval(interval)?;
        let mut g = self.lock();
        let slot = g
            .timers
            .slots
            .iter()
            .position(|t| !t.in_use)
            .ok_or(Error::NoResource)?;
        let t = &mut g.timers.slots[slot];
        t.in_use = true;
        t.running = false;
        t.mode = mode;
        t.interval = interval;
        t.expiry = 0;
        t.handler = handler;
        t.param = param;
        t.link = None;
        Ok(TimerId(slot as u8))
    }

    fn with_live_timer<R>(
        &self,
        id: TimerId,
        f: impl FnOnce(&mut crate::KernelState) -> R,
    ) -> Result<R> {
        let mut g = self.lock();
        if !g
            .timers
            .slots
            .get(id.as_index())
            .map_or(false, |t| t.in_use)
        {
            return Err(Error::InvalidHandle);
        }
        Ok(f(&mut *g))
    }

    /// Whether the timer is armed and counting down.
    pub fn timer_is_running(&self, id: TimerId) -> Result<bool> {
        self.with_live_timer(id, |st| st.timers.slots[id.as_index()].running)
    }

    /// (Re)start the timer; the first expiry is one interval from now.
    pub fn timer_start(&self, id: TimerId) -> Result {
        self.with_live_timer(id, |st| {
            st.timers.disarm(id);
            let t = &mut st.timers.slots[id.as_index()];
            t.expiry = st.time.current.wrapping_add(t.interval);
            t.running = true;
            st.timers.arm(id);
        })
    }

    /// Stop the timer; a pending expiry is cancelled.
    pub fn timer_stop(&self, id: TimerId) -> Result {
        self.with_live_timer(id, |st| {
            st.timers.disarm(id);
            st.timers.slots[id.as_index()].running = false;
        })
    }

    /// Change the interval, preserving the running state. A running timer
    /// is re-armed one new interval from now.
    pub fn timer_reset(&self, id: TimerId, interval: Tick) -> Result {
        check_interval(interval)?;
        self.with_live_timer(id, |st| {
            let running = st.timers.slots[id.as_index()].running;
            st.timers.disarm(id);
            let t = &mut st.timers.slots[id.as_index()];
            t.interval = interval;
            if running {
                t.expiry = st.time.current.wrapping_add(interval);
                st.timers.arm(id);
            }
        })
    }

    /// Stop the timer and return it to the pool.
    pub fn timer_delete(&self, id: TimerId) -> Result {
        self.with_live_timer(id, |st| {
            st.timers.disarm(id);
            let t = &mut st.timers.slots[id.as_index()];
            t.running = false;
            t.in_use = false;
        })
    }

    /// Drain and run expired timers. Called from the tick path after the
    /// scheduler's critical section has closed.
    pub(crate) fn run_expired_timers(&self) {
        let expired: ArrayVec<TimerId, TIMER_POOL_CAPACITY> = {
            let mut g = self.lock();
            let st = &mut *g;
            let now = st.time.current;
            let mut drained = ArrayVec::new();
            while let Some(head) = st.timers.armed.front() {
                if !time::reached(now, st.timers.slots[head.as_index()].expiry) {
                    break;
                }
                st.timers.disarm(head);
                drained.push(head);
            }
            drained
        };

        for id in expired {
            let fire = {
                let g = self.lock();
                let t = &g.timers.slots[id.as_index()];
                t.in_use.then(|| (t.handler, t.param))
            };
            let Some((handler, param)) = fire else {
                continue;
            };

            handler(param);

            let mut g = self.lock();
            let st = &mut *g;
            let t = &mut st.timers.slots[id.as_index()];
            // The handler may have restarted, stopped, or deleted the
            // timer; only a still-running, unlinked timer needs attention.
            if !t.in_use || !t.running || t.link.is_some() {
                continue;
            }
            match t.mode {
                TimerMode::AutoReload => {
                    t.expiry = t.expiry.wrapping_add(t.interval);
                    st.timers.arm(id);
                }
                TimerMode::OneShot => t.running = false,
            }
        }
    }
}
