//! Bounded message queues.
//!
//! A queue is a ring of fixed-size slots in a heap-allocated byte buffer
//! with separate reader and writer wait queues. Fullness is tracked with an
//! explicit element count, so `full` is exactly `count == capacity` and no
//! slot is sacrificed. A blocked reader or writer retries its operation
//! after wake-up against the deadline it computed on entry, so a permit
//! snatched by a more urgent peer re-blocks it for the remaining time only.

use crate::time::{self, WAIT_FOREVER};
use crate::utils::index_list::ListHead;
use crate::utils::Init;
use crate::wait::{self, WaitSrc};
use crate::{Error, Kernel, Port, Result, TaskId};

/// Stable handle of a message queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueId(pub(crate) u8);

impl QueueId {
    pub(crate) fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Queue control block.
pub(crate) struct QueueCb {
    pub(crate) in_use: bool,
    /// Heap offset of the slot buffer.
    pub(crate) buf_off: u32,
    pub(crate) elem_size: usize,
    pub(crate) capacity: usize,
    pub(crate) read_idx: usize,
    pub(crate) write_idx: usize,
    pub(crate) count: usize,
    pub(crate) reader_queue: ListHead<TaskId>,
    pub(crate) writer_queue: ListHead<TaskId>,
}

impl Init for QueueCb {
    const INIT: Self = Self {
        in_use: false,
        buf_off: 0,
        elem_size: 0,
        capacity: 0,
        read_idx: 0,
        write_idx: 0,
        count: 0,
        reader_queue: ListHead::INIT,
        writer_queue: ListHead::INIT,
    };
}

impl<P: Port> Kernel<P> {
    /// Take a queue from the pool and give it a buffer of
    /// `capacity` slots of `elem_size` bytes each.
    pub fn queue_create(&self, elem_size: usize, capacity: usize) -> Result<QueueId> {
        if elem_size == 0 || capacity == 0 {
            return Err(Error::InvalidParam);
        }
        let bytes = elem_size.checked_mul(capacity).ok_or(Error::InvalidParam)?;

        let mut g = self.lock();
        if !g.heap.is_initialized() {
            return Err(Error::InvalidState);
        }
        let slot = g
            .queues
            .iter()
            .position(|q| !q.in_use)
            .ok_or(Error::NoResource)?;
        let buf_off = match g.heap.alloc(bytes) {
            Ok(off) => off,
            Err(e) => {
                let hook = g.hooks.alloc_failed;
                drop(g);
                if let Some(h) = hook {
                    h(bytes);
                }
                return Err(e);
            }
        };
        let q = &mut g.queues[slot];
        q.in_use = true;
        q.buf_off = buf_off;
        q.elem_size = elem_size;
        q.capacity = capacity;
        q.read_idx = 0;
        q.write_idx = 0;
        q.count = 0;
        q.reader_queue = ListHead::INIT;
        q.writer_queue = ListHead::INIT;
        Ok(QueueId(slot as u8))
    }

    /// Copy `data` into the next free slot, waiting up to `timeout` ticks
    /// while the queue is full. Short messages are zero-padded to the slot.
    pub fn queue_write(&self, id: QueueId, data: &[u8], timeout: u32) -> Result {
        time::check_timeout(timeout)?;
        if data.is_empty() {
            return Err(Error::InvalidParam);
        }
        let mut g = self.lock();
        {
            let q = g
                .queues
                .get(id.as_index())
                .filter(|q| q.in_use)
                .ok_or(Error::InvalidHandle)?;
            if data.len() > q.elem_size {
                return Err(Error::QueueSizeMismatch);
            }
        }
        let deadline =
            (timeout != 0 && timeout != WAIT_FOREVER).then(|| g.time.current.wrapping_add(timeout));

        loop {
            let wrote = {
                let st = &mut *g;
                let q = st
                    .queues
                    .get_mut(id.as_index())
                    .filter(|q| q.in_use)
                    .ok_or(Error::InvalidHandle)?;
                if q.count < q.capacity {
                    let off = q.buf_off + (q.write_idx * q.elem_size) as u32;
                    let elem_size = q.elem_size;
                    q.write_idx = (q.write_idx + 1) % q.capacity;
                    q.count += 1;
                    let slot = st.heap.user_slice(off, elem_size);
                    slot[..data.len()].copy_from_slice(data);
                    slot[data.len()..].fill(0);
                    Some(wait::wake_one(st, WaitSrc::QueueRead(id), Ok(())).is_some())
                } else {
                    None
                }
            };
            match wrote {
                Some(woke_reader) => {
                    if woke_reader {
                        self.reschedule_locked(&mut g);
                    }
                    return Ok(());
                }
                None => {
                    if timeout == 0 {
                        return Err(Error::WouldBlock);
                    }
                    if let Some(d) = deadline {
                        if time::reached(g.time.current, d) {
                            return Err(Error::Timeout);
                        }
                    }
                    let cur = self.block_current(&mut g, WaitSrc::QueueWrite(id), deadline)?;
                    self.reschedule_locked(&mut g);
                    g = self.wait_until_woken(g, cur);
                    g.tasks[cur].wait_result?;
                }
            }
        }
    }

    /// Copy the oldest message into `data`, waiting up to `timeout` ticks
    /// while the queue is empty. Returns the number of bytes copied.
    pub fn queue_read(&self, id: QueueId, data: &mut [u8], timeout: u32) -> Result<usize> {
        time::check_timeout(timeout)?;
        if data.is_empty() {
            return Err(Error::InvalidParam);
        }
        let mut g = self.lock();
        {
            let q = g
                .queues
                .get(id.as_index())
                .filter(|q| q.in_use)
                .ok_or(Error::InvalidHandle)?;
            if data.len() > q.elem_size {
                return Err(Error::QueueSizeMismatch);
            }
        }
        let deadline =
            (timeout != 0 && timeout != WAIT_FOREVER).then(|| g.time.current.wrapping_add(timeout));

        loop {
            let read = {
                let st = &mut *g;
                let q = st
                    .queues
                    .get_mut(id.as_index())
                    .filter(|q| q.in_use)
                    .ok_or(Error::InvalidHandle)?;
                if q.count > 0 {
                    let off = q.buf_off + (q.read_idx * q.elem_size) as u32;
                    q.read_idx = (q.read_idx + 1) % q.capacity;
                    q.count -= 1;
                    let len = data.len();
                    data.copy_from_slice(&st.heap.user_slice_ref(off, len)[..len]);
                    Some(wait::wake_one(st, WaitSrc::QueueWrite(id), Ok(())).is_some())
                } else {
                    None
                }
            };
            match read {
                Some(woke_writer) => {
                    if woke_writer {
                        self.reschedule_locked(&mut g);
                    }
                    return Ok(data.len());
                }
                None => {
                    if timeout == 0 {
                        return Err(Error::WouldBlock);
                    }
                    if let Some(d) = deadline {
                        if time::reached(g.time.current, d) {
                            return Err(Error::Timeout);
                        }
                    }
                    let cur = self.block_current(&mut g, WaitSrc::QueueRead(id), deadline)?;
                    self.reschedule_locked(&mut g);
                    g = self.wait_until_woken(g, cur);
                    g.tasks[cur].wait_result?;
                }
            }
        }
    }

    /// Number of messages currently queued.
    pub fn queue_len(&self, id: QueueId) -> Result<usize> {
        let g = self.lock();
        g.queues
            .get(id.as_index())
            .filter(|q| q.in_use)
            .map(|q| q.count)
            .ok_or(Error::InvalidHandle)
    }

    /// Return the queue and its buffer to their pools. Fails while any
    /// task waits on it or messages remain.
    pub fn queue_destroy(&self, id: QueueId) -> Result {
        let mut g = self.lock();
        let st = &mut *g;
        let q = st
            .queues
            .get_mut(id.as_index())
            .filter(|q| q.in_use)
            .ok_or(Error::InvalidHandle)?;
        if !q.reader_queue.is_empty() || !q.writer_queue.is_empty() || q.count != 0 {
            return Err(Error::InvalidState);
        }
        q.in_use = false;
        let buf_off = q.buf_off;
        st.heap.free(buf_off)
    }
}
