//! Kernel state locking.
//!
//! All mutable kernel state sits in one [`KLock`] cell inside the kernel
//! object. Access goes through [`KGuard`], an RAII guard that enters the
//! port's interrupt-mask critical section on acquisition and leaves it on
//! drop. The critical section is the only synchronization boundary in the
//! kernel: with interrupts at or below the kernel ceiling masked on a single
//! core, the holder is the sole executor touching kernel state.
//!
//! Guards are never nested. Every service acquires exactly one guard at its
//! entry and releases it (explicitly or by `drop`) before invoking user
//! callbacks or parking in the port, so the `&mut` handed out below is
//! unique for its whole lifetime.

use core::cell::UnsafeCell;
use core::ops;

use crate::{Kernel, KernelState, Port};

pub(crate) struct KLock<T> {
    cell: UnsafeCell<T>,
}

// Safety: the contents are only reached through `KGuard`, which the port's
// critical section serializes (see the module comment).
unsafe impl<T: Send> Sync for KLock<T> {}

impl<T> KLock<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            cell: UnsafeCell::new(value),
        }
    }
}

/// RAII guard for the kernel critical section.
pub(crate) struct KGuard<'a, P: Port> {
    kernel: &'a Kernel<P>,
}

impl<P: Port> Kernel<P> {
    /// Enter the critical section and borrow the kernel state.
    pub(crate) fn lock(&self) -> KGuard<'_, P> {
        self.port.enter_critical();
        KGuard { kernel: self }
    }
}

impl<P: Port> ops::Deref for KGuard<'_, P> {
    type Target = KernelState;

    fn deref(&self) -> &KernelState {
        // Safety: the critical section is held for the guard's lifetime.
        unsafe { &*self.kernel.state.cell.get() }
    }
}

impl<P: Port> ops::DerefMut for KGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut KernelState {
        // Safety: as above; guards are never nested, so this `&mut` is unique.
        unsafe { &mut *self.kernel.state.cell.get() }
    }
}

impl<P: Port> Drop for KGuard<'_, P> {
    fn drop(&mut self) {
        self.kernel.port.exit_critical();
    }
}
