// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Interrupt-safe critical sections.
//!
//! The only state shared between the receive ISR and the deferred
//! context is the input queue. It is guarded by an [`IsrLock`]: the
//! interrupt level is raised through the injected [`IrqControl`] and a
//! spinlock is taken for the few instructions of a push or pop. The
//! lock is never held across packet processing.

use alloc::sync::Arc;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::ops::DerefMut;

/// Opaque saved interrupt state, handed back to
/// [`IrqControl::restore()`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IrqState(pub usize);

/// The platform's interrupt masking primitive.
///
/// On a microcontroller `disable` raises the interrupt priority level
/// (or clears the global enable) and returns the previous state. On a
/// hosted build there is nothing to mask and [`NoIrq`] is used.
pub trait IrqControl: Send + Sync {
    fn disable(&self) -> IrqState;
    fn restore(&self, state: IrqState);
}

/// An [`IrqControl`] for environments without interrupts.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIrq;

impl IrqControl for NoIrq {
    fn disable(&self) -> IrqState {
        IrqState::default()
    }

    fn restore(&self, _state: IrqState) {}
}

/// A spinlock that also masks interrupts while held.
pub struct IsrLock<T> {
    irq: Arc<dyn IrqControl>,
    inner: spin::Mutex<T>,
}

impl<T> IsrLock<T> {
    pub fn new(irq: Arc<dyn IrqControl>, val: T) -> Self {
        Self { irq, inner: spin::Mutex::new(val) }
    }

    /// Mask interrupts, then take the spinlock. Both are released, in
    /// reverse order, when the guard is dropped.
    pub fn lock(&self) -> IsrLockGuard<'_, T> {
        let state = self.irq.disable();
        let guard = self.inner.lock();
        IsrLockGuard { guard: ManuallyDrop::new(guard), irq: &*self.irq, state }
    }
}

pub struct IsrLockGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    irq: &'a dyn IrqControl,
    state: IrqState,
}

impl<T> Drop for IsrLockGuard<'_, T> {
    fn drop(&mut self) {
        // Safety: The guard is dropped exactly once, here, and never
        // touched again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.irq.restore(self.state);
    }
}

impl<T> Deref for IsrLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IsrLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
