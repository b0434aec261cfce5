//! Interrupt masking and the interrupt-safe lock.
//!
//! A multi-word update to a VMA list or a page-directory entry must not be
//! observable half-done from the page-fault handler. [`IrqLock`] brackets the
//! critical section with `cli`/flag-restore so a fault taken on this CPU sees
//! either the old view or the new one.

use crate::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

/// Reads `EFLAGS` (via `pushfd`/`pop`). Bit 9 (`IF`) indicates whether
/// interrupts are enabled.
///
/// Off target (hosted tests) there are no interrupts to mask and this
/// returns 0.
#[inline]
#[must_use]
pub fn eflags() -> u32 {
    #[cfg(target_arch = "x86")]
    {
        let r: u32;
        unsafe {
            core::arch::asm!("pushfd; pop {}", out(reg) r, options(nostack, preserves_flags));
        }
        r
    }
    #[cfg(not(target_arch = "x86"))]
    {
        0
    }
}

/// Disables hardware interrupts (`cli`). No-op off target.
#[inline]
pub fn interrupts_disable() {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`). No-op off target.
///
/// # Safety & Privilege
///
/// Must only be called in a ring-0 context; typically used to restore a
/// previously saved interrupt state rather than called directly.
#[inline]
pub fn interrupts_enable() {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were
/// previously enabled, preserving the original state. Nests correctly.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = (eflags() & (1 << 9)) != 0;
        if enabled {
            interrupts_disable();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            interrupts_enable();
        }
    }
}

/// A spin lock whose guard also masks interrupts.
///
/// Acquisition order is interrupts-off first, then the lock; release restores
/// in reverse. This prevents the classic single-CPU deadlock where an
/// interrupt handler spins on a lock its own interrupted context holds.
pub struct IrqLock<T> {
    inner: SpinLock<T>,
}

impl<T> IrqLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            inner: SpinLock::new(inner),
        }
    }

    #[inline]
    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.inner.lock();
        IrqLockGuard { _irq: irq, guard }
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct IrqLockGuard<'a, T> {
    // Field order matters: the spin lock must release before interrupts are
    // restored.
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
