//! # Kernel synchronization primitives
//!
//! On a single logical CPU the only source of apparent concurrency is the
//! interrupt path: a page fault or timer tick can preempt kernel code in the
//! middle of a multi-word update. [`SpinLock`] provides plain mutual
//! exclusion; [`IrqLock`] additionally masks interrupts for the lifetime of
//! the guard, so that data shared with fault handlers is observed either in
//! its pre-update or post-update state, never torn.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{IrqGuard, IrqLock, IrqLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
