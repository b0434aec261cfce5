//! # Address Spaces and the Process-Image Core
//!
//! Ties the lower layers together into per-process virtual memory:
//!
//! - [`Mm`]: one address space, a page directory plus its sorted list of
//!   virtual memory areas.
//! - [`MemoryCore`]: the explicit context owning the frame database, the
//!   slab caches, the COW shadow table and the kernel address space; every
//!   operation that crosses subsystems goes through it.
//! - The **VMA operations** (`create_vm_area` / `clone_vm_area` /
//!   `destroy_vm_area`) and the process-image lifecycle
//!   (`create_blank_process_image` / `clone_process_image` /
//!   `destroy_process_image`).
//! - The **page-fault handler**: demand paging and copy-on-write resolution,
//!   `SIGSEGV` via the [`Scheduler`] trait for illegal user accesses, panic
//!   for kernel-state corruption.
//! - The `mmap` / `munmap` / `brk` syscall bodies.
//!
//! ## Invariants carried here
//!
//! - VMAs of one address space are disjoint and sorted ascending by start.
//! - A frame mapped writable anywhere has reference count 1; COW-shared
//!   frames are read-only (or lazily indirect) in every mapping and count
//!   one reference per sharing address space.
//! - Every branch that kills a user task routes through `SIGSEGV` plus a
//!   scheduler re-entry, so signal handlers get to run; every branch that
//!   smells of corrupted kernel state panics with the full fault description.
//!
//! ## Ownership model
//!
//! All mutation of one address space happens on the task owning it (or in
//! the fault handler running on that task's behalf), so the structures need
//! no inter-task locking, only interrupt-atomicity, which callers provide
//! by entering through an `IrqLock` around the [`MemoryCore`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod core_impl;
mod fault;
mod sched;
mod scratch;
mod vma;

pub use core_impl::{MemoryCore, MmError};
pub use fault::{FaultOutcome, PageFaultError};
pub use sched::{Pid, Scheduler, Signal, SIGSEGV};
pub use scratch::ScratchWindow;
pub use vma::{Mm, RangeCheck, VmArea};

#[cfg(any(test, feature = "test-support"))]
pub use sched::StubScheduler;
