use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;
use log::error;

/// Page-fault error code layout (x86 protected mode).
///
/// Pushed by the CPU on entry to the fault gate; each bit describes the
/// condition that caused the fault. Reference: Intel SDM Vol. 3A, §6.15
/// "Page-Fault Exception (#PF)".
#[bitfield(u32)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor mode.
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch.
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32, // reserved
}

impl PageFaultError {
    /// A user-mode write hit a present but write-protected page, the one
    /// protection fault copy-on-write may legitimately produce.
    #[must_use]
    pub fn user_write_protection(&self) -> bool {
        self.user() && self.write() && self.present()
    }

    #[must_use]
    pub fn explain(&self) -> &'static str {
        if !self.present() {
            "non-present page"
        } else if self.instruction_fetch() {
            "instruction fetch on protected page"
        } else if self.write() {
            "write access to protected page"
        } else {
            "read access to protected page"
        }
    }
}

/// Outcome of a page fault, consumed by the interrupt stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The mapping was repaired; re-running the faulting instruction will
    /// succeed.
    Resolved,
    /// `SIGSEGV` was posted to the current task and the scheduler
    /// re-entered.
    Signalled,
}

/// Kernel state is corrupt; dump the fault and stop.
pub(crate) fn fault_panic(addr: VirtualAddress, err: PageFaultError, context: &str) -> ! {
    error!(target: "paging", "faulting address (cr2): {addr}");
    error!(target: "paging", "error code {:#x}: {}", err.into_bits(), err.explain());
    error!(
        target: "paging",
        "user={} write={} present={} reserved={} ifetch={}",
        err.user(),
        err.write(),
        err.present(),
        err.reserved_bit(),
        err.instruction_fetch()
    );
    panic!("page fault at {addr}: {context}");
}
