//! The scheduler as the fault handler sees it.

pub type Pid = u32;

/// A POSIX-style signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal(pub u32);

/// Invalid memory reference.
pub const SIGSEGV: Signal = Signal(11);

/// What the memory core needs from the scheduler.
///
/// Illegal user accesses are not killed directly: the signal is queued and
/// the scheduler re-entered, so the task's signal handler (if any) runs
/// before anything drastic happens.
pub trait Scheduler {
    /// Pid of the task whose context the fault handler is running in.
    fn current(&self) -> Option<Pid>;

    /// Queues `signal` for `pid`.
    fn post_signal(&mut self, pid: Pid, signal: Signal);

    /// Tail-calls the scheduler so queued signals get serviced; may resume a
    /// different task.
    fn reschedule(&mut self);
}

/// Test double: records posted signals and reschedules.
#[cfg(any(test, feature = "test-support"))]
pub struct StubScheduler {
    current: Option<Pid>,
    pub posted: alloc::vec::Vec<(Pid, Signal)>,
    pub reschedules: u32,
}

#[cfg(any(test, feature = "test-support"))]
impl StubScheduler {
    #[must_use]
    pub fn new(current: Option<Pid>) -> Self {
        Self {
            current,
            posted: alloc::vec::Vec::new(),
            reschedules: 0,
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Scheduler for StubScheduler {
    fn current(&self) -> Option<Pid> {
        self.current
    }

    fn post_signal(&mut self, pid: Pid, signal: Signal) {
        self.posted.push((pid, signal));
    }

    fn reschedule(&mut self) {
        self.reschedules += 1;
    }
}
