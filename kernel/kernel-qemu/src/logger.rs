use crate::qemu_trace;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend rendering records to the QEMU debug console.
///
/// Records are formatted as `[LEVEL] target: message`, so a `debug!` issued
/// with `target: "pmm"` shows up as `[DEBUG] pmm: ...`, one line per record,
/// without allocating.
pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Installs this logger as the global `log` backend.
    ///
    /// Call once during early bring-up, before the memory core starts
    /// logging; there is no heap yet, so the logger parks itself in a
    /// static slot to satisfy `set_logger`'s `&'static` requirement.
    #[allow(static_mut_refs, clippy::missing_errors_doc)]
    pub fn init(self) -> Result<(), SetLoggerError> {
        static mut SLOT: Option<QemuLogger> = None;

        let max_level = self.max_level;
        unsafe {
            SLOT = Some(self);
            log::set_logger(SLOT.as_ref().unwrap() as &'static dyn Log)?;
        }
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        qemu_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        // no-op for the debug port
    }
}
