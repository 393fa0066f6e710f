//! Routes the `log` crate's records to QEMU's plugin output stream, the
//! only sink a plugin has for anything resembling stdout.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct QemuOutsLogger;

impl Log for QemuOutsLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("{}: {}\n", record.level(), record.args());
        // qemu_plugin_outs only fails if the message contains a NUL byte;
        // there is nowhere else to report that failure, so it is dropped.
        let _ = qemu_plugin::qemu_plugin_outs(line);
    }

    fn flush(&self) {}
}

pub fn init() {
    static LOGGER: QemuOutsLogger = QemuOutsLogger;
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
