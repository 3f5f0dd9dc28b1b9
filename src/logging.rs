//! Logging sink for an in-process DLL.
//!
//! There is no console to print to inside a screen reader, so records go to
//! the debugger stream (`OutputDebugStringW`) on Windows and to stderr
//! elsewhere. Level comes from `SOFTVOICE_HOST_LOG` at first init.

use std::sync::Once;

use log::{Level, LevelFilter, Metadata, Record};

static INIT: Once = Once::new();
static LOGGER: HostLogger = HostLogger;

struct HostLogger;

impl log::Log for HostLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[softvoice-host] {} {}: {}",
            level_tag(record.level()),
            record.target(),
            record.args()
        );
        emit(&line);
    }

    fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

#[cfg(windows)]
fn emit(line: &str) {
    use windows::core::PCWSTR;
    use windows::Win32::System::Diagnostics::Debug::OutputDebugStringW;

    let mut wide: Vec<u16> = line.encode_utf16().collect();
    wide.push('\n' as u16);
    wide.push(0);
    unsafe { OutputDebugStringW(PCWSTR(wide.as_ptr())) };
}

#[cfg(not(windows))]
fn emit(line: &str) {
    eprintln!("{line}");
}

/// Install the logger once. Safe to call from every export.
pub fn init() {
    INIT.call_once(|| {
        let level = match std::env::var("SOFTVOICE_HOST_LOG").as_deref() {
            Ok("trace") => LevelFilter::Trace,
            Ok("debug") => LevelFilter::Debug,
            Ok("warn") => LevelFilter::Warn,
            Ok("error") => LevelFilter::Error,
            Ok("off") => LevelFilter::Off,
            _ => LevelFilter::Info,
        };
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(level);
        }
    });
}
