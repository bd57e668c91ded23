//! Status-line decoration: the one thing the core is allowed to assume about
//! its logging backend is the `log::log!(level, "...")` contract. This module
//! supplies the two concrete backends the CLI wires up: ANSI-decorated stderr
//! when attached to a terminal, plain stderr otherwise, and syslog under
//! `--detach`.

use std::ffi::CString;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, Log, Metadata, Record};

struct StderrLogger {
    decorate: bool,
}

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if self.decorate {
            let marker = match record.level() {
                Level::Error => "\x1b[31m[\u{2718}]\x1b[0m",
                Level::Warn => "\x1b[33m[\u{a1}]\x1b[0m",
                _ => "\x1b[32m[\u{2714}]\x1b[0m",
            };
            eprintln!("{} {}", marker, record.args());
        } else {
            let marker = match record.level() {
                Level::Error => "[x]",
                Level::Warn => "[!]",
                _ => "[+]",
            };
            eprintln!("{} {}", marker, record.args());
        }
    }

    fn flush(&self) {}
}

struct SyslogLogger;

static SYSLOG_OPEN: AtomicBool = AtomicBool::new(false);

impl Log for SyslogLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let priority = match record.level() {
            Level::Error => libc::LOG_ERR,
            Level::Warn => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            _ => libc::LOG_DEBUG,
        };

        if let Ok(msg) = CString::new(format!("{}", record.args())) {
            unsafe {
                libc::syslog(priority | libc::LOG_DAEMON, c"%s".as_ptr(), msg.as_ptr());
            }
        }
    }

    fn flush(&self) {}
}

/// Installs the terminal/plain stderr backend. Used while attached.
pub fn init_stderr() {
    let decorate = std::io::stderr().is_terminal();
    let logger: &'static StderrLogger = Box::leak(Box::new(StderrLogger { decorate }));
    let _ = log::set_logger(logger);
    log::set_max_level(log::LevelFilter::Info);
}

/// Installs the syslog backend under `LOG_DAEMON`. Used after `--detach`
/// calls `daemon(0, 0)`.
pub fn init_syslog() {
    if !SYSLOG_OPEN.swap(true, Ordering::SeqCst) {
        let ident = CString::new("jail").unwrap();
        unsafe {
            libc::openlog(
                ident.into_raw(),
                libc::LOG_PID | libc::LOG_NDELAY,
                libc::LOG_DAEMON,
            );
        }
    }
    let _ = log::set_logger(&SyslogLogger);
    log::set_max_level(log::LevelFilter::Info);
}
