//! Thread-local, redirectable logging.
//!
//! Each thread carries a "current sink" that log lines are written to. The
//! default sink is [`LogSink::Null`], which discards everything before any
//! formatting happens, so an unconfigured thread pays almost nothing on the
//! hot path. Log-config commands swap the sink of the thread that services
//! them: worker threads redirect their own output, while commands handled
//! offline redirect the submitting thread.
//!
//! Every line is prefixed with the `[file:line]` of the call site. Use the
//! [`logline!`](crate::logline) macro rather than calling [`write_line`]
//! directly.

use std::cell::RefCell;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, LineWriter, Write};
use std::path::Path;

use crate::error::Result;

enum LogSink {
    Null,
    Stderr,
    Stdout,
    File(LineWriter<std::fs::File>),
}

thread_local! {
    static CURRENT: RefCell<LogSink> = RefCell::new(LogSink::Null);
}

/// Redirects the current thread's log lines to a file, appending and
/// creating it as needed. The first line written is an open banner.
pub fn to_file(path: &Path) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut sink = LogSink::File(LineWriter::new(file));
    write_to(&mut sink, file!(), line!(), format_args!("log opened"));
    install(sink);
    Ok(())
}

/// Redirects the current thread's log lines to stderr.
pub fn to_stderr() {
    install(LogSink::Stderr);
}

/// Redirects the current thread's log lines to stdout.
pub fn to_stdout() {
    install(LogSink::Stdout);
}

/// Silences the current thread's log lines.
pub fn disable() {
    install(LogSink::Null);
}

/// Whether the current thread has an active (non-null) sink. The logging
/// macro checks this before formatting its arguments.
pub fn enabled() -> bool {
    CURRENT.with(|current| !matches!(&*current.borrow(), LogSink::Null))
}

/// Writes one prefixed line to the current thread's sink.
pub fn write_line(file: &str, line: u32, args: fmt::Arguments<'_>) {
    CURRENT.with(|current| write_to(&mut current.borrow_mut(), file, line, args));
}

// Replacing the slot drops the previous sink exactly once, flushing a file
// sink through its LineWriter.
fn install(sink: LogSink) {
    CURRENT.with(|current| {
        *current.borrow_mut() = sink;
    });
}

fn write_to(sink: &mut LogSink, file: &str, line: u32, args: fmt::Arguments<'_>) {
    let _ = match sink {
        LogSink::Null => Ok(()),
        LogSink::Stderr => writeln!(io::stderr(), "[{file}:{line}] {args}"),
        LogSink::Stdout => writeln!(io::stdout(), "[{file}:{line}] {args}"),
        LogSink::File(writer) => writeln!(writer, "[{file}:{line}] {args}"),
    };
}

/// Counts a noun for log lines and status text: `plural(3, "root")` is
/// "3 roots". Only regular plurals; spell irregular nouns out at the call
/// site.
pub fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

/// Logs a line through the current thread's sink, prefixed with the call
/// site's `[file:line]`. Free when logging is disabled.
#[macro_export]
macro_rules! logline {
    ($($arg:tt)*) => {
        if $crate::logging::enabled() {
            $crate::logging::write_line(file!(), line!(), format_args!($($arg)*));
        }
    };
}
