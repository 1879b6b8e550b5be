//! Destination of the fitter progress and warning messages

pub use log::Level;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Receiver of the fitter messages, owned by the fitter
pub trait DiagnosticsSink {
    fn emit(&self, level: Level, message: fmt::Arguments<'_>);
}

/// Forwards messages to the [log] facade
#[derive(Clone, Debug)]
pub struct LogSink {
    target: &'static str,
}

impl LogSink {
    pub fn new(target: &'static str) -> Self {
        Self { target }
    }
}

impl DiagnosticsSink for LogSink {
    fn emit(&self, level: Level, message: fmt::Arguments<'_>) {
        log::log!(target: self.target, level, "{message}");
    }
}

/// Keeps messages in memory, clones share the same storage
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    records: Rc<RefCell<Vec<(Level, String)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(Level, String)> {
        self.records.borrow().clone()
    }

    /// Messages of the given level
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.records
            .borrow()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl DiagnosticsSink for RecordingSink {
    fn emit(&self, level: Level, message: fmt::Arguments<'_>) {
        self.records.borrow_mut().push((level, message.to_string()));
    }
}

macro_rules! diag {
    ($sink: expr, $level: ident, $($arg: tt)+) => {
        $sink.emit($crate::diagnostics::Level::$level, format_args!($($arg)+))
    };
}
pub(crate) use diag;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_shares_storage() {
        let sink = RecordingSink::new();
        let boxed: Box<dyn DiagnosticsSink> = Box::new(sink.clone());
        diag!(boxed, Warn, "{} outliers", 3);
        diag!(boxed, Debug, "chi2 {}", 1.5);
        assert_eq!(sink.messages(Level::Warn), vec!["3 outliers".to_string()]);
        assert_eq!(sink.records().len(), 2);
    }
}
