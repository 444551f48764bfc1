//! Forwards `tracing` events from the pooling core to the Godot output panel.
//!
//! Each event is formatted once by `tracing_subscriber::fmt` and handed to a
//! sink as a single line; the default sink routes by level to
//! `godot_error!`, `godot_warn!` or `godot_print!`.

use godot::prelude::*;
use std::io;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

/// Receives one formatted log line
pub type LogSink = fn(Level, &str);

fn godot_sink(level: Level, line: &str) {
    match level {
        Level::ERROR => godot_error!("{}", line),
        Level::WARN => godot_warn!("{}", line),
        _ => godot_print!("{}", line),
    }
}

/// `MakeWriter` that buffers each event and passes it to a [`LogSink`]
#[derive(Clone, Copy)]
pub struct EngineLog {
    sink: LogSink,
}

impl EngineLog {
    pub fn godot() -> Self {
        Self { sink: godot_sink }
    }

    pub fn with_sink(sink: LogSink) -> Self {
        Self { sink }
    }

    fn writer(&self, level: Level) -> EngineLogWriter {
        EngineLogWriter {
            sink: self.sink,
            level,
            buf: Vec::new(),
        }
    }
}

/// Collects one event; the line is emitted when the writer is dropped
pub struct EngineLogWriter {
    sink: LogSink,
    level: Level,
    buf: Vec<u8>,
}

impl io::Write for EngineLogWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EngineLogWriter {
    fn drop(&mut self) {
        let line = String::from_utf8_lossy(&self.buf);
        let line = line.trim_end();
        if !line.is_empty() {
            (self.sink)(self.level, line);
        }
    }
}

impl<'a> MakeWriter<'a> for EngineLog {
    type Writer = EngineLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer(*meta.level())
    }
}

/// Install the Godot bridge as the global subscriber.
/// Returns false when another subscriber is already installed.
pub fn init(max_level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_ansi(false)
        .with_target(false)
        .with_level(false)
        .without_time()
        .with_writer(EngineLog::godot())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    thread_local! {
        static LINES: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
    }

    fn record(level: Level, line: &str) {
        LINES.with(|lines| lines.borrow_mut().push((level, line.to_string())));
    }

    #[test]
    fn events_reach_the_sink_with_their_level() {
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_level(false)
            .without_time()
            .with_writer(EngineLog::with_sink(record))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("[blood POOL] double release");
            tracing::error!("[blood POOL] corrupted index");
        });

        let lines = LINES.with(|lines| lines.take());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, Level::WARN);
        assert!(lines[0].1.ends_with("[blood POOL] double release"));
        assert_eq!(lines[1].0, Level::ERROR);
        assert!(!lines[1].1.ends_with('\n'));
    }
}
