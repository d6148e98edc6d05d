//! Logging setup with a reopenable sink.
//!
//! Every process (master and children) initializes tracing once through
//! [`init_logging`]. Output goes to stderr until a log file is configured;
//! with a file, SIGHUP handlers call [`LogWriter::reopen`] so an external
//! rotation can move the old file aside and have the process start a fresh
//! one under the same path.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

enum LogSink {
    Stderr,
    File { path: PathBuf, file: File },
}

/// Shared handle to the process log sink.
///
/// Cheap to clone; all clones write to the same sink and observe the same
/// reopen.
#[derive(Clone)]
pub struct LogWriter {
    sink: Arc<Mutex<LogSink>>,
}

impl LogWriter {
    /// A writer backed by stderr. `reopen` is a no-op.
    pub fn stderr() -> Self {
        Self {
            sink: Arc::new(Mutex::new(LogSink::Stderr)),
        }
    }

    /// A writer appending to `path`, creating the file if needed.
    pub fn file(path: &Path) -> io::Result<Self> {
        let file = open_log_file(path)?;
        Ok(Self {
            sink: Arc::new(Mutex::new(LogSink::File {
                path: path.to_path_buf(),
                file,
            })),
        })
    }

    /// Closes and reopens the log file under the same path.
    pub fn reopen(&self) -> io::Result<()> {
        let mut sink = self.sink.lock().unwrap();
        if let LogSink::File { path, file } = &mut *sink {
            *file = open_log_file(path)?;
        }
        Ok(())
    }

    /// Whether the sink is a terminal-facing stderr.
    pub fn is_stderr(&self) -> bool {
        matches!(*self.sink.lock().unwrap(), LogSink::Stderr)
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Write half handed out to the tracing formatter.
pub struct LogHandle {
    sink: Arc<Mutex<LogSink>>,
}

impl Write for LogHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.sink.lock().unwrap() {
            LogSink::Stderr => io::stderr().write(buf),
            LogSink::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.sink.lock().unwrap() {
            LogSink::Stderr => io::stderr().flush(),
            LogSink::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogHandle;

    fn make_writer(&'a self) -> Self::Writer {
        LogHandle {
            sink: Arc::clone(&self.sink),
        }
    }
}

/// Installs the global tracing subscriber for this process.
///
/// `level` must already be validated by the config layer (one of `error`,
/// `warn`, `info`, `debug`, `trace`).
pub fn init_logging(level: &str, writer: LogWriter) {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("metrond={}", level).parse().unwrap())
        .add_directive(format!("metron_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(writer.is_stderr())
        .with_writer(writer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reopen_switches_to_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");

        let writer = LogWriter::file(&path).unwrap();
        let mut handle = writer.make_writer();
        handle.write_all(b"first\n").unwrap();
        handle.flush().unwrap();

        // Simulate rotation: move the file aside, then reopen.
        let rotated = dir.path().join("agent.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        writer.reopen().unwrap();

        handle.write_all(b"second\n").unwrap();
        handle.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&rotated).unwrap(), "first\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
    }

    #[test]
    fn test_stderr_writer_reopen_is_noop() {
        let writer = LogWriter::stderr();
        assert!(writer.is_stderr());
        writer.reopen().unwrap();
    }
}
