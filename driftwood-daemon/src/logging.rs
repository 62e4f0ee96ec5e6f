//! Tracing subscriber setup for the daemon process.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Opens the log file in append mode for every event, so a rotated file is
/// picked up without restarting the daemon.
#[derive(Debug, Clone)]
pub struct AppendWriter {
    path: PathBuf,
}

impl AppendWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Either the opened log file or stderr when it could not be opened.
pub enum EventWriter {
    File(File),
    Stderr(io::Stderr),
}

impl Write for EventWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EventWriter::File(f) => f.write(buf),
            EventWriter::Stderr(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            EventWriter::File(f) => f.flush(),
            EventWriter::Stderr(s) => s.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for AppendWriter {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => EventWriter::File(file),
            Err(_) => EventWriter::Stderr(io::stderr()),
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
/// A second call is a no-op.
pub fn init_tracing(log_file: Option<&Path>, json: bool) {
    use tracing_subscriber::fmt;

    let builder = fmt().with_env_filter(env_filter()).with_target(false);
    let _ = match (log_file, json) {
        (Some(path), true) => builder
            .json()
            .with_writer(AppendWriter::new(path))
            .try_init(),
        (Some(path), false) => builder
            .with_ansi(false)
            .with_writer(AppendWriter::new(path))
            .try_init(),
        (None, true) => builder.json().try_init(),
        (None, false) => builder.try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_writer_reopens_after_rename() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.log");
        let writer = AppendWriter::new(&path);

        writer.make_writer().write_all(b"first\n").unwrap();
        std::fs::rename(&path, dir.path().join("daemon.log.1")).unwrap();
        writer.make_writer().write_all(b"second\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
    }

    #[test]
    fn unwritable_path_falls_back_to_stderr() {
        let dir = TempDir::new().unwrap();
        let writer = AppendWriter::new(dir.path().join("missing").join("daemon.log"));
        assert!(matches!(writer.make_writer(), EventWriter::Stderr(_)));
    }
}
