//! Log setup and SIGHUP-driven reopening.
//!
//! In the foreground the proxy logs to stderr; otherwise to the configured
//! destination file through a writer handle that can be reopened in place,
//! so log rotation just sends SIGHUP.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Handle to a reopenable log file; cheap to clone.
#[derive(Clone)]
pub struct LogHandle {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl LogHandle {
    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Reopen the destination file, e.g. after rotation.
    pub fn reopen(&self) {
        match Self::open(&self.path) {
            Ok(file) => {
                *self.file.lock().expect("log file lock") = file;
                info!(path = %self.path.display(), "reopened log file");
            }
            Err(error) => eprintln!(
                "cannot reopen log file {}: {error}",
                self.path.display()
            ),
        }
    }
}

impl Write for LogHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().expect("log file lock").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().expect("log file lock").flush()
    }
}

impl<'a> MakeWriter<'a> for LogHandle {
    type Writer = LogHandle;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initialize tracing. Returns a handle when logging to a file, so SIGHUP
/// can reopen it.
pub fn init(level: &str, destination: Option<&Path>) -> io::Result<Option<LogHandle>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match destination {
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .init();
            Ok(None)
        }
        Some(path) => {
            let handle = LogHandle {
                path: path.to_path_buf(),
                file: Arc::new(Mutex::new(LogHandle::open(path)?)),
            };
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(handle.clone()),
                )
                .init();
            Ok(Some(handle))
        }
    }
}

/// Map a numeric debug level (1..5) to a tracing filter directive.
pub fn level_for(debug: u8) -> &'static str {
    match debug {
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    }
}
