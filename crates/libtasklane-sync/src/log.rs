use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use libtasklane_core::config::daemon_log_path;
use tracing::{info, warn};

use crate::error::DaemonError;

/// Append-only human-readable daemon log at `<data_dir>/sync-daemon.log`.
///
/// Every line is also emitted through tracing.
pub struct DaemonLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl DaemonLog {
    pub fn open(data_dir: &Path) -> Result<Self, DaemonError> {
        std::fs::create_dir_all(data_dir)?;
        let path = daemon_log_path(data_dir);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line. Write failures are logged, never raised.
    pub fn line(&self, message: &str) {
        info!(target: "tasklane::daemon", "{}", message);

        let stamped = format!("[{}] {}\n", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true), message);
        match self.file.lock() {
            Ok(mut file) => {
                if let Err(e) = file.write_all(stamped.as_bytes()).and_then(|_| file.flush()) {
                    warn!(error = %e, path = %self.path.display(), "failed to write daemon log");
                }
            }
            Err(_) => warn!("daemon log mutex poisoned"),
        }
    }

    /// Read the log's lines (messages include their timestamp prefix)
    pub fn read_lines(data_dir: &Path) -> Result<Vec<String>, DaemonError> {
        let path = daemon_log_path(data_dir);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            lines.push(line?);
        }
        Ok(lines)
    }

    /// The last `n` lines
    pub fn tail(data_dir: &Path, n: usize) -> Result<Vec<String>, DaemonError> {
        let mut lines = Self::read_lines(data_dir)?;
        let skip = lines.len().saturating_sub(n);
        Ok(lines.split_off(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lines_appended_in_order() {
        let dir = tempdir().unwrap();
        let log = DaemonLog::open(dir.path()).unwrap();
        log.line("first");
        log.line("second");
        drop(log);

        let reopened = DaemonLog::open(dir.path()).unwrap();
        reopened.line("third");

        let lines = DaemonLog::read_lines(dir.path()).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("] first"));
        assert!(lines[2].ends_with("] third"));
        assert_eq!(DaemonLog::tail(dir.path(), 1).unwrap(), vec![lines[2].clone()]);
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = tempdir().unwrap();
        assert!(DaemonLog::read_lines(dir.path()).unwrap().is_empty());
    }
}
