use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};

/// Per-operation log file, `<logs_dir>/<operation>-<timestamp>.log`.
/// Every line is also emitted as a `tracing` event.
pub struct OperationLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl OperationLog {
    pub fn create(logs_dir: &Path, operation: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let path = logs_dir.join(format!("{operation}-{stamp}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: impl Display) {
        tracing::info!(log = %self.path.display(), "{message}");
        self.append("INFO", &message);
    }

    pub fn error(&self, message: impl Display) {
        tracing::error!(log = %self.path.display(), "{message}");
        self.append("ERROR", &message);
    }

    fn append(&self, level: &str, message: &dyn Display) {
        let line = format!(
            "{} {level} {message}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = file.write_all(line.as_bytes()) {
            tracing::warn!(log = %self.path.display(), error = %e, "cannot write operation log");
        }
    }
}
