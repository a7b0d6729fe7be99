//! Per-session output log, the text counterpart of the chat panel.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Error,
    Debug,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Error => "ERROR",
            Self::Debug => "DEBUG",
        }
    }
}

/// Appends `[<rfc3339>] LEVEL: text` lines to a file. The file is opened on
/// first use and released by `close`.
#[derive(Debug)]
pub struct OutputLog {
    path: PathBuf,
    file: Option<File>,
    closed: bool,
}

impl OutputLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, level: LogLevel, text: &str) {
        if self.closed {
            return;
        }
        if self.file.is_none() {
            match open_append(&self.path) {
                Ok(file) => self.file = Some(file),
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "failed to open session log");
                    self.closed = true;
                    return;
                }
            }
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let line = format!("[{}] {}: {}\n", format_timestamp(), level.as_str(), text);
        if let Err(err) = file.write_all(line.as_bytes()) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to write session log");
        }
    }

    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

pub fn default_log_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("agent-chat").join("logs").join("session.log"))
        .unwrap_or_else(|| {
            PathBuf::from(".")
                .join(".agent-chat")
                .join("logs")
                .join("session.log")
        })
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn format_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_levelled_lines_until_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("session.log");
        let mut log = OutputLog::new(path.clone());

        log.append(LogLevel::Info, "User message: hi");
        log.append(LogLevel::Error, "boom");
        log.close();
        log.append(LogLevel::Info, "after close");

        let content = fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] INFO: User message: hi"));
        assert!(lines[1].ends_with("] ERROR: boom"));
        assert!(log.is_closed());
    }
}
