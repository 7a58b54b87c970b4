//! Append-only audit log.
//!
//! One line per entry, `<local time>: <message>`. Safe to share between
//! threads.

use crate::error::StorageError;
use chrono::Local;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const STAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Opens the log for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one timestamped entry. Newlines in the message are flattened
    /// so every entry stays on one line.
    pub fn append(&self, message: &str) -> Result<(), StorageError> {
        let line = format!(
            "{}: {}\n",
            Local::now().format(STAMP_FORMAT),
            message.replace('\n', " ")
        );

        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Returns up to the last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<String>, StorageError> {
        let file = File::open(&self.path)?;
        let mut lines = VecDeque::with_capacity(n.saturating_add(1).min(1024));
        for line in BufReader::new(file).lines() {
            lines.push_back(line?);
            if lines.len() > n {
                lines.pop_front();
            }
        }
        Ok(lines.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_tail() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::open(dir.path().join("logs/events.log")).unwrap();

        for i in 0..30 {
            log.append(&format!("entry {}", i)).unwrap();
        }

        let tail = log.tail(25).unwrap();
        assert_eq!(tail.len(), 25);
        assert!(tail[0].ends_with(": entry 5"));
        assert!(tail[24].ends_with(": entry 29"));
    }

    #[test]
    fn test_tail_of_long_log() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::open(dir.path().join("events.log")).unwrap();

        for i in 0..5000 {
            log.append(&format!("entry {}", i)).unwrap();
        }

        let tail = log.tail(3).unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail[0].ends_with(": entry 4997"));
        assert!(tail[2].ends_with(": entry 4999"));
        assert!(log.tail(0).unwrap().is_empty());
    }

    #[test]
    fn test_multiline_message_flattened() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::open(dir.path().join("events.log")).unwrap();

        log.append("front door\nopened").unwrap();
        assert_eq!(log.tail(10).unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.log");

        AuditLog::open(&path).unwrap().append("first").unwrap();
        let log = AuditLog::open(&path).unwrap();
        log.append("second").unwrap();

        let tail = log.tail(10).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("first"));
    }

    #[test]
    fn test_concurrent_appends() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(AuditLog::open(dir.path().join("events.log")).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        log.append(&format!("thread {} entry {}", t, i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let tail = log.tail(1000).unwrap();
        assert_eq!(tail.len(), 200);
        assert!(tail.iter().all(|l| l.contains(": thread ")));
    }
}
