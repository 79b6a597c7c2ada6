//! Size-based rotating file writer.
//!
//! The active file is `<path>`; backups are `<path>.1` (newest) through
//! `<path>.<backup_count>` (oldest). Writes go straight to the file with no
//! userspace buffering.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

/// Rotation thresholds for one sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate once the active file would reach this size. `0` never rotates.
    pub max_bytes: u64,
    /// Number of rotated files kept next to the active one. `0` never rotates.
    pub backup_count: u32,
    /// fsync after every record.
    pub sync: bool,
}

#[derive(Debug)]
pub struct RotatingFileWriter {
    path: PathBuf,
    file: File,
    size: u64,
    policy: RotationPolicy,
}

impl RotatingFileWriter {
    /// Opens `path` for appending. The parent directory must already exist.
    pub fn open(path: impl Into<PathBuf>, policy: RotationPolicy) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            size,
            policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the active file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends `line` plus a newline, rotating first if the record would push
    /// the active file to `max_bytes` or beyond.
    ///
    /// A failed rotation is logged and the record still goes to the active
    /// file; rotation is retried on the next write.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut record = Vec::with_capacity(line.len() + 1);
        record.extend_from_slice(line.as_bytes());
        record.push(b'\n');

        if self.should_rotate(record.len() as u64) {
            if let Err(e) = self.rotate() {
                warn!("Cannot rotate {}: {}", self.path.display(), e);
            }
        }

        self.file.write_all(&record)?;
        if self.policy.sync {
            self.file.sync_data()?;
        }
        self.size += record.len() as u64;
        Ok(())
    }

    fn should_rotate(&self, incoming: u64) -> bool {
        self.policy.max_bytes > 0
            && self.policy.backup_count > 0
            && self.size > 0
            && self.size.saturating_add(incoming) >= self.policy.max_bytes
    }

    /// Shifts the backups up by one, moves the active file to `.1` and starts a
    /// fresh active file. Without backups configured the file is left as is.
    ///
    /// Whatever happens, the writer ends up appending to `<path>` with its
    /// size re-read from disk.
    pub fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.policy.backup_count == 0 {
            return Ok(());
        }

        let shifted = if self.path.exists() {
            self.shift_backups()
        } else {
            Ok(())
        };
        let reopened = self.reopen();
        shifted.and(reopened)
    }

    fn shift_backups(&self) -> io::Result<()> {
        for index in (1..self.policy.backup_count).rev() {
            let source = backup_path(&self.path, index);
            if source.exists() {
                let target = backup_path(&self.path, index + 1);
                remove_if_exists(&target)?;
                fs::rename(&source, &target)?;
            }
        }

        let first = backup_path(&self.path, 1);
        remove_if_exists(&first)?;
        fs::rename(&self.path, &first)
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = open_append(&self.path)?;
        self.size = file.metadata()?.len();
        self.file = file;
        Ok(())
    }
}

/// `<path>.<index>`
pub fn backup_path(path: &Path, index: u32) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
