use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use tracing::debug;

use crate::sink::format::{Record, RecordFormat};
use crate::sink::rotating::{RotatingFileWriter, RotationPolicy};
use crate::utils::SinkError;

/// Everything needed to open the sink of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkDescriptor {
    pub broker: String,
    pub topic: String,
    /// Log file as configured; relative paths are resolved against the registry root.
    pub path: PathBuf,
    pub format: RecordFormat,
    pub policy: RotationPolicy,
}

/// Absolute paths are kept, relative ones are joined to `root`.
pub fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[derive(Debug)]
struct Sink {
    name: String,
    broker: String,
    format: RecordFormat,
    writer: Mutex<RotatingFileWriter>,
}

/// Shared reference to an open sink.
#[derive(Debug, Clone)]
pub struct SinkHandle(Arc<Sink>);

impl SinkHandle {
    /// `<broker>:<topic filter>`
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn path(&self) -> PathBuf {
        self.0
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .path()
            .to_path_buf()
    }
}

type SinkKey = (String, String);

/// Owns one rotating writer per subscription, keyed by (broker, topic).
#[derive(Debug)]
pub struct SinkRegistry {
    root: PathBuf,
    sinks: Mutex<HashMap<SinkKey, SinkHandle>>,
}

impl SinkRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens the log file described by `descriptor` and registers it.
    ///
    /// The target directory must exist; nothing is created besides the file.
    pub fn open(&self, descriptor: &SinkDescriptor) -> Result<SinkHandle, SinkError> {
        let key = (descriptor.broker.clone(), descriptor.topic.clone());
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        if sinks.contains_key(&key) {
            return Err(SinkError::AlreadyOpen {
                broker: key.0,
                topic: key.1,
            });
        }

        let path = resolve_path(&self.root, &descriptor.path);
        let writer = RotatingFileWriter::open(&path, descriptor.policy)
            .map_err(|source| SinkError::Open {
                path: path.clone(),
                source,
            })?;
        debug!(
            "Opened sink {} (max_bytes={}, backup_count={})",
            path.display(),
            descriptor.policy.max_bytes,
            descriptor.policy.backup_count
        );

        let handle = SinkHandle(Arc::new(Sink {
            name: format!("{}:{}", descriptor.broker, descriptor.topic),
            broker: descriptor.broker.clone(),
            format: descriptor.format.clone(),
            writer: Mutex::new(writer),
        }));
        sinks.insert(key, handle.clone());
        Ok(handle)
    }

    /// Formats `message` and appends it as one line. Rotation and the write
    /// happen under the sink's own lock.
    pub fn write(&self, handle: &SinkHandle, topic: &str, message: &str) -> Result<(), SinkError> {
        let sink = &handle.0;
        let line = sink.format.render(&Record {
            name: &sink.name,
            broker: &sink.broker,
            topic,
            message,
            created: Local::now(),
        });

        let mut writer = sink.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_line(&line).map_err(|source| SinkError::Write {
            path: writer.path().to_path_buf(),
            source,
        })
    }

    pub fn get(&self, broker: &str, topic: &str) -> Option<SinkHandle> {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(broker.to_string(), topic.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
