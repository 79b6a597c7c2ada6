//! The `sink` module persists received messages.
//!
//! Each subscription owns exactly one sink: a plain-text log file that
//! rotates by size. [`SinkRegistry`] opens and tracks them,
//! [`RotatingFileWriter`] does the file work and [`RecordFormat`] renders
//! each record line.

pub mod format;
pub mod registry;
pub mod rotating;

pub use format::{Record, RecordFormat};
pub use registry::{SinkDescriptor, SinkHandle, SinkRegistry, resolve_path};
pub use rotating::{RotatingFileWriter, RotationPolicy};
