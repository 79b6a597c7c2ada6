//! The `error` module defines the error types used within `mqtt-logger`.
//!
//! Errors fall into two groups. [`SettingsError`] and [`SinkError::Open`]
//! are fatal and abort startup. [`TransportError`] and [`SinkError::Write`]
//! are contained by the component that hit them and only ever surface as
//! log lines.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration problems detected while loading settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// The configuration source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A required field is absent.
    #[error("{section}[{index}]: `{field}` is required")]
    MissingField {
        section: &'static str,
        index: usize,
        field: &'static str,
    },

    #[error("broker name \"{0}\" is already defined")]
    DuplicateBroker(String),

    #[error("topic \"{topic}\" references undefined broker \"{broker}\"")]
    UnknownBroker { topic: String, broker: String },

    #[error("topic \"{topic}\" is subscribed twice on broker \"{broker}\"")]
    DuplicateSubscription { broker: String, topic: String },

    #[error("log file {0} is used by more than one topic")]
    SharedLogPath(PathBuf),

    #[error("invalid size \"{0}\": expected a byte count or a number with a K/M/G suffix")]
    InvalidSize(String),

    #[error("invalid qos {0}: expected 0, 1 or 2")]
    InvalidQos(u8),

    #[error("unknown encoding \"{0}\"")]
    UnknownEncoding(String),

    #[error("invalid format template \"{0}\"")]
    InvalidFormat(String),

    #[error("unknown format placeholder \"%({0})\"")]
    UnknownPlaceholder(String),

    #[error("no brokers are defined")]
    NoBrokers,

    #[error("no topics are defined")]
    NoTopics,
}

/// Failures opening or appending to a rotating sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("cannot open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write to log file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("a sink for {broker}:{topic} is already open")]
    AlreadyOpen { broker: String, topic: String },
}

/// Failures reported by the broker client.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("client request failed: {0}")]
    Client(String),

    /// The network task has stopped and no longer accepts requests.
    #[error("transport closed")]
    Closed,
}

/// Errors surfaced by the bridge while starting up or subscribing.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("broker \"{0}\" is not defined")]
    UnknownBroker(String),

    #[error("invalid subscription: {0}")]
    InvalidSubscription(&'static str),

    /// `subscribe` was called on a connection that was never started or is shut down.
    #[error("broker \"{0}\" has no active connection")]
    NotConnected(String),
}
