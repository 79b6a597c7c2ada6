//! # mqtt-logger
//!
//! `mqtt-logger` subscribes to topics on one or more MQTT brokers and appends
//! every received message to a size-rotated log file, one file per
//! subscription.
//!
//! ## Core Modules
//!
//! - `bridge`: Startup, the run loop and graceful shutdown.
//! - `broker`: Broker connections, message routing and the MQTT transport.
//! - `config`: Loading and validating the configuration.
//! - `sink`: Rotating log files and record formatting.
//! - `subscription`: One topic filter bound to one broker and one sink.
//! - `utils`: Shared utilities such as error types and logging setup.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod sink;
pub mod subscription;
pub mod utils;
