//! The `broker` module manages connections to MQTT brokers.
//!
//! A [`BrokerConnection`] owns one client. The network side reports through
//! a [`TransportEvent`] channel that the connection's worker task drains, so
//! every connect, disconnect, message and SUBACK of one broker is handled
//! in order on that worker.

pub mod connection;
pub mod mqtt;
pub mod set;
pub mod topic;
pub mod transport;

pub use connection::{BrokerConnection, CONNECT_POLL_INTERVAL};
pub use mqtt::MqttConnector;
pub use set::BrokerSet;
pub use topic::filter_matches;
pub use transport::{
    Connector, GrantedQos, SubscribeToken, Transport, TransportEvent, TransportLink,
};

#[cfg(test)]
pub(crate) mod testing;


#[cfg(test)]
mod mqtt_tests;
