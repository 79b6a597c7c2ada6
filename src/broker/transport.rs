use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{BrokerEndpoint, Qos};
use crate::utils::TransportError;

/// Broker-assigned identifier of a subscribe request (the MQTT packet id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscribeToken(pub u16);

impl fmt::Display for SubscribeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one filter in a SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantedQos {
    Granted(Qos),
    Rejected,
}

impl fmt::Display for GrantedQos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrantedQos::Granted(qos) => write!(f, "{qos}"),
            GrantedQos::Rejected => f.write_str("rejected"),
        }
    }
}

/// Everything the network side reports to a connection's worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { result_code: String },
    Disconnected { result_code: String },
    Message { topic: String, payload: Vec<u8> },
    SubscribeAck {
        token: SubscribeToken,
        granted: Vec<GrantedQos>,
    },
}

/// Requests a connection sends to its broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queues a subscribe and resolves once the broker-facing packet id is known.
    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<SubscribeToken, TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Closes the session and stops the network task.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Everything a worker needs from a freshly started transport.
pub struct TransportLink {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Creates transports. Starting one must not block: the connection attempt
/// and every reconnect happen in the background.
pub trait Connector: Send + Sync {
    fn start(&self, endpoint: &BrokerEndpoint) -> Result<TransportLink, TransportError>;
}
