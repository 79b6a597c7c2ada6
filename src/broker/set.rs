use std::sync::Arc;

use crate::broker::connection::BrokerConnection;
use crate::broker::transport::Connector;
use crate::config::BrokerEndpoint;
use crate::utils::{BridgeError, SettingsError};

/// Every broker connection of the bridge, looked up by broker name.
#[derive(Debug, Default)]
pub struct BrokerSet {
    connections: Vec<Arc<BrokerConnection>>,
}

impl BrokerSet {
    /// Builds one (not yet started) connection per endpoint.
    pub fn new(
        endpoints: &[BrokerEndpoint],
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SettingsError> {
        let mut connections: Vec<Arc<BrokerConnection>> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if connections.iter().any(|c| c.name() == endpoint.name) {
                return Err(SettingsError::DuplicateBroker(endpoint.name.clone()));
            }
            connections.push(Arc::new(BrokerConnection::new(
                endpoint.clone(),
                connector.clone(),
            )));
        }
        Ok(Self { connections })
    }

    pub fn get(&self, name: &str) -> Result<&Arc<BrokerConnection>, BridgeError> {
        self.connections
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| BridgeError::UnknownBroker(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BrokerConnection>> {
        self.connections.iter()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
