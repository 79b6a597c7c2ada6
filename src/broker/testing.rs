//! In-memory stand-ins for the network side, shared by the unit tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::transport::{
    Connector, SubscribeToken, Transport, TransportEvent, TransportLink,
};
use crate::config::{BrokerEndpoint, Qos};
use crate::utils::TransportError;

#[derive(Default)]
pub struct MockTransport {
    next_token: AtomicU16,
    pub subscribes: Mutex<Vec<(String, Qos, SubscribeToken)>>,
    pub unsubscribes: Mutex<Vec<String>>,
    pub disconnected: AtomicBool,
    pub fail_subscribe: AtomicBool,
}

impl MockTransport {
    pub fn subscribe_calls(&self) -> Vec<(String, Qos, SubscribeToken)> {
        self.subscribes.lock().unwrap().clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.unsubscribes.lock().unwrap().clone()
    }

    pub fn token_for(&self, filter: &str) -> Option<SubscribeToken> {
        self.subscribes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(f, _, _)| f == filter)
            .map(|(_, _, token)| *token)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<SubscribeToken, TransportError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Client("subscribe refused".to_string()));
        }
        let token = SubscribeToken(self.next_token.fetch_add(1, Ordering::SeqCst) + 1);
        self.subscribes
            .lock()
            .unwrap()
            .push((filter.to_string(), qos, token));
        Ok(token)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.unsubscribes.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// The test's end of one started transport.
#[derive(Clone)]
pub struct MockLink {
    pub events: mpsc::Sender<TransportEvent>,
    pub transport: Arc<MockTransport>,
}

impl MockLink {
    pub async fn send(&self, event: TransportEvent) {
        self.events.send(event).await.unwrap();
    }

    pub async fn connected(&self) {
        self.send(TransportEvent::Connected {
            result_code: "Success".to_string(),
        })
        .await;
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) {
        self.send(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
        .await;
    }
}

#[derive(Default)]
pub struct MockConnector {
    pub starts: AtomicUsize,
    links: Mutex<HashMap<String, MockLink>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The most recently started link for `broker`.
    pub fn link(&self, broker: &str) -> Option<MockLink> {
        self.links.lock().unwrap().get(broker).cloned()
    }

    pub async fn wait_link(&self, broker: &str) -> MockLink {
        wait_until(|| self.link(broker).is_some()).await;
        self.link(broker).unwrap()
    }
}

impl Connector for MockConnector {
    fn start(&self, endpoint: &BrokerEndpoint) -> Result<TransportLink, TransportError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        let transport = Arc::new(MockTransport::default());
        self.links.lock().unwrap().insert(
            endpoint.name.clone(),
            MockLink {
                events: tx,
                transport: transport.clone(),
            },
        );
        Ok(TransportLink {
            transport,
            events: rx,
        })
    }
}

pub fn endpoint(name: &str) -> BrokerEndpoint {
    BrokerEndpoint {
        name: name.to_string(),
        address: "localhost".to_string(),
        port: 1883,
        username: None,
        password: None,
        client_id: None,
        keep_alive_secs: 60,
    }
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Awaits `future` with a two second guard.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("future did not complete in time")
}
