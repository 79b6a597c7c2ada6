use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::topic::filter_matches;
use crate::broker::transport::{
    Connector, GrantedQos, SubscribeToken, Transport, TransportEvent, TransportLink,
};
use crate::config::BrokerEndpoint;
use crate::subscription::TopicSubscription;
use crate::utils::BridgeError;

/// Upper bound on how long `subscribe` sleeps between checks of the connected flag.
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ConnectionState {
    subscriptions: Vec<Arc<TopicSubscription>>,
    // acks that arrived before `subscribe` recorded their token
    early_acks: HashMap<SubscribeToken, Vec<GrantedQos>>,
    ever_connected: bool,
    /// Set by `disconnect`; the worker drops every event from then on.
    closed: bool,
}

/// State touched by both the worker and callers of the public API.
struct Shared {
    endpoint: BrokerEndpoint,
    state: Mutex<ConnectionState>,
    connected: watch::Sender<bool>,
}

struct ClientHandle {
    transport: Arc<dyn Transport>,
    worker: JoinHandle<()>,
    stop: Arc<Notify>,
}

/// One physical connection to one broker, and the subscriptions routed through it.
pub struct BrokerConnection {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    handle: Mutex<Option<ClientHandle>>,
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("name", &self.shared.endpoint.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl BrokerConnection {
    pub fn new(endpoint: BrokerEndpoint, connector: Arc<dyn Connector>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                endpoint,
                state: Mutex::new(ConnectionState::default()),
                connected,
            }),
            connector,
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.endpoint.name
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.shared.endpoint
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// True while a client handle exists, connected or not.
    pub fn is_started(&self) -> bool {
        lock(&self.handle).is_some()
    }

    pub fn subscriptions(&self) -> Vec<Arc<TopicSubscription>> {
        lock(&self.shared.state).subscriptions.clone()
    }

    /// Starts the client in the background. Calling it again while a client
    /// exists does nothing.
    pub fn connect(&self) -> Result<(), BridgeError> {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            debug!("Already connecting to {}", self.name());
            return Ok(());
        }

        let endpoint = &self.shared.endpoint;
        info!(
            "Connecting to {} ({}:{})",
            endpoint.name, endpoint.address, endpoint.port
        );
        let TransportLink { transport, events } = self.connector.start(endpoint)?;
        lock(&self.shared.state).closed = false;

        let stop = Arc::new(Notify::new());
        let worker = tokio::spawn(run_worker(
            self.shared.clone(),
            transport.clone(),
            events,
            stop.clone(),
        ));
        *handle = Some(ClientHandle {
            transport,
            worker,
            stop,
        });
        Ok(())
    }

    /// Subscribes `subscription` once the connection is up, returning the
    /// token of the subscribe request.
    ///
    /// Waits for the connected flag without holding any lock, re-checking at
    /// least every [`CONNECT_POLL_INTERVAL`].
    pub async fn subscribe(
        &self,
        subscription: Arc<TopicSubscription>,
    ) -> Result<SubscribeToken, BridgeError> {
        self.wait_connected().await?;
        let transport = self
            .transport()
            .ok_or_else(|| BridgeError::NotConnected(self.name().to_string()))?;

        // routed from now on, so nothing published right after the SUBACK is lost
        {
            let mut state = lock(&self.shared.state);
            if !state
                .subscriptions
                .iter()
                .any(|s| Arc::ptr_eq(s, &subscription))
            {
                state.subscriptions.push(subscription.clone());
            }
        }

        match transport
            .subscribe(subscription.topic(), subscription.qos())
            .await
        {
            Ok(token) => {
                self.shared.record_token(&subscription, token);
                debug!(
                    "Subscribe to {}:{} sent with token {}",
                    self.name(),
                    subscription.topic(),
                    token
                );
                Ok(token)
            }
            Err(e) => {
                lock(&self.shared.state)
                    .subscriptions
                    .retain(|s| !Arc::ptr_eq(s, &subscription));
                Err(e.into())
            }
        }
    }

    async fn wait_connected(&self) -> Result<(), BridgeError> {
        let mut connected = self.shared.connected.subscribe();
        loop {
            if !self.is_started() {
                return Err(BridgeError::NotConnected(self.name().to_string()));
            }
            let waited = tokio::time::timeout(CONNECT_POLL_INTERVAL, connected.wait_for(|c| *c))
                .await
                .map(|ready| ready.is_ok());
            match waited {
                Ok(true) => return Ok(()),
                Ok(false) => return Err(BridgeError::NotConnected(self.name().to_string())),
                Err(_) => debug!("Waiting for connection to {}", self.name()),
            }
        }
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.handle).as_ref().map(|h| h.transport.clone())
    }

    /// Stops routing, unsubscribes, closes the client and waits for the
    /// worker to exit. Does nothing if there is no client.
    ///
    /// Subscriptions are forgotten, so a later `connect` starts with none.
    pub async fn disconnect(&self) {
        let Some(handle) = lock(&self.handle).take() else {
            debug!("Not connected to {}; nothing to disconnect", self.name());
            return;
        };

        let filters: Vec<String> = {
            let mut state = lock(&self.shared.state);
            state.closed = true;
            state.ever_connected = false;
            state
                .subscriptions
                .drain(..)
                .map(|s| s.topic().to_string())
                .collect()
        };
        handle.stop.notify_one();

        let was_connected = self.is_connected();
        if was_connected {
            for filter in &filters {
                if let Err(e) = handle.transport.unsubscribe(filter).await {
                    warn!("Failed to unsubscribe {}:{}: {}", self.name(), filter, e);
                }
            }
        }

        if let Err(e) = handle.transport.disconnect().await {
            warn!("Failed to close connection to {}: {}", self.name(), e);
        }
        if let Err(e) = handle.worker.await {
            warn!("Worker for {} ended abnormally: {}", self.name(), e);
        }

        self.shared.connected.send_replace(false);
        lock(&self.shared.state).early_acks.clear();

        let endpoint = &self.shared.endpoint;
        info!(
            "Closed connection to {} ({}:{})",
            endpoint.name, endpoint.address, endpoint.port
        );
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    mut events: mpsc::Receiver<TransportEvent>,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if lock(&shared.state).closed {
                        break;
                    }
                    shared.handle_event(event, &transport).await;
                }
                None => break,
            },
            _ = stop.notified() => break,
        }
    }
    debug!("Worker for {} stopped", shared.endpoint.name);
}

impl Shared {
    async fn handle_event(self: &Arc<Self>, event: TransportEvent, transport: &Arc<dyn Transport>) {
        match event {
            TransportEvent::Connected { result_code } => self.on_connect(&result_code, transport),
            TransportEvent::Disconnected { result_code } => self.on_disconnect(&result_code),
            TransportEvent::Message { topic, payload } => self.on_message(topic, payload).await,
            TransportEvent::SubscribeAck { token, granted } => self.on_subscribe_ack(token, granted),
        }
    }

    fn on_connect(self: &Arc<Self>, result_code: &str, transport: &Arc<dyn Transport>) {
        let resubscribe = {
            let mut state = lock(&self.state);
            let reconnect = state.ever_connected;
            state.ever_connected = true;
            if reconnect {
                state.subscriptions.clone()
            } else {
                Vec::new()
            }
        };

        self.connected.send_replace(true);
        info!(
            "Connected to {} ({}:{}) with result code {}",
            self.endpoint.name, self.endpoint.address, self.endpoint.port, result_code
        );

        // clean sessions forget subscriptions across reconnects
        for subscription in resubscribe {
            let shared = self.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                match transport
                    .subscribe(subscription.topic(), subscription.qos())
                    .await
                {
                    Ok(token) => shared.record_token(&subscription, token),
                    Err(e) => warn!(
                        "Failed to resubscribe {}:{}: {}",
                        shared.endpoint.name,
                        subscription.topic(),
                        e
                    ),
                }
            });
        }
    }

    fn on_disconnect(&self, result_code: &str) {
        self.connected.send_replace(false);
        lock(&self.state).early_acks.clear();
        warn!(
            "Disconnected from {} ({}:{}) with result code {}",
            self.endpoint.name, self.endpoint.address, self.endpoint.port, result_code
        );
    }

    /// Writes the message to every matching sink. The file I/O runs on the
    /// blocking pool; the worker waits for it so per-topic order holds.
    async fn on_message(&self, topic: String, payload: Vec<u8>) {
        let targets: Vec<Arc<TopicSubscription>> = lock(&self.state)
            .subscriptions
            .iter()
            .filter(|s| filter_matches(s.topic(), &topic))
            .cloned()
            .collect();

        if targets.is_empty() {
            debug!("No subscription on {} matches {}", self.endpoint.name, topic);
            return;
        }
        let written = tokio::task::spawn_blocking(move || {
            for subscription in &targets {
                subscription.deliver(&topic, &payload);
            }
        })
        .await;
        if let Err(e) = written {
            error!("Sink writes for {} failed: {}", self.endpoint.name, e);
        }
    }

    fn on_subscribe_ack(&self, token: SubscribeToken, granted: Vec<GrantedQos>) {
        let mut state = lock(&self.state);
        let matched = state
            .subscriptions
            .iter()
            .find(|s| s.pending_token() == Some(token))
            .cloned();

        match matched {
            Some(subscription) => {
                drop(state);
                self.acknowledge(&subscription, &granted);
            }
            None => {
                debug!(
                    "Holding ack {} from {} until its subscribe is recorded",
                    token, self.endpoint.name
                );
                state.early_acks.insert(token, granted);
            }
        }
    }

    /// Marks `subscription` as waiting on `token`, or applies the ack right
    /// away if it already arrived.
    fn record_token(&self, subscription: &TopicSubscription, token: SubscribeToken) {
        let mut state = lock(&self.state);
        match state.early_acks.remove(&token) {
            Some(granted) => {
                drop(state);
                self.acknowledge(subscription, &granted);
            }
            None => subscription.set_pending(token),
        }
    }

    fn acknowledge(&self, subscription: &TopicSubscription, granted: &[GrantedQos]) {
        let first = granted.first().copied().unwrap_or(GrantedQos::Rejected);
        subscription.acknowledge(first);
        match first {
            GrantedQos::Granted(qos) => info!(
                "Subscribed to {}:{} with qos {}",
                self.endpoint.name,
                subscription.topic(),
                qos
            ),
            GrantedQos::Rejected => warn!(
                "Broker {} rejected subscription to {}",
                self.endpoint.name,
                subscription.topic()
            ),
        }
    }
}
