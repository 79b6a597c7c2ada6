//! `rumqttc`-backed transport.
//!
//! [`MqttConnector::start`] spawns one network task per broker. The task
//! drives the `rumqttc` event loop, reconnects with exponential backoff and
//! forwards what it sees as [`TransportEvent`]s.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::transport::{
    Connector, GrantedQos, SubscribeToken, Transport, TransportEvent, TransportLink,
};
use crate::config::{BrokerEndpoint, Qos};
use crate::utils::TransportError;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// How long `disconnect` waits for the network task before aborting it.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_KEEP_ALIVE_SECS: u64 = 5;
const CLIENT_ID_PREFIX: &str = "mqtt-logger-";

type PendingTokens = Arc<Mutex<VecDeque<oneshot::Sender<SubscribeToken>>>>;

/// Starts `rumqttc` clients.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    request_capacity: usize,
    event_capacity: usize,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            request_capacity: 64,
            event_capacity: 1024,
        }
    }
}

impl MqttConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connector for MqttConnector {
    fn start(&self, endpoint: &BrokerEndpoint) -> Result<TransportLink, TransportError> {
        let (client, eventloop) = AsyncClient::new(mqtt_options(endpoint), self.request_capacity);
        let (events_tx, events_rx) = mpsc::channel(self.event_capacity);

        let pending: PendingTokens = Arc::default();
        let stopping = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let pump = tokio::spawn(pump(
            eventloop,
            events_tx,
            pending.clone(),
            stopping.clone(),
            shutdown.clone(),
            endpoint.name.clone(),
        ));

        let transport = MqttTransport {
            client,
            pending,
            subscribe_order: tokio::sync::Mutex::new(()),
            stopping,
            shutdown,
            pump: Mutex::new(Some(pump)),
        };

        Ok(TransportLink {
            transport: Arc::new(transport),
            events: events_rx,
        })
    }
}

pub(crate) fn mqtt_options(endpoint: &BrokerEndpoint) -> MqttOptions {
    let client_id = endpoint.client_id.clone().unwrap_or_else(|| {
        let id = Uuid::new_v4().simple().to_string();
        // keep within the 23 characters every MQTT 3.1.1 broker must accept
        format!("{CLIENT_ID_PREFIX}{}", &id[..11])
    });

    let mut options = MqttOptions::new(client_id, endpoint.address.clone(), endpoint.port);
    options.set_keep_alive(Duration::from_secs(
        endpoint.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
    ));
    options.set_clean_session(true);
    if let Some(username) = &endpoint.username {
        options.set_credentials(username.clone(), endpoint.password.clone().unwrap_or_default());
    }
    options
}

pub fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub(crate) fn granted_qos(code: &SubscribeReasonCode) -> GrantedQos {
    match code {
        SubscribeReasonCode::Success(QoS::AtMostOnce) => GrantedQos::Granted(Qos::AtMostOnce),
        SubscribeReasonCode::Success(QoS::AtLeastOnce) => GrantedQos::Granted(Qos::AtLeastOnce),
        SubscribeReasonCode::Success(QoS::ExactlyOnce) => GrantedQos::Granted(Qos::ExactlyOnce),
        SubscribeReasonCode::Failure => GrantedQos::Rejected,
    }
}

/// Delay before the reconnect attempt after the one that waited `current`.
pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Drives the event loop until the client disconnects or the worker goes away.
async fn pump(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    pending: PendingTokens,
    stopping: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    broker: String,
) {
    let mut connected = false;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                connected = true;
                backoff = INITIAL_BACKOFF;
                TransportEvent::Connected {
                    result_code: format!("{:?}", ack.code),
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Incoming(Packet::SubAck(ack))) => TransportEvent::SubscribeAck {
                token: SubscribeToken(ack.pkid),
                granted: ack.return_codes.iter().map(granted_qos).collect(),
            },
            Ok(Event::Incoming(Packet::Disconnect)) if connected => {
                connected = false;
                TransportEvent::Disconnected {
                    result_code: "disconnected by broker".to_string(),
                }
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(SubscribeToken(pkid));
                }
                continue;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Sent disconnect to {}", broker);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                let lost = connected;
                connected = false;
                if !lost {
                    warn!(
                        "Connection attempt to {} failed: {}; retrying in {:?}",
                        broker, e, backoff
                    );
                }

                if lost
                    && events
                        .send(TransportEvent::Disconnected {
                            result_code: e.to_string(),
                        })
                        .await
                        .is_err()
                {
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.notified() => break,
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };

        if events.send(event).await.is_err() {
            break;
        }
    }

    debug!("Network task for {} stopped", broker);
}

/// Handle to one running `rumqttc` client.
pub struct MqttTransport {
    client: AsyncClient,
    pending: PendingTokens,
    // packet ids are assigned in request order, so requests and waiters must be queued together
    subscribe_order: tokio::sync::Mutex<()>,
    stopping: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<SubscribeToken, TransportError> {
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.subscribe_order.lock().await;
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(tx);
            if let Err(e) = self.client.subscribe(filter, to_mqtt_qos(qos)).await {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_back();
                return Err(TransportError::Client(e.to_string()));
            }
        }
        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stopping.store(true, Ordering::Release);
        // wakes the network task if it is sleeping between reconnect attempts
        self.shutdown.notify_one();
        match tokio::time::timeout(DISCONNECT_TIMEOUT, self.client.disconnect()).await {
            Ok(Err(e)) => debug!("Disconnect request not delivered: {}", e),
            Err(_) => debug!("Disconnect request timed out"),
            Ok(Ok(())) => {}
        }

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut pump)
                .await
                .is_err()
            {
                warn!("Network task did not stop within {:?}; aborting", DISCONNECT_TIMEOUT);
                pump.abort();
            }
        }
        Ok(())
    }
}
