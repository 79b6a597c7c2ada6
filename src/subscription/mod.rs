//! The `subscription` module binds one topic filter on one broker to its sink.
//!
//! A [`TopicSubscription`] is built once at startup from
//! [`TopicSettings`](crate::config::TopicSettings). Its broker reference is
//! resolved before anything is opened, so a bad reference never leaves a
//! half-registered subscription behind.

pub mod encoding;

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, warn};

use crate::broker::{BrokerConnection, BrokerSet, GrantedQos, SubscribeToken};
use crate::config::{Qos, TopicSettings};
use crate::sink::{SinkHandle, SinkRegistry};
use crate::utils::BridgeError;

pub use encoding::{DecodeError, Encoding};

/// Where a subscription stands in the subscribe handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeState {
    /// No subscribe request has been issued yet.
    Idle,
    Pending(SubscribeToken),
    Acked(GrantedQos),
}

#[derive(Debug)]
pub struct TopicSubscription {
    broker: String,
    topic: String,
    qos: Qos,
    encoding: Encoding,
    sinks: Arc<SinkRegistry>,
    sink: SinkHandle,
    state: Mutex<SubscribeState>,
}

impl TopicSubscription {
    /// Resolves the broker, opens the sink and subscribes. Waits until the
    /// broker connection is up.
    pub async fn subscribe(
        settings: &TopicSettings,
        brokers: &BrokerSet,
        sinks: &Arc<SinkRegistry>,
    ) -> Result<Arc<Self>, BridgeError> {
        let (connection, subscription) = Self::bind(settings, brokers, sinks)?;
        connection.subscribe(subscription.clone()).await?;
        Ok(subscription)
    }

    /// Validates `settings`, resolves its broker and opens the sink, without
    /// talking to the broker.
    pub fn bind(
        settings: &TopicSettings,
        brokers: &BrokerSet,
        sinks: &Arc<SinkRegistry>,
    ) -> Result<(Arc<BrokerConnection>, Arc<Self>), BridgeError> {
        if settings.topic.trim().is_empty() {
            return Err(BridgeError::InvalidSubscription("topic is required"));
        }
        if settings.broker.trim().is_empty() {
            return Err(BridgeError::InvalidSubscription("broker is required"));
        }

        let connection = brokers.get(&settings.broker)?.clone();
        let sink = sinks.open(&settings.sink)?;

        let subscription = Arc::new(Self {
            broker: settings.broker.clone(),
            topic: settings.topic.clone(),
            qos: settings.qos,
            encoding: settings.encoding,
            sinks: sinks.clone(),
            sink,
            state: Mutex::new(SubscribeState::Idle),
        });
        Ok((connection, subscription))
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// The topic filter, possibly with wildcards.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> Qos {
        self.qos
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn sink(&self) -> &SinkHandle {
        &self.sink
    }

    pub fn state(&self) -> SubscribeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending_token(&self) -> Option<SubscribeToken> {
        match self.state() {
            SubscribeState::Pending(token) => Some(token),
            _ => None,
        }
    }

    pub(crate) fn set_pending(&self, token: SubscribeToken) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SubscribeState::Pending(token);
    }

    pub(crate) fn acknowledge(&self, granted: GrantedQos) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SubscribeState::Acked(granted);
    }

    /// Decodes one payload and appends it to the sink. Failures drop the message.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let text = match self.encoding.decode(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    "Dropping message on {}:{}: cannot decode as {}: {}",
                    self.broker, topic, self.encoding, e
                );
                return;
            }
        };

        if let Err(e) = self.sinks.write(&self.sink, topic, &text) {
            error!("Dropping message on {}:{}: {}", self.broker, topic, e);
        }
    }
}
