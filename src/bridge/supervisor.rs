use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::broker::{BrokerSet, Connector};
use crate::config::Settings;
use crate::sink::SinkRegistry;
use crate::subscription::TopicSubscription;
use crate::utils::BridgeError;

/// Builds every connection and subscription from [`Settings`] and tears
/// them down again on shutdown.
#[derive(Debug)]
pub struct BridgeSupervisor {
    settings: Settings,
    sinks: Arc<SinkRegistry>,
    brokers: BrokerSet,
    subscriptions: Mutex<Vec<Arc<TopicSubscription>>>,
    stopped: AtomicBool,
}

impl BridgeSupervisor {
    pub fn new(settings: Settings, connector: Arc<dyn Connector>) -> Result<Self, BridgeError> {
        let brokers = BrokerSet::new(&settings.brokers, connector)?;
        let sinks = Arc::new(SinkRegistry::new(settings.logging.root.clone()));
        Ok(Self {
            settings,
            sinks,
            brokers,
            subscriptions: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn brokers(&self) -> &BrokerSet {
        &self.brokers
    }

    pub fn sinks(&self) -> &Arc<SinkRegistry> {
        &self.sinks
    }

    pub fn subscriptions(&self) -> Vec<Arc<TopicSubscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts every broker connection, then subscribes every topic in
    /// configuration order. Each subscribe waits for its broker to connect.
    pub async fn start(&self) -> Result<(), BridgeError> {
        for connection in self.brokers.iter() {
            connection.connect()?;
        }

        for topic in &self.settings.topics {
            let subscription = TopicSubscription::subscribe(topic, &self.brokers, &self.sinks).await?;
            self.subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(subscription);
        }

        info!(
            "Logging {} topic(s) from {} broker(s)",
            self.settings.topics.len(),
            self.brokers.len()
        );
        Ok(())
    }

    /// Disconnects every broker. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already done");
            return;
        }

        info!("Shutting down");
        for connection in self.brokers.iter() {
            connection.disconnect().await;
        }
        info!("Shutdown complete");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Runs until `signal` resolves, then shuts down.
    ///
    /// The signal is honoured during startup too, so a broker that never
    /// comes up does not keep the process alive. A startup error shuts down
    /// whatever was started and is returned.
    pub async fn run<S>(&self, signal: S) -> Result<(), BridgeError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(signal);

        let started = tokio::select! {
            result = self.start() => result,
            _ = &mut signal => {
                info!("Shutdown requested during startup");
                self.shutdown().await;
                return Ok(());
            }
        };

        if let Err(e) = started {
            self.shutdown().await;
            return Err(e);
        }

        signal.await;
        self.shutdown().await;
        Ok(())
    }
}
