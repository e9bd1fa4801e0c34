//! Scan ingestion lifecycle
//!
//! A [`Processor`] owns one subscription and one store. [`Processor::start`]
//! receives messages until a termination signal arrives or
//! [`Processor::stop`] is called, then waits for in-flight messages to be
//! settled before returning.
//!
//! # State machine
//!
//! ```text
//! Idle --start--> Running --signal/stop--> Draining --loop returns--> Stopped
//! ```

mod handler;

pub use handler::ScanHandler;

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::pubsub::PubsubClient;
use crate::broker::{MessageHandler, Subscription};
use crate::config::PubsubConfig;
use crate::error::ProcessorError;
use crate::storage::ScanStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::Running => "running",
            State::Draining => "draining",
            State::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub struct Processor {
    subscription: Arc<dyn Subscription>,
    store: Arc<dyn ScanStore>,
    state: watch::Sender<State>,
    shutdown: watch::Sender<bool>,
}

impl Processor {
    /// Connect to Pub/Sub and verify that the configured subscription exists.
    pub async fn new(config: &PubsubConfig, store: Arc<dyn ScanStore>) -> Result<Self, ProcessorError> {
        config.validate()?;

        let client = PubsubClient::new(config)?;
        let topic = client.topic(config.topic_id());
        let subscription = client.subscription(
            config.subscription_id(),
            config.max_messages,
            config.max_outstanding,
        );

        let info = subscription
            .info()
            .await?
            .ok_or_else(|| ProcessorError::SubscriptionNotFound(subscription.name().to_string()))?;

        if info.topic != topic.path() {
            warn!(
                subscription = %info.name,
                attached_topic = %info.topic,
                configured_topic = %topic.path(),
                "Subscription is attached to a different topic than configured"
            );
        }

        info!(
            subscription = %subscription.name(),
            topic = %info.topic,
            store = store.name(),
            "Processor created"
        );
        Ok(Self::from_parts(Arc::new(subscription), store))
    }

    /// Build a processor over an existing subscription.
    pub async fn with_subscription(
        subscription: Arc<dyn Subscription>,
        store: Arc<dyn ScanStore>,
    ) -> Result<Self, ProcessorError> {
        if !subscription.exists().await? {
            return Err(ProcessorError::SubscriptionNotFound(
                subscription.name().to_string(),
            ));
        }
        Ok(Self::from_parts(subscription, store))
    }

    fn from_parts(subscription: Arc<dyn Subscription>, store: Arc<dyn ScanStore>) -> Self {
        let (state, _) = watch::channel(State::Idle);
        let (shutdown, _) = watch::channel(false);
        Self {
            subscription,
            store,
            state,
            shutdown,
        }
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Receive and process messages until shutdown completes.
    ///
    /// Transport failures end the loop and are logged; they are not returned
    /// as errors. Fails only when the processor was already started or the
    /// signal listener cannot be installed.
    pub async fn start(&self) -> Result<(), ProcessorError> {
        let started = self.state.send_if_modified(|state| {
            if *state == State::Idle {
                *state = State::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ProcessorError::AlreadyStarted(self.state()));
        }

        let mut signals = match TerminationSignals::install() {
            Ok(signals) => signals,
            Err(e) => {
                self.state.send_replace(State::Stopped);
                return Err(ProcessorError::Signal(e));
            }
        };

        info!(subscription = %self.subscription.name(), "Processor started");

        let handler: Arc<dyn MessageHandler> = Arc::new(ScanHandler::new(self.store.clone()));
        let mut receive = self
            .subscription
            .receive(handler, self.shutdown.subscribe());

        let finished = tokio::select! {
            result = &mut receive => Some(result),
            signal = signals.recv() => {
                info!(signal, "Received shutdown signal");
                None
            }
        };
        let result = match finished {
            Some(result) => result,
            None => {
                self.stop();
                receive.await
            }
        };

        if let Err(e) = result {
            error!(
                subscription = %self.subscription.name(),
                error = %e,
                "Receive loop failed, shutting down"
            );
            self.shutdown.send_replace(true);
            self.state.send_replace(State::Draining);
        }

        self.state.send_replace(State::Stopped);
        info!(subscription = %self.subscription.name(), "Processor stopped");
        Ok(())
    }

    /// Stop dispatching new messages. In-flight messages are still settled
    /// before [`Processor::start`] returns.
    pub fn stop(&self) {
        let draining = self.state.send_if_modified(|state| {
            if *state == State::Running {
                *state = State::Draining;
                true
            } else {
                false
            }
        });

        if draining {
            info!(subscription = %self.subscription.name(), "Processor draining");
            self.shutdown.send_replace(true);
        } else {
            debug!(state = %self.state(), "Stop requested while not running");
        }
    }
}

#[cfg(unix)]
struct TerminationSignals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(_) => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Disposition;
    use crate::broker::memory::MemorySubscription;
    use crate::error::{BrokerError, StorageError};
    use crate::models::ScanEntry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingStore {
        entries: Mutex<Vec<ScanEntry>>,
    }

    #[async_trait]
    impl ScanStore for RecordingStore {
        async fn upsert(&self, entry: &ScanEntry) -> Result<(), StorageError> {
            self.entries.lock().await.push(entry.clone());
            Ok(())
        }

        async fn close(&self) {}

        fn name(&self) -> &str {
            "recording"
        }
    }

    const V1_BODY: &str = r#"{"data_version":1,"ip":"192.168.0.1","port":80,"service":"http","timestamp":5,"data":{"response_bytes_utf8":"SFRUUC8xLjEgMjAwIE9L"}}"#;

    fn pubsub_config(server: &MockServer) -> PubsubConfig {
        PubsubConfig {
            project_id: Some("test-project".to_string()),
            topic_id: Some("scan-topic".to_string()),
            subscription_id: Some("scan-sub".to_string()),
            emulator_host: Some(server.uri()),
            ..PubsubConfig::default()
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::Idle.to_string(), "idle");
        assert_eq!(State::Draining.to_string(), "draining");
    }

    #[tokio::test]
    async fn test_new_rejects_incomplete_config() {
        let store = Arc::new(RecordingStore::default());
        let err = Processor::new(&PubsubConfig::default(), store)
            .await
            .err()
            .unwrap();
        match err {
            ProcessorError::Configuration(config) => {
                assert!(config.is_missing(crate::config::env::PUBSUB_PROJECT_ID));
                assert!(config.is_missing(crate::config::env::PUBSUB_SUBSCRIPTION_ID));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_new_with_missing_subscription() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/test-project/subscriptions/scan-sub"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let err = Processor::new(&pubsub_config(&server), store)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ProcessorError::SubscriptionNotFound(name)
                if name == "projects/test-project/subscriptions/scan-sub"
        ));
    }

    #[tokio::test]
    async fn test_new_with_existing_subscription() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/test-project/subscriptions/scan-sub"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/test-project/subscriptions/scan-sub",
                "topic": "projects/test-project/topics/other-topic"
            })))
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let processor = Processor::new(&pubsub_config(&server), store).await.unwrap();
        assert_eq!(processor.state(), State::Idle);
    }

    #[tokio::test]
    async fn test_new_with_unreachable_broker() {
        let config = PubsubConfig {
            project_id: Some("test-project".to_string()),
            topic_id: Some("scan-topic".to_string()),
            subscription_id: Some("scan-sub".to_string()),
            emulator_host: Some("127.0.0.1:1".to_string()),
            ..PubsubConfig::default()
        };
        let store = Arc::new(RecordingStore::default());
        let err = Processor::new(&config, store).await.err().unwrap();
        assert!(matches!(err, ProcessorError::Broker(BrokerError::Request { .. })));
    }

    #[tokio::test]
    async fn test_with_missing_subscription() {
        let subscription = Arc::new(MemorySubscription::new("scans", 4));
        subscription.set_exists(false);
        let store = Arc::new(RecordingStore::default());
        let err = Processor::with_subscription(subscription, store)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProcessorError::SubscriptionNotFound(name) if name == "scans"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let subscription = Arc::new(MemorySubscription::new("scans", 4));
        let store = Arc::new(RecordingStore::default());
        let processor = Arc::new(
            Processor::with_subscription(subscription.clone(), store.clone())
                .await
                .unwrap(),
        );
        let mut states = processor.subscribe_state();

        let running = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.start().await })
        };
        states
            .wait_for(|state| *state == State::Running)
            .await
            .unwrap();

        subscription.publish(V1_BODY).unwrap();
        subscription.publish("garbage").unwrap();
        let settled = tokio::time::timeout(
            Duration::from_secs(5),
            subscription.wait_for_settlements(2),
        )
        .await
        .unwrap();
        assert_eq!(
            settled
                .iter()
                .filter(|s| s.disposition == Disposition::Ack)
                .count(),
            1
        );

        processor.stop();
        running.await.unwrap().unwrap();
        assert_eq!(processor.state(), State::Stopped);
        assert_eq!(store.entries.lock().await.len(), 1);

        let err = processor.start().await.unwrap_err();
        assert!(matches!(err, ProcessorError::AlreadyStarted(State::Stopped)));
    }

    #[tokio::test]
    async fn test_transport_error_stops_processor() {
        let subscription = Arc::new(MemorySubscription::new("scans", 4));
        let store = Arc::new(RecordingStore::default());
        let processor = Processor::with_subscription(subscription.clone(), store)
            .await
            .unwrap();

        subscription.disconnect();
        processor.start().await.unwrap();
        assert_eq!(processor.state(), State::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_ignored() {
        let subscription = Arc::new(MemorySubscription::new("scans", 4));
        let store = Arc::new(RecordingStore::default());
        let processor = Processor::with_subscription(subscription, store)
            .await
            .unwrap();

        processor.stop();
        assert_eq!(processor.state(), State::Idle);
    }
}
