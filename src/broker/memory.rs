//! In-process broker
//!
//! Messages published to a [`MemorySubscription`] are delivered through the
//! same dispatcher as the Pub/Sub client, and every ack or nack is recorded
//! so callers can inspect the outcome. Nacked messages are recorded but not
//! redelivered. A message still waiting for a handler slot at shutdown is
//! recorded as nacked without being handled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tracing::{debug, info};

use super::{Disposition, Dispatcher, Message, MessageHandler, Subscription, shutdown_requested};
use crate::error::BrokerError;

/// Recorded outcome of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub message_id: String,
    pub data: Vec<u8>,
    pub disposition: Disposition,
}

#[derive(Default)]
struct SettlementLog {
    entries: Mutex<Vec<Settlement>>,
    changed: Notify,
}

impl SettlementLog {
    fn record(&self, message: Message, disposition: Disposition) {
        debug!(message_id = %message.id, disposition = ?disposition, "Message settled");
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Settlement {
                message_id: message.id,
                data: message.data,
                disposition,
            });
        self.changed.notify_waiters();
    }

    fn snapshot(&self) -> Vec<Settlement> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct MemorySubscription {
    name: String,
    max_outstanding: usize,
    exists: AtomicBool,
    next_id: AtomicU64,
    sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    settlements: Arc<SettlementLog>,
}

impl MemorySubscription {
    pub fn new(name: impl Into<String>, max_outstanding: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            max_outstanding,
            exists: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            sender: Mutex::new(Some(sender)),
            receiver: AsyncMutex::new(receiver),
            settlements: Arc::new(SettlementLog::default()),
        }
    }

    /// Make [`Subscription::exists`] report `exists`.
    pub fn set_exists(&self, exists: bool) {
        self.exists.store(exists, Ordering::SeqCst);
    }

    /// Queue a message and return its id.
    pub fn publish(&self, data: impl Into<Vec<u8>>) -> Result<String, BrokerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = sender
            .as_ref()
            .ok_or_else(|| BrokerError::Closed(self.name.clone()))?;
        sender
            .send(Message {
                id: id.clone(),
                data: data.into(),
            })
            .map_err(|_| BrokerError::Closed(self.name.clone()))?;
        Ok(id)
    }

    /// Stop accepting messages. A running receive loop delivers what is
    /// already queued and then fails with [`BrokerError::Closed`].
    pub fn disconnect(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements.snapshot()
    }

    /// Wait until at least `count` messages have been settled.
    pub async fn wait_for_settlements(&self, count: usize) -> Vec<Settlement> {
        loop {
            let changed = self.settlements.changed.notified();
            let settled = self.settlements.snapshot();
            if settled.len() >= count {
                return settled;
            }
            changed.await;
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self) -> Result<bool, BrokerError> {
        Ok(self.exists.load(Ordering::SeqCst))
    }

    async fn receive(
        &self,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let mut receiver = self.receiver.lock().await;
        let mut dispatcher = Dispatcher::new(self.max_outstanding);
        info!(subscription = %self.name, "Receiving messages");

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
                next = receiver.recv() => next,
            };
            let Some(message) = next else {
                break Err(BrokerError::Closed(self.name.clone()));
            };

            let settlements = self.settlements.clone();
            let undispatched = dispatcher
                .dispatch(
                    handler.clone(),
                    message,
                    &mut shutdown,
                    move |message, disposition| async move {
                        settlements.record(message, disposition);
                    },
                )
                .await;
            if let Some(message) = undispatched {
                self.settlements.record(message, Disposition::Nack);
            }
        };

        debug!(
            subscription = %self.name,
            in_flight = dispatcher.in_flight(),
            "Waiting for in-flight messages"
        );
        dispatcher.drain().await;
        result
    }
}
