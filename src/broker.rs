//! Message broker abstraction
//!
//! A [`Subscription`] delivers [`Message`]s to a [`MessageHandler`] and
//! settles each one (ack or nack) with the [`Disposition`] the handler
//! returns. Deliveries run as independent tasks, bounded by the
//! subscription's outstanding-message limit.

pub mod memory;
pub mod pubsub;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::error;

use crate::error::BrokerError;

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned message id
    pub id: String,
    pub data: Vec<u8>,
}

/// Outcome reported back to the broker for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; the broker must not redeliver it
    Ack,
    /// Not processed; the broker redelivers or dead-letters it
    Nack,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Disposition;
}

#[async_trait]
pub trait Subscription: Send + Sync {
    /// Fully qualified subscription name
    fn name(&self) -> &str;

    async fn exists(&self) -> Result<bool, BrokerError>;

    /// Deliver messages to `handler` until `shutdown` turns true.
    ///
    /// Returns once every dispatched handler has finished and its message
    /// has been settled. An error means delivery stopped for a reason other
    /// than shutdown.
    async fn receive(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError>;
}

/// Spawns one task per message, limited to `max_outstanding` at a time.
pub(crate) struct Dispatcher {
    tasks: JoinSet<()>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub(crate) fn new(max_outstanding: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(max_outstanding.max(1))),
        }
    }

    /// Wait for a free slot, then handle `message` on its own task and pass
    /// the outcome to `settle`.
    ///
    /// If `shutdown` fires before a slot frees up, the message is handed back
    /// undispatched and `settle` is never called.
    pub(crate) async fn dispatch<F, Fut>(
        &mut self,
        handler: Arc<dyn MessageHandler>,
        message: Message,
        shutdown: &mut watch::Receiver<bool>,
        settle: F,
    ) -> Option<Message>
    where
        F: FnOnce(Message, Disposition) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        let acquired = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => return Some(message),
            acquired = self.permits.clone().acquire_owned() => acquired,
        };
        let Ok(permit) = acquired else {
            return Some(message);
        };
        self.tasks.spawn(async move {
            let disposition = handler.handle(&message).await;
            settle(message, disposition).await;
            drop(permit);
        });
        None
    }

    /// Number of handlers still running.
    pub(crate) fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every dispatched handler to finish.
    pub(crate) async fn drain(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            log_join_error(result);
        }
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            log_join_error(result);
        }
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Message handler task failed");
    }
}

/// Resolves once `shutdown` is true or its sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // An Err means the sender was dropped, which also ends delivery
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct SlowHandler {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, message: &Message) -> Disposition {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if message.data.is_empty() {
                Disposition::Nack
            } else {
                Disposition::Ack
            }
        }
    }

    #[tokio::test]
    async fn test_dispatcher_bounds_concurrency_and_settles_all() {
        let handler = Arc::new(SlowHandler {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let settled = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(2);
        let (_shutdown_tx, mut shutdown) = watch::channel(false);

        for i in 0..6 {
            let settled = settled.clone();
            let data = if i % 2 == 0 { vec![1] } else { vec![] };
            let undispatched = dispatcher
                .dispatch(
                    handler.clone(),
                    Message {
                        id: i.to_string(),
                        data,
                    },
                    &mut shutdown,
                    move |message, disposition| async move {
                        settled.lock().await.push((message.id, disposition));
                    },
                )
                .await;
            assert!(undispatched.is_none());
        }
        dispatcher.drain().await;

        let settled = settled.lock().await;
        assert_eq!(settled.len(), 6);
        assert_eq!(
            settled
                .iter()
                .filter(|(_, d)| *d == Disposition::Nack)
                .count(),
            3
        );
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_dispatch_waiting_for_slot_returns_message_on_shutdown() {
        let handler = Arc::new(SlowHandler {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let settled = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(1);
        let (shutdown_tx, mut shutdown) = watch::channel(false);

        let record = |settled: Arc<Mutex<Vec<String>>>| {
            move |message: Message, _: Disposition| async move {
                settled.lock().await.push(message.id);
            }
        };

        let first = Message {
            id: "first".to_string(),
            data: vec![1],
        };
        assert!(
            dispatcher
                .dispatch(handler.clone(), first, &mut shutdown, record(settled.clone()))
                .await
                .is_none()
        );

        // The only slot is busy for 20ms; shutdown fires while the second waits
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            shutdown_tx.send_replace(true);
        });
        let second = Message {
            id: "second".to_string(),
            data: vec![2],
        };
        let returned = dispatcher
            .dispatch(handler.clone(), second, &mut shutdown, record(settled.clone()))
            .await;
        assert_eq!(returned.map(|m| m.id), Some("second".to_string()));

        dispatcher.drain().await;
        assert_eq!(*settled.lock().await, vec!["first".to_string()]);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_refused() {
        let handler = Arc::new(SlowHandler {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut dispatcher = Dispatcher::new(4);
        let (_shutdown_tx, mut shutdown) = watch::channel(true);

        let returned = dispatcher
            .dispatch(
                handler.clone(),
                Message {
                    id: "late".to_string(),
                    data: vec![1],
                },
                &mut shutdown,
                |_, _| async {},
            )
            .await;
        assert!(returned.is_some());
        assert_eq!(dispatcher.in_flight(), 0);
        dispatcher.drain().await;
        assert_eq!(handler.peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_requested_on_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_requested(&mut rx).await;
    }
}
