//! Google Cloud Pub/Sub client over the REST API
//!
//! Uses synchronous pull. Nacks are sent as a zero-second ack deadline
//! modification so the message is redelivered right away. Works against
//! the Pub/Sub emulator when `PUBSUB_EMULATOR_HOST` is set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Disposition, Dispatcher, Message, MessageHandler, Subscription, shutdown_requested};
use crate::config::PubsubConfig;
use crate::error::BrokerError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PubsubClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    access_token: Option<String>,
}

impl PubsubClient {
    pub fn new(config: &PubsubConfig) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(BrokerError::Client)?;

        let base_url = config.base_url();
        debug!(
            base_url = %base_url,
            project = %config.project_id(),
            emulator = config.emulator_host.is_some(),
            "Pub/Sub client created"
        );

        Ok(Self {
            http,
            base_url,
            project_id: config.project_id().to_string(),
            access_token: config.access_token.clone().filter(|t| !t.is_empty()),
        })
    }

    pub fn topic(&self, topic_id: &str) -> Topic {
        Topic {
            path: format!("projects/{}/topics/{}", self.project_id, topic_id),
        }
    }

    pub fn subscription(
        &self,
        subscription_id: &str,
        max_messages: u32,
        max_outstanding: usize,
    ) -> PubsubSubscription {
        PubsubSubscription {
            client: self.clone(),
            path: format!(
                "projects/{}/subscriptions/{}",
                self.project_id, subscription_id
            ),
            max_messages,
            max_outstanding,
        }
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/v1/{}", self.base_url, resource)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post<B: Serialize>(&self, url: &str, body: &B) -> Result<reqwest::Response, BrokerError> {
        let response = self
            .request(Method::POST, url)
            .json(body)
            .send()
            .await
            .map_err(|source| BrokerError::Request {
                url: url.to_string(),
                source,
            })?;
        check_status(url, response).await
    }
}

async fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response, BrokerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read response body".to_string());
    Err(BrokerError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    path: String,
}

impl Topic {
    /// Fully qualified topic name
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Subscription metadata returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionInfo {
    pub name: String,
    #[serde(default)]
    pub topic: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: &'a [String],
    ack_deadline_seconds: u32,
}

impl ReceivedMessage {
    fn decode(&self) -> Result<Message, BrokerError> {
        let data = STANDARD
            .decode(self.message.data.as_bytes())
            .map_err(|e| BrokerError::InvalidMessage {
                id: self.message.message_id.clone(),
                reason: e.to_string(),
            })?;
        Ok(Message {
            id: self.message.message_id.clone(),
            data,
        })
    }
}

#[derive(Clone)]
pub struct PubsubSubscription {
    client: PubsubClient,
    path: String,
    max_messages: u32,
    max_outstanding: usize,
}

impl PubsubSubscription {
    /// Fetch subscription metadata; `None` when it does not exist.
    pub async fn info(&self) -> Result<Option<SubscriptionInfo>, BrokerError> {
        let url = self.client.url(&self.path);
        let response = self
            .client
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(|source| BrokerError::Request {
                url: url.clone(),
                source,
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = check_status(&url, response).await?;
        response
            .json::<SubscriptionInfo>()
            .await
            .map(Some)
            .map_err(|source| BrokerError::Request { url, source })
    }

    async fn pull(&self) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let url = self.client.url(&format!("{}:pull", self.path));
        let request = PullRequest {
            max_messages: self.max_messages,
        };
        let response = match self.client.post(&url, &request).await {
            Ok(response) => response,
            // Long polls that return nothing before the client timeout are not failures
            Err(BrokerError::Request { source, .. }) if source.is_timeout() => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let body: PullResponse = response
            .json()
            .await
            .map_err(|source| BrokerError::Request { url, source })?;
        Ok(body.received_messages)
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), BrokerError> {
        let url = self.client.url(&format!("{}:acknowledge", self.path));
        self.client
            .post(&url, &AcknowledgeRequest { ack_ids })
            .await
            .map(|_| ())
    }

    async fn modify_ack_deadline(&self, ack_ids: &[String], seconds: u32) -> Result<(), BrokerError> {
        let url = self.client.url(&format!("{}:modifyAckDeadline", self.path));
        self.client
            .post(
                &url,
                &ModifyAckDeadlineRequest {
                    ack_ids,
                    ack_deadline_seconds: seconds,
                },
            )
            .await
            .map(|_| ())
    }

    async fn settle(&self, message_id: &str, ack_id: String, disposition: Disposition) {
        let ack_ids = [ack_id];
        let result = match disposition {
            Disposition::Ack => self.acknowledge(&ack_ids).await,
            Disposition::Nack => self.modify_ack_deadline(&ack_ids, 0).await,
        };
        match result {
            Ok(()) => debug!(
                message_id = %message_id,
                disposition = ?disposition,
                "Message settled"
            ),
            Err(e) => warn!(
                message_id = %message_id,
                disposition = ?disposition,
                error = %e,
                "Failed to settle message, it will be redelivered after the ack deadline"
            ),
        }
    }
}

#[async_trait]
impl Subscription for PubsubSubscription {
    fn name(&self) -> &str {
        &self.path
    }

    async fn exists(&self) -> Result<bool, BrokerError> {
        Ok(self.info().await?.is_some())
    }

    async fn receive(
        &self,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let mut dispatcher = Dispatcher::new(self.max_outstanding);
        info!(
            subscription = %self.path,
            max_messages = self.max_messages,
            max_outstanding = self.max_outstanding,
            "Receiving messages"
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let pulled = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
                pulled = self.pull() => pulled,
            };
            let batch = match pulled {
                Ok(batch) => batch,
                Err(e) => break Err(e),
            };
            if !batch.is_empty() {
                debug!(subscription = %self.path, count = batch.len(), "Pulled messages");
            }

            for received in batch {
                if *shutdown.borrow() {
                    // Hand undispatched messages back for immediate redelivery
                    let id = received.message.message_id.clone();
                    self.settle(&id, received.ack_id, Disposition::Nack).await;
                    continue;
                }

                match received.decode() {
                    Ok(message) => {
                        let subscription = self.clone();
                        let ack_id = received.ack_id.clone();
                        let undispatched = dispatcher
                            .dispatch(
                                handler.clone(),
                                message,
                                &mut shutdown,
                                move |message, disposition| async move {
                                    subscription.settle(&message.id, ack_id, disposition).await;
                                },
                            )
                            .await;
                        if let Some(message) = undispatched {
                            self.settle(&message.id, received.ack_id, Disposition::Nack)
                                .await;
                        }
                    }
                    Err(e) => {
                        error!(
                            subscription = %self.path,
                            error = %e,
                            "Rejecting undecodable Pub/Sub message"
                        );
                        let id = received.message.message_id.clone();
                        self.settle(&id, received.ack_id, Disposition::Nack).await;
                    }
                }
            }
        };

        info!(
            subscription = %self.path,
            in_flight = dispatcher.in_flight(),
            "Receive loop stopped, waiting for in-flight messages"
        );
        dispatcher.drain().await;
        result
    }
}
