use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::broker::{Disposition, Message, MessageHandler};
use crate::scanning;
use crate::storage::ScanStore;

/// Decodes scan messages and writes them to the store.
///
/// Anything that cannot be decoded or stored is nacked so the broker can
/// redeliver or dead-letter it. Retries are left to the broker.
pub struct ScanHandler {
    store: Arc<dyn ScanStore>,
}

impl ScanHandler {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for ScanHandler {
    async fn handle(&self, message: &Message) -> Disposition {
        let entry = match scanning::decode(&message.data) {
            Ok(entry) => entry,
            Err(e) => {
                error!(
                    message_id = %message.id,
                    error = %e,
                    body = %String::from_utf8_lossy(&message.data),
                    "Failed to decode scan message"
                );
                return Disposition::Nack;
            }
        };

        if let Err(e) = self.store.upsert(&entry).await {
            error!(
                message_id = %message.id,
                backend = self.store.name(),
                error = %e,
                entry = ?entry,
                "Failed to store scan entry"
            );
            return Disposition::Nack;
        }

        debug!(
            message_id = %message.id,
            ip = %entry.ip,
            port = entry.port,
            service = %entry.service,
            timestamp = entry.scan_timestamp,
            "Scan entry processed"
        );
        Disposition::Ack
    }
}
