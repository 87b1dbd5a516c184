//! AWS SQS FIFO adapter.

use async_trait::async_trait;
use aws_sdk_sqs::types::{Message as SqsMessage, MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

use fc_core::{MessagePointer, ReceivedPointer};

use crate::{BrokerError, QueueAdapter, QueueDepth, QueuePublisher, Result};

/// Errors that will not go away with a retry; the supervisor stops the
/// consumer instead of backing off.
fn classify(error: String) -> BrokerError {
    let lowered = error.to_lowercase();
    if lowered.contains("credential")
        || lowered.contains("accessdenied")
        || lowered.contains("nonexistentqueue")
        || lowered.contains("invalidaddress")
    {
        BrokerError::Fatal(error)
    } else {
        BrokerError::Transient(error)
    }
}

pub struct SqsAdapter {
    client: Client,
    queue_url: String,
    queue_name: String,
    visibility_timeout_seconds: i32,
    running: AtomicBool,
    total_polled: AtomicU64,
}

impl SqsAdapter {
    pub fn new(
        client: Client,
        queue_url: String,
        queue_name: String,
        visibility_timeout_seconds: i32,
    ) -> Self {
        Self {
            client,
            queue_url,
            queue_name,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
            total_polled: AtomicU64::new(0),
        }
    }

    pub fn from_queue_url(
        client: Client,
        queue_url: String,
        visibility_timeout_seconds: i32,
    ) -> Self {
        let queue_name = queue_url
            .rsplit('/')
            .next()
            .unwrap_or("unknown")
            .to_string();
        Self::new(client, queue_url, queue_name, visibility_timeout_seconds)
    }

    fn parse(&self, msg: &SqsMessage) -> Result<ReceivedPointer> {
        let body = msg
            .body()
            .ok_or_else(|| BrokerError::Transient("empty message body".to_string()))?;
        let pointer: MessagePointer = serde_json::from_str(body)?;

        let receipt_handle = msg
            .receipt_handle()
            .ok_or_else(|| BrokerError::Transient("missing receipt handle".to_string()))?
            .to_string();

        let receive_count = msg
            .attributes()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);

        Ok(ReceivedPointer {
            pointer,
            receipt_handle,
            broker_message_id: msg.message_id().map(|s| s.to_string()),
            queue_id: self.queue_name.clone(),
            receive_count,
        })
    }
}

#[async_trait]
impl QueueAdapter for SqsAdapter {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn receive_batch(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedPointer>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Stopped);
        }

        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(10) as i32)
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds((wait.as_secs() as i32).clamp(0, 20))
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| classify(e.to_string()))?;

        let sqs_messages = result.messages.unwrap_or_default();
        let mut received = Vec::with_capacity(sqs_messages.len());

        for msg in sqs_messages {
            match self.parse(&msg) {
                Ok(r) => received.push(r),
                Err(e) => {
                    error!(queue = %self.queue_name, error = %e, "unparseable message, acking as poison");
                    if let Some(handle) = msg.receipt_handle() {
                        let _ = self.ack(handle).await;
                    }
                }
            }
        }

        if !received.is_empty() {
            self.total_polled
                .fetch_add(received.len() as u64, Ordering::Relaxed);
            debug!(queue = %self.queue_name, count = received.len(), "received batch");
        }

        Ok(received)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        if let Err(e) = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
        {
            // Ack is idempotent: an expired handle means the broker already
            // redelivered or dropped the claim, nothing left to do here.
            debug!(
                queue = %self.queue_name,
                error = %e,
                "delete failed, treating ack as idempotent no-op"
            );
        }
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(delay_seconds as i32)
            .send()
            .await
            .map_err(|e| classify(e.to_string()))?;

        debug!(
            queue = %self.queue_name,
            delay_seconds,
            "message returned via visibility timeout"
        );
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| classify(e.to_string()))?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "sqs consumer stopped");
    }

    async fn depth(&self) -> Result<Option<QueueDepth>> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| classify(e.to_string()))?;

        let attributes = result.attributes();
        let pending = attributes
            .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let in_flight = attributes
            .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Some(QueueDepth {
            queue_id: self.queue_name.clone(),
            pending,
            in_flight,
        }))
    }
}

/// Publisher counterpart, used for dev seeding against SQS queues.
pub struct SqsProducer {
    client: Client,
    queue_url: String,
}

impl SqsProducer {
    pub fn new(client: Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }
}

#[async_trait]
impl QueuePublisher for SqsProducer {
    fn identifier(&self) -> &str {
        &self.queue_url
    }

    async fn publish(&self, pointer: MessagePointer) -> Result<String> {
        let pointer_id = pointer.id.clone();
        let body = serde_json::to_string(&pointer)?;

        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body);

        // FIFO queues require a group id; the dedup id is the pointer id so
        // broker-side dedup matches the router's in-flight dedup key.
        if self.queue_url.ends_with(".fifo") {
            let group = pointer
                .message_group_id
                .clone()
                .unwrap_or_else(|| "default".to_string());
            request = request
                .message_group_id(group)
                .message_deduplication_id(&pointer_id);
        }

        request
            .send()
            .await
            .map_err(|e| classify(e.to_string()))?;

        Ok(pointer_id)
    }
}
