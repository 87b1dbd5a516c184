//! NATS JetStream adapter.
//!
//! Each configured queue maps to a work-queue stream with a durable pull
//! consumer. Received messages are parked in a handle map until the router
//! decides; NACK uses `AckKind::Nak` with the requested delay and
//! visibility extension maps to `AckKind::Progress`.

use async_trait::async_trait;
use async_nats::jetstream::{
    self,
    consumer::{pull::Config as ConsumerConfig, AckPolicy},
    stream::{Config as StreamConfig, RetentionPolicy},
    AckKind,
};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

use fc_core::{MessagePointer, ReceivedPointer};

use crate::{BrokerError, QueueAdapter, QueuePublisher, Result};

fn stream_name_for(queue_name: &str) -> String {
    queue_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub struct JetStreamAdapter {
    context: jetstream::Context,
    consumer: jetstream::consumer::Consumer<ConsumerConfig>,
    queue_name: String,
    subject: String,
    running: AtomicBool,
    /// Messages awaiting a decision, keyed by receipt handle.
    pending: dashmap::DashMap<String, jetstream::Message>,
}

impl JetStreamAdapter {
    pub async fn bind(
        context: jetstream::Context,
        queue_name: &str,
        ack_wait: Duration,
    ) -> Result<Self> {
        let stream_name = stream_name_for(queue_name);
        let subject = queue_name.to_string();

        let stream = context
            .get_or_create_stream(StreamConfig {
                name: stream_name.clone(),
                subjects: vec![subject.clone()],
                retention: RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Transient(format!("jetstream stream failed: {e}")))?;

        let durable = format!("fc-router-{}", stream_name.to_lowercase());
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                ConsumerConfig {
                    durable_name: Some(durable.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Transient(format!("jetstream consumer failed: {e}")))?;

        info!(queue = %queue_name, stream = %stream_name, "bound JetStream consumer");

        Ok(Self {
            context,
            consumer,
            queue_name: queue_name.to_string(),
            subject,
            running: AtomicBool::new(true),
            pending: dashmap::DashMap::new(),
        })
    }
}

#[async_trait]
impl QueueAdapter for JetStreamAdapter {
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

        let mut batch = self
            .consumer
            .batch()
            .max_messages(max_messages as usize)
            .expires(wait.max(Duration::from_millis(100)))
            .messages()
            .await
            .map_err(|e| BrokerError::Transient(format!("jetstream fetch failed: {e}")))?;

        let mut received = Vec::with_capacity(max_messages as usize);

        while let Some(message) = batch.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    return Err(BrokerError::Transient(format!(
                        "jetstream batch error: {e}"
                    )))
                }
            };

            let receive_count = message
                .info()
                .map(|i| i.delivered.max(1) as u32)
                .unwrap_or(1);
            let broker_message_id = message
                .info()
                .ok()
                .map(|i| format!("{}:{}", self.queue_name, i.stream_sequence));

            match serde_json::from_slice::<MessagePointer>(&message.payload) {
                Ok(pointer) => {
                    let receipt_handle = uuid::Uuid::new_v4().to_string();
                    self.pending.insert(receipt_handle.clone(), message);
                    received.push(ReceivedPointer {
                        pointer,
                        receipt_handle,
                        broker_message_id,
                        queue_id: self.queue_name.clone(),
                        receive_count,
                    });
                }
                Err(e) => {
                    error!(queue = %self.queue_name, error = %e, "unparseable JetStream message, terminating it");
                    let _ = message.ack_with(AckKind::Term).await;
                }
            }
        }

        if !received.is_empty() {
            debug!(queue = %self.queue_name, count = received.len(), "fetched batch");
        }

        Ok(received)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let Some((_, message)) = self.pending.remove(receipt_handle) else {
            debug!(queue = %self.queue_name, "ack for unknown handle ignored");
            return Ok(());
        };

        message
            .ack()
            .await
            .map_err(|e| BrokerError::Transient(format!("ack failed: {e}")))?;
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: u32) -> Result<()> {
        let Some((_, message)) = self.pending.remove(receipt_handle) else {
            debug!(queue = %self.queue_name, "nack for unknown handle ignored");
            return Ok(());
        };

        let delay = if delay_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(delay_seconds as u64))
        };

        message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| BrokerError::Transient(format!("nack failed: {e}")))?;
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, _seconds: u32) -> Result<()> {
        let Some(message) = self.pending.get(receipt_handle) else {
            return Ok(());
        };

        message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| BrokerError::Transient(format!("progress failed: {e}")))?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // Unacked messages redeliver after ack_wait; nothing explicit to do.
        self.pending.clear();
        info!(queue = %self.queue_name, "JetStream consumer stopped");
    }
}

#[async_trait]
impl QueuePublisher for JetStreamAdapter {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, pointer: MessagePointer) -> Result<String> {
        let pointer_id = pointer.id.clone();
        let payload = serde_json::to_vec(&pointer)?;

        let mut headers = async_nats::HeaderMap::new();
        // Nats-Msg-Id drives JetStream dedup, mirroring SQS dedup ids.
        headers.insert("Nats-Msg-Id", pointer_id.as_str());

        self.context
            .publish_with_headers(self.subject.clone(), headers, payload.into())
            .await
            .map_err(|e| BrokerError::Transient(format!("publish failed: {e}")))?
            .await
            .map_err(|e| BrokerError::Transient(format!("publish ack failed: {e}")))?;

        Ok(pointer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names_are_sanitized() {
        assert_eq!(stream_name_for("orders.fifo"), "ORDERS_FIFO");
        assert_eq!(stream_name_for("fc-default"), "FC-DEFAULT");
    }
}
