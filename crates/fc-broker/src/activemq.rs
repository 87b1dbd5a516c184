//! ActiveMQ adapter over AMQP.
//!
//! Prefetch stands in for a visibility window: deliveries stay unacked on
//! the channel until we ack or nack them. AMQP has no timed redelivery, so
//! NACK requeues immediately and the delay hint is ignored.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, BasicRejectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use fc_core::{MessagePointer, ReceivedPointer};

use crate::{BrokerError, QueueAdapter, Result};

pub struct AmqpAdapter {
    uri: String,
    queue_name: String,
    consumer_tag: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    consumer: RwLock<Option<Consumer>>,
    running: AtomicBool,
    handle_counter: AtomicU64,
    delivery_tags: dashmap::DashMap<String, u64>,
}

impl AmqpAdapter {
    const PREFETCH: u16 = 16;

    pub async fn connect(uri: &str, queue_name: &str) -> Result<Self> {
        let adapter = Self {
            uri: uri.to_string(),
            queue_name: queue_name.to_string(),
            consumer_tag: format!("fc-router-{}", uuid::Uuid::new_v4()),
            connection: RwLock::new(None),
            channel: RwLock::new(None),
            consumer: RwLock::new(None),
            running: AtomicBool::new(false),
            handle_counter: AtomicU64::new(0),
            delivery_tags: dashmap::DashMap::new(),
        };
        adapter.establish().await?;
        Ok(adapter)
    }

    async fn establish(&self) -> Result<()> {
        info!(uri = %self.uri, queue = %self.queue_name, "connecting to AMQP broker");

        let connection = Connection::connect(
            &self.uri,
            ConnectionProperties::default().with_connection_name("fc-router".into()),
        )
        .await
        .map_err(|e| BrokerError::Transient(format!("AMQP connect failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Transient(format!("AMQP channel failed: {e}")))?;

        channel
            .basic_qos(Self::PREFETCH, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Transient(format!("AMQP qos failed: {e}")))?;

        channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Transient(format!("AMQP declare failed: {e}")))?;

        let consumer = channel
            .basic_consume(
                &self.queue_name,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Transient(format!("AMQP consume failed: {e}")))?;

        *self.connection.write().await = Some(connection);
        *self.channel.write().await = Some(channel);
        *self.consumer.write().await = Some(consumer);
        self.running.store(true, Ordering::SeqCst);

        info!(queue = %self.queue_name, "connected to AMQP broker");
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        warn!(queue = %self.queue_name, "reconnecting to AMQP broker");
        *self.consumer.write().await = None;
        *self.channel.write().await = None;
        *self.connection.write().await = None;
        self.establish().await
    }

    fn track_handle(&self, delivery_tag: u64) -> String {
        let handle = format!(
            "{}:{}:{}",
            self.queue_name,
            delivery_tag,
            self.handle_counter.fetch_add(1, Ordering::SeqCst)
        );
        self.delivery_tags.insert(handle.clone(), delivery_tag);
        handle
    }
}

#[async_trait]
impl QueueAdapter for AmqpAdapter {
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

        let consumer_guard = self.consumer.read().await;
        let Some(consumer) = consumer_guard.as_ref() else {
            drop(consumer_guard);
            self.reconnect().await?;
            return Ok(vec![]);
        };

        let mut stream = consumer.clone();
        let mut received = Vec::with_capacity(max_messages as usize);
        let per_message_wait = wait.max(Duration::from_millis(100)) / max_messages.max(1);

        for _ in 0..max_messages {
            match tokio::time::timeout(per_message_wait, stream.next()).await {
                Ok(Some(Ok(delivery))) => {
                    match serde_json::from_slice::<MessagePointer>(&delivery.data) {
                        Ok(pointer) => {
                            let receipt_handle = self.track_handle(delivery.delivery_tag);
                            let broker_message_id = delivery
                                .properties
                                .message_id()
                                .as_ref()
                                .map(|s| s.to_string());
                            let receive_count = if delivery.redelivered { 2 } else { 1 };

                            received.push(ReceivedPointer {
                                pointer,
                                receipt_handle,
                                broker_message_id,
                                queue_id: self.queue_name.clone(),
                                receive_count,
                            });
                        }
                        Err(e) => {
                            error!(queue = %self.queue_name, error = %e, "unparseable AMQP message, rejecting");
                            if let Some(channel) = self.channel.read().await.as_ref() {
                                let _ = channel
                                    .basic_reject(
                                        delivery.delivery_tag,
                                        BasicRejectOptions { requeue: false },
                                    )
                                    .await;
                            }
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    return Err(BrokerError::Transient(format!("AMQP receive failed: {e}")));
                }
                Ok(None) => {
                    warn!(queue = %self.queue_name, "AMQP consumer stream ended");
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(received)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let Some(delivery_tag) = self.delivery_tags.get(receipt_handle).map(|r| *r.value())
        else {
            debug!(queue = %self.queue_name, "ack for unknown handle ignored");
            return Ok(());
        };

        let channel_guard = self.channel.read().await;
        let channel = channel_guard
            .as_ref()
            .ok_or_else(|| BrokerError::Transient("not connected".to_string()))?;

        channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Transient(format!("ack failed: {e}")))?;

        self.delivery_tags.remove(receipt_handle);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, _delay_seconds: u32) -> Result<()> {
        let Some(delivery_tag) = self.delivery_tags.get(receipt_handle).map(|r| *r.value())
        else {
            debug!(queue = %self.queue_name, "nack for unknown handle ignored");
            return Ok(());
        };

        let channel_guard = self.channel.read().await;
        let channel = channel_guard
            .as_ref()
            .ok_or_else(|| BrokerError::Transient("not connected".to_string()))?;

        channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Transient(format!("nack failed: {e}")))?;

        self.delivery_tags.remove(receipt_handle);
        Ok(())
    }

    async fn extend_visibility(&self, _receipt_handle: &str, _seconds: u32) -> Result<()> {
        // Deliveries are held by the channel until acked; nothing to extend.
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(channel) = self.channel.read().await.as_ref() {
            let _ = channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await;
        }
        if let Some(channel) = self.channel.write().await.take() {
            let _ = channel.close(200, "shutdown").await;
        }
        if let Some(connection) = self.connection.write().await.take() {
            let _ = connection.close(200, "shutdown").await;
        }

        info!(queue = %self.queue_name, "AMQP consumer stopped");
    }
}
