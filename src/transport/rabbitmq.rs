//! # RabbitMQ Transport
//!
//! AMQP 0.9.1 implementation of the transport boundary using the `lapin`
//! crate.
//!
//! Semantics:
//!
//! - `send` publishes to the named exchange with an empty routing key,
//!   `mandatory: true`, persistent delivery mode, and waits for the
//!   publisher confirm.
//! - `check_destination` is a passive exchange declare: it verifies the
//!   exchange exists and never creates it.
//! - `consume` passively declares the queue first, then attaches a
//!   server-named consumer.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};

use crate::config::ConnectionConfig;
use crate::errors::{BrokerError, BrokerResult};
use crate::transport::{BrokerChannel, BrokerConnection, BrokerTransport, ConsumerHandle, Delivery};

// AMQP reply-success code used when closing channels and connections.
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ implementation of [`BrokerTransport`]
#[derive(Debug, Default)]
pub struct RabbitMqTransport;

impl RabbitMqTransport {
    /// Create a new RabbitMQ transport
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerTransport for RabbitMqTransport {
    async fn connect(&self, config: &ConnectionConfig) -> BrokerResult<Arc<dyn BrokerConnection>> {
        config.validate()?;

        let connection = Connection::connect(
            &config.amqp_url(),
            ConnectionProperties::default().with_connection_name("message-broker".into()),
        )
        .await
        .map_err(|e| BrokerError::connection(format!("RabbitMQ connection failed: {e}")))?;

        Ok(Arc::new(RabbitMqConnection { connection }))
    }
}

/// A live RabbitMQ connection
pub struct RabbitMqConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::connection(format!("RabbitMQ channel creation failed: {e}")))?;
        Ok(Arc::new(RabbitMqChannel { channel }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.connection
            .close(REPLY_SUCCESS, "message-broker shutdown")
            .await
            .map_err(|e| BrokerError::connection(format!("RabbitMQ connection close failed: {e}")))
    }
}

/// A RabbitMQ channel
pub struct RabbitMqChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn check_destination(&self, destination: &str) -> BrokerResult<()> {
        // Passive declare: verifies existence without creating. The exchange
        // kind is ignored by the server when passive is set.
        self.channel
            .exchange_declare(
                destination,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                let error_str = e.to_string();
                if error_str.contains("NOT_FOUND") || error_str.contains("404") {
                    BrokerError::destination_not_found(destination)
                } else {
                    BrokerError::channel_operation(destination, "check", error_str)
                }
            })
    }

    async fn send(&self, destination: &str, payload: &[u8]) -> BrokerResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                destination,
                "", // Routing key left to the exchange's bindings
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| BrokerError::send(destination, format!("publish failed: {e}")))?;

        confirm
            .await
            .map_err(|e| BrokerError::send(destination, format!("publish confirmation failed: {e}")))?;

        Ok(())
    }

    async fn consume(&self, queue_name: &str, auto_ack: bool) -> BrokerResult<ConsumerHandle> {
        self.channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                let error_str = e.to_string();
                if error_str.contains("NOT_FOUND") || error_str.contains("404") {
                    BrokerError::destination_not_found(queue_name)
                } else {
                    BrokerError::channel_operation(queue_name, "check", error_str)
                }
            })?;

        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                "", // Server-generated consumer tag
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::consume(queue_name, format!("basic_consume failed: {e}")))?;

        let consumer_tag = consumer.tag().to_string();
        let queue = queue_name.to_string();
        let deliveries = consumer
            .filter_map(move |item| {
                let queue = queue.clone();
                async move {
                    match item {
                        Ok(delivery) => Some(Delivery {
                            body: delivery.data,
                            delivery_tag: delivery.delivery_tag,
                            redelivered: delivery.redelivered,
                        }),
                        Err(e) => {
                            tracing::error!(queue = %queue, error = %e, "consumer stream error");
                            None
                        }
                    }
                }
            })
            .boxed();

        Ok(ConsumerHandle {
            consumer_tag,
            deliveries,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::ack("", delivery_tag, format!("basic_ack failed: {e}")))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::reject("", delivery_tag, format!("basic_reject failed: {e}")))
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| {
                BrokerError::channel_operation("", "cancel", format!("basic_cancel failed: {e}"))
            })
    }

    async fn close(&self) -> BrokerResult<()> {
        self.channel
            .close(REPLY_SUCCESS, "message-broker shutdown")
            .await
            .map_err(|e| BrokerError::channel_operation("", "close", e.to_string()))
    }
}
