//! # Broker Transport Boundary
//!
//! Object-safe traits over the broker's wire primitives: connect, open a
//! channel, passively check a destination, send, consume, acknowledge,
//! reject, close. The core consumes these traits and never creates topology
//! (exchanges/queues) itself; topology declaration is external setup.
//!
//! Two providers are included:
//!
//! - [`rabbitmq::RabbitMqTransport`] — AMQP 0.9.1 via the `lapin` crate
//! - [`in_memory::InMemoryTransport`] — in-process queues for testing and
//!   development
//!
//! A transport channel handle is treated as **not safe for concurrent use**:
//! each channel is exclusively owned by one publisher endpoint or one
//! subscriber entry, and publishers serialize access with a per-channel gate.

pub mod in_memory;
pub mod rabbitmq;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::ConnectionConfig;
use crate::errors::BrokerResult;

/// A message delivered to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Raw message payload
    pub body: Vec<u8>,

    /// Transport-assigned tag used to acknowledge or reject this delivery
    pub delivery_tag: u64,

    /// True when the broker has delivered this message before
    pub redelivered: bool,
}

/// A started consumer: its transport tag and the stream of deliveries.
///
/// The stream terminates when the consumer is cancelled or its channel is
/// closed.
pub struct ConsumerHandle {
    /// Transport-assigned consumer tag, used to cancel the consumer
    pub consumer_tag: String,

    /// The deliveries arriving on this consumer
    pub deliveries: BoxStream<'static, Delivery>,
}

/// Entry point of a transport implementation: opens connections.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Open a new connection to the broker
    async fn connect(&self, config: &ConnectionConfig) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

/// A live broker connection. Shared and read-only after creation; channels
/// are opened from it and owned by their callers.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel on this connection
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Close the connection
    async fn close(&self) -> BrokerResult<()>;
}

/// A broker channel: the unit of sending, consuming, and acknowledgment.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Passively verify that a destination exists, without creating it
    async fn check_destination(&self, destination: &str) -> BrokerResult<()>;

    /// Send a payload to a destination, waiting for broker confirmation
    /// where the transport supports it
    async fn send(&self, destination: &str, payload: &[u8]) -> BrokerResult<()>;

    /// Start consuming from a queue
    ///
    /// With `auto_ack` the transport settles each message on delivery and
    /// [`BrokerChannel::ack`]/[`BrokerChannel::reject`] must not be called
    /// for it.
    async fn consume(&self, queue_name: &str, auto_ack: bool) -> BrokerResult<ConsumerHandle>;

    /// Acknowledge a delivery (remove it from the queue)
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    /// Reject a delivery; with `requeue` it becomes available for
    /// redelivery, without it the broker dead-letters or drops it
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    /// Cancel a consumer; its delivery stream terminates
    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    /// Close the channel
    async fn close(&self) -> BrokerResult<()>;
}
