//! # message-broker
//!
//! Broker-agnostic typed messaging: register a handler per message type,
//! publish typed messages to configured destinations, and let the handling
//! result drive acknowledgment.
//!
//! ## Architecture
//!
//! - [`registry`] / [`dispatch`] — type-keyed routing from raw payloads to
//!   registered handlers, with every failure normalized into a
//!   [`HandlingResult`]
//! - [`publish`] — one dedicated, gated channel per message type; same-type
//!   publishes serialize, different types run in parallel
//! - [`subscribe`] — one consumer per queue, settling each delivery from its
//!   handling result (ack / dead-letter / requeue)
//! - [`connection`] — lazy shared connection with a single connect attempt
//!   under concurrent first use
//! - [`transport`] — object-safe boundary with RabbitMQ (`lapin`) and
//!   in-memory providers
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use message_broker::{
//!     ConnectionConfig, ConnectionManager, EndpointSet, HandlerRegistry, HandlingResult,
//!     MessageDispatcher, MessageHandler, MessagePublisher, MessageSubscriber, SubscriptionSet,
//! };
//! use message_broker::transport::rabbitmq::RabbitMqTransport;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct ProbeLaunched {
//!     probe: String,
//! }
//!
//! struct ProbeHandler;
//!
//! #[async_trait]
//! impl MessageHandler<ProbeLaunched> for ProbeHandler {
//!     async fn handle(&self, message: ProbeLaunched) -> HandlingResult {
//!         println!("probe launched: {}", message.probe);
//!         HandlingResult::succeeded()
//!     }
//! }
//!
//! # async fn run() -> Result<(), message_broker::BrokerError> {
//! let manager = ConnectionManager::new(
//!     Arc::new(RabbitMqTransport::new()),
//!     ConnectionConfig::from_env(),
//! );
//!
//! let registry = HandlerRegistry::builder()
//!     .register::<ProbeLaunched, _>(Arc::new(ProbeHandler))
//!     .build()?;
//! let dispatcher = Arc::new(MessageDispatcher::new(registry));
//!
//! let subscriber = MessageSubscriber::new(
//!     dispatcher,
//!     SubscriptionSet::builder()
//!         .subscription::<ProbeLaunched>("probes")
//!         .build()?,
//! );
//! subscriber.start(&manager).await?;
//!
//! let publisher = MessagePublisher::new(
//!     manager.get_connection().await?,
//!     EndpointSet::builder().endpoint::<ProbeLaunched>("probes").build()?,
//! )
//! .await?;
//! publisher
//!     .publish(&ProbeLaunched {
//!         probe: "voyager".to_string(),
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod errors;
pub mod handling;
pub mod publish;
pub mod registry;
pub mod serialization;
pub mod subscribe;
pub mod transport;

pub use config::ConnectionConfig;
pub use connection::ConnectionManager;
pub use dispatch::MessageDispatcher;
pub use errors::{BrokerError, BrokerResult};
pub use handling::HandlingResult;
pub use publish::{EndpointSet, EndpointSetBuilder, MessageEndpoint, MessagePublisher};
pub use registry::{HandlerRecord, HandlerRegistry, HandlerRegistryBuilder, MessageHandler};
pub use serialization::BrokerMessage;
pub use subscribe::{MessageSubscriber, Subscription, SubscriptionSet, SubscriptionSetBuilder};
pub use transport::{BrokerChannel, BrokerConnection, BrokerTransport, ConsumerHandle, Delivery};
