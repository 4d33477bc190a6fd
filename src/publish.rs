//! # Message Publisher
//!
//! Owns one dedicated transport channel per configured message type, each
//! guarded by a capacity-1 gate. Transport channel handles are not safe for
//! concurrent use, so publishes to the same message type serialize on that
//! type's gate; channels for different message types remain independently
//! usable in parallel — there is no global publish lock.
//!
//! Channels are opened eagerly at construction and each destination is
//! passively checked; a missing destination fails construction. If a channel
//! later fails irrecoverably the publisher does not recreate it: publishes
//! for that destination keep failing until the process is restarted and
//! topology is fixed.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::errors::{BrokerError, BrokerResult};
use crate::serialization::BrokerMessage;
use crate::transport::{BrokerChannel, BrokerConnection};

/// Binding of a message type to the destination it publishes to
#[derive(Debug, Clone)]
pub struct MessageEndpoint {
    message_type: TypeId,
    type_name: &'static str,
    destination: String,
}

impl MessageEndpoint {
    /// Fully-qualified name of the message type
    pub fn message_type_name(&self) -> &'static str {
        self.type_name
    }

    /// The destination this type publishes to
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

/// Validated set of publish endpoints
pub struct EndpointSet {
    endpoints: Vec<MessageEndpoint>,
}

impl EndpointSet {
    /// Start building an endpoint set
    pub fn builder() -> EndpointSetBuilder {
        EndpointSetBuilder {
            endpoints: Vec::new(),
        }
    }

    /// The configured endpoints, in registration order
    pub fn endpoints(&self) -> &[MessageEndpoint] {
        &self.endpoints
    }
}

/// Fluent builder for [`EndpointSet`]
pub struct EndpointSetBuilder {
    endpoints: Vec<MessageEndpoint>,
}

impl EndpointSetBuilder {
    /// Bind message type `M` to a destination
    pub fn endpoint<M: BrokerMessage>(mut self, destination: impl Into<String>) -> Self {
        self.endpoints.push(MessageEndpoint {
            message_type: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            destination: destination.into(),
        });
        self
    }

    /// Validate and freeze the endpoint set.
    ///
    /// Fails on an empty set, a blank destination name, or two endpoints for
    /// the same message type.
    pub fn build(self) -> BrokerResult<EndpointSet> {
        if self.endpoints.is_empty() {
            return Err(BrokerError::configuration(
                "at least one message endpoint must be configured",
            ));
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.destination.trim().is_empty() {
                return Err(BrokerError::configuration(format!(
                    "destination must not be blank for message type {}",
                    endpoint.type_name
                )));
            }
            if !seen.insert(endpoint.message_type) {
                return Err(BrokerError::configuration(format!(
                    "duplicate endpoint for message type {}",
                    endpoint.type_name
                )));
            }
        }

        Ok(EndpointSet {
            endpoints: self.endpoints,
        })
    }
}

/// One publish entry: the exclusively-owned channel and its gate
struct DestinationChannel {
    channel: Arc<dyn BrokerChannel>,
    destination: String,
    type_name: &'static str,
    gate: Mutex<()>,
}

/// Publishes typed messages to their configured destinations.
///
/// Exclusively owns its per-type channel table; the shared connection stays
/// with the [`crate::connection::ConnectionManager`].
pub struct MessagePublisher {
    senders: HashMap<TypeId, DestinationChannel>,
    closed: AtomicBool,
}

impl MessagePublisher {
    /// Open one dedicated channel per endpoint, passively verifying each
    /// destination exists. Fails fast on the first missing destination.
    pub async fn new(
        connection: Arc<dyn BrokerConnection>,
        endpoints: EndpointSet,
    ) -> BrokerResult<Self> {
        let mut senders = HashMap::new();

        for endpoint in endpoints.endpoints {
            let channel = connection.open_channel().await?;
            channel.check_destination(&endpoint.destination).await?;

            tracing::debug!(
                message_type = endpoint.type_name,
                destination = %endpoint.destination,
                "publish channel ready"
            );
            senders.insert(
                endpoint.message_type,
                DestinationChannel {
                    channel,
                    destination: endpoint.destination,
                    type_name: endpoint.type_name,
                    gate: Mutex::new(()),
                },
            );
        }

        Ok(Self {
            senders,
            closed: AtomicBool::new(false),
        })
    }

    /// Serialize and publish a message to its configured destination.
    ///
    /// Fails with `UnconfiguredMessageType` when no endpoint was registered
    /// for `M` — a caller programming error, not a transient condition.
    /// Dropping the returned future before completion releases the gate
    /// without sending.
    pub async fn publish<M: BrokerMessage>(&self, message: &M) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("publisher"));
        }

        let entry = self
            .senders
            .get(&TypeId::of::<M>())
            .ok_or_else(|| BrokerError::unconfigured_message_type(std::any::type_name::<M>()))?;

        let payload = message.to_bytes()?;
        self.send_on(entry, &payload).await
    }

    /// Publish a pre-serialized payload declared to be of `message_type`
    pub async fn publish_bytes(&self, message_type: TypeId, payload: &[u8]) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("publisher"));
        }

        let entry = self
            .senders
            .get(&message_type)
            .ok_or_else(|| BrokerError::unconfigured_message_type(format!("{message_type:?}")))?;

        self.send_on(entry, payload).await
    }

    async fn send_on(&self, entry: &DestinationChannel, payload: &[u8]) -> BrokerResult<()> {
        // The gate guard is released on every exit path, including
        // cancellation of this future.
        let _gate = entry.gate.lock().await;
        entry.channel.send(&entry.destination, payload).await
    }

    /// Close every channel, idempotently. Subsequent publishes fail with a
    /// `Closed` error.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for entry in self.senders.values() {
            // Wait out any in-flight send on this channel before closing it.
            let _gate = entry.gate.lock().await;
            if let Err(e) = entry.channel.close().await {
                tracing::warn!(
                    message_type = entry.type_name,
                    destination = %entry.destination,
                    error = %e,
                    "error closing publish channel"
                );
            }
        }
        tracing::info!("message publisher closed");
    }
}
