//! # Handler Registry
//!
//! Maps message types to the handlers that process them. Handlers are
//! registered through a fluent builder; duplicate registration for the same
//! message type is a configuration error surfaced at build time. Once built,
//! the registry is immutable and requires no locking to read.
//!
//! Each registration compiles a typed invocation closure (deserialize,
//! resolve the handler from its provider, invoke, normalize panics into a
//! [`HandlingResult`]). The dispatcher indexes these closures by `TypeId`
//! once at construction, so the per-message path is a single map lookup with
//! no dynamic reflection.

use std::any::TypeId;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::errors::{BrokerError, BrokerResult};
use crate::handling::HandlingResult;
use crate::serialization::BrokerMessage;

/// Processes one message type.
///
/// Implementations must be infallible at the type level: every outcome,
/// including business-rule rejection and transient downstream failure, is
/// expressed through the returned [`HandlingResult`].
#[async_trait]
pub trait MessageHandler<M>: Send + Sync
where
    M: BrokerMessage,
{
    async fn handle(&self, message: M) -> HandlingResult;
}

/// Type-erased invocation closure: payload in, handling result out.
pub(crate) type InvokeFn =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, HandlingResult> + Send + Sync>;

/// What was registered for one message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRecord {
    message_type_name: &'static str,
    handler_type_name: &'static str,
    handler_interface_name: &'static str,
}

impl HandlerRecord {
    /// Fully-qualified name of the message type
    pub fn message_type_name(&self) -> &'static str {
        self.message_type_name
    }

    /// Fully-qualified name of the handler implementation
    pub fn handler_type_name(&self) -> &'static str {
        self.handler_type_name
    }

    /// Fully-qualified name of the handler capability interface
    pub fn handler_interface_name(&self) -> &'static str {
        self.handler_interface_name
    }
}

pub(crate) struct RegistryEntry {
    pub(crate) message_type: TypeId,
    pub(crate) record: HandlerRecord,
    pub(crate) invoke: InvokeFn,
}

/// Immutable set of handler registrations, in registration order
pub struct HandlerRegistry {
    entries: Vec<RegistryEntry>,
}

impl HandlerRegistry {
    /// Start building a registry
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder {
            entries: Vec::new(),
        }
    }

    /// The registered handler records, in registration order
    pub fn records(&self) -> impl Iterator<Item = &HandlerRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> Vec<RegistryEntry> {
        self.entries
    }
}

/// Fluent builder for [`HandlerRegistry`]
pub struct HandlerRegistryBuilder {
    entries: Vec<RegistryEntry>,
}

impl HandlerRegistryBuilder {
    /// Register a handler instance for message type `M`.
    ///
    /// The instance is shared across invocations. Use
    /// [`HandlerRegistryBuilder::register_with`] to resolve a fresh instance
    /// per dispatch instead.
    pub fn register<M, H>(self, handler: Arc<H>) -> Self
    where
        M: BrokerMessage,
        H: MessageHandler<M> + 'static,
    {
        self.register_with::<M, H, _>(move || Arc::clone(&handler))
    }

    /// Register a handler provider for message type `M`.
    ///
    /// The provider is invoked once per dispatched message, so handler
    /// lifetime belongs to the provider (a dependency scope, a pool), not to
    /// the dispatcher.
    pub fn register_with<M, H, P>(mut self, provider: P) -> Self
    where
        M: BrokerMessage,
        H: MessageHandler<M> + 'static,
        P: Fn() -> Arc<H> + Send + Sync + 'static,
    {
        let provider = Arc::new(provider);
        let message_type_name = std::any::type_name::<M>();

        let invoke: InvokeFn = Arc::new(move |body: Vec<u8>| {
            let provider = Arc::clone(&provider);
            async move {
                let message = match M::from_bytes(&body) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::debug!(
                            message_type = message_type_name,
                            error = %e,
                            "payload deserialization failed"
                        );
                        return HandlingResult::failed_no_retry_with(format!(
                            "payload deserialization failed: {e}"
                        ));
                    }
                };

                // Resolution runs inside the guard too: a panicking provider
                // must surface as a handling result, not unwind the caller.
                let invocation =
                    AssertUnwindSafe(async move { provider().handle(message).await });
                match invocation.catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!(
                            message_type = message_type_name,
                            "handler panicked while processing message"
                        );
                        HandlingResult::failed_no_retry_with(
                            "handler panicked while processing message",
                        )
                    }
                }
            }
            .boxed()
        });

        self.entries.push(RegistryEntry {
            message_type: TypeId::of::<M>(),
            record: HandlerRecord {
                message_type_name,
                handler_type_name: std::any::type_name::<H>(),
                handler_interface_name: std::any::type_name::<dyn MessageHandler<M>>(),
            },
            invoke,
        });
        self
    }

    /// Validate and freeze the registry.
    ///
    /// Fails if the same message type was registered more than once;
    /// silently overwriting a handler would hide a configuration mistake.
    pub fn build(self) -> BrokerResult<HandlerRegistry> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.message_type) {
                return Err(BrokerError::configuration(format!(
                    "duplicate handler registration for message type {}",
                    entry.record.message_type_name
                )));
            }
        }
        Ok(HandlerRegistry {
            entries: self.entries,
        })
    }
}
