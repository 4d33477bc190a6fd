//! # Message Dispatcher
//!
//! Routes a raw payload with a declared message type to the registered
//! handler and normalizes every failure into a [`HandlingResult`]. Callers
//! (subscribers) never have to distinguish "dispatch failed" from "handler
//! returned failure" when deciding acknowledgment:
//!
//! - unknown message type → `FailedNoRetry` (retrying cannot change routing)
//! - malformed payload → `FailedNoRetry` (retrying cannot make it valid)
//! - handler panic → `FailedNoRetry` (poison message; retry storms helped
//!   no one)
//! - handler result → propagated verbatim

use std::any::TypeId;
use std::collections::HashMap;

use crate::handling::HandlingResult;
use crate::registry::{HandlerRegistry, InvokeFn};
use crate::serialization::BrokerMessage;

struct DispatchEntry {
    type_name: &'static str,
    invoke: InvokeFn,
}

/// Type-keyed dispatch over an immutable handler registry.
///
/// The `TypeId` index is built exactly once at construction; dispatch never
/// re-scans the registry.
pub struct MessageDispatcher {
    index: HashMap<TypeId, DispatchEntry>,
}

impl MessageDispatcher {
    /// Build a dispatcher from a validated registry.
    ///
    /// Takes the registry by ownership: nothing can mutate it afterward.
    pub fn new(registry: HandlerRegistry) -> Self {
        let index = registry
            .into_entries()
            .into_iter()
            .map(|entry| {
                (
                    entry.message_type,
                    DispatchEntry {
                        type_name: entry.record.message_type_name(),
                        invoke: entry.invoke,
                    },
                )
            })
            .collect();
        Self { index }
    }

    /// Dispatch a raw payload declared to be of `message_type`.
    ///
    /// Never panics and never returns a raw fault; every outcome is a
    /// [`HandlingResult`].
    pub async fn dispatch(&self, body: Vec<u8>, message_type: TypeId) -> HandlingResult {
        let Some(entry) = self.index.get(&message_type) else {
            tracing::warn!(?message_type, "no handler registered for message type");
            return HandlingResult::failed_no_retry_with(format!(
                "no handler registered for message type {message_type:?}"
            ));
        };

        tracing::debug!(message_type = entry.type_name, "dispatching message");
        (entry.invoke)(body).await
    }

    /// Typed convenience over [`MessageDispatcher::dispatch`]
    pub async fn dispatch_message<M: BrokerMessage>(&self, body: Vec<u8>) -> HandlingResult {
        self.dispatch(body, TypeId::of::<M>()).await
    }

    /// Number of message types this dispatcher can route
    pub fn registered_types(&self) -> usize {
        self.index.len()
    }
}
