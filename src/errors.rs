//! # Broker Error Types
//!
//! Structured error handling for the messaging layer using thiserror
//! instead of `Box<dyn Error>` patterns.

use thiserror::Error;

/// Errors surfaced by the messaging layer
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Channel operation failed: {destination}: {operation}: {message}")]
    ChannelOperation {
        destination: String,
        operation: String,
        message: String,
    },

    #[error("Destination not found: {destination}")]
    DestinationNotFound { destination: String },

    #[error("No endpoint configured for message type: {type_name}")]
    UnconfiguredMessageType { type_name: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Component is closed: {component}")]
    Closed { component: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl BrokerError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a channel operation error
    pub fn channel_operation(
        destination: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ChannelOperation {
            destination: destination.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a destination not found error
    pub fn destination_not_found(destination: impl Into<String>) -> Self {
        Self::DestinationNotFound {
            destination: destination.into(),
        }
    }

    /// Create an unconfigured message type error
    pub fn unconfigured_message_type(type_name: impl Into<String>) -> Self {
        Self::UnconfiguredMessageType {
            type_name: type_name.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    /// Create a deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    /// Create a send error for a destination
    pub fn send(destination: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChannelOperation {
            destination: destination.into(),
            operation: "send".to_string(),
            message: message.into(),
        }
    }

    /// Create a consume error for a queue
    pub fn consume(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChannelOperation {
            destination: queue_name.into(),
            operation: "consume".to_string(),
            message: message.into(),
        }
    }

    /// Create an ack error
    pub fn ack(queue_name: impl Into<String>, delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::ChannelOperation {
            destination: queue_name.into(),
            operation: format!("ack(tag={delivery_tag})"),
            message: message.into(),
        }
    }

    /// Create a reject error
    pub fn reject(
        queue_name: impl Into<String>,
        delivery_tag: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::ChannelOperation {
            destination: queue_name.into(),
            operation: format!("reject(tag={delivery_tag})"),
            message: message.into(),
        }
    }

    /// Create a closed-component error
    pub fn closed(component: impl Into<String>) -> Self {
        Self::Closed {
            component: component.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Conversion from serde_json::Error to BrokerError
impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            BrokerError::deserialization(err.to_string())
        } else {
            BrokerError::serialization(err.to_string())
        }
    }
}

/// Result type alias for messaging operations
pub type BrokerResult<T> = Result<T, BrokerError>;
