//! # Message Serialization
//!
//! The serialization contract between typed messages and the byte payloads
//! the broker carries. The default wire format is UTF-8 JSON via the blanket
//! implementation, but the trait does not require it: a type may implement
//! [`BrokerMessage`] directly to use a different format.

use crate::errors::{BrokerError, BrokerResult};

/// Serialization contract for messages that travel through the broker.
///
/// Any type implementing `Serialize + DeserializeOwned` gets a JSON
/// implementation for free via the blanket impl below.
pub trait BrokerMessage: Send + Sync + 'static {
    /// Serialize the message to bytes
    fn to_bytes(&self) -> BrokerResult<Vec<u8>>;

    /// Deserialize the message from bytes
    fn from_bytes(bytes: &[u8]) -> BrokerResult<Self>
    where
        Self: Sized;
}

/// Blanket implementation providing JSON serialization for any
/// serde-compatible type.
impl<T> BrokerMessage for T
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    fn to_bytes(&self) -> BrokerResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BrokerError::serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> BrokerResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::deserialization(e.to_string()))
    }
}
