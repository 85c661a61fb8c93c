use std::time::Duration;

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// Broker connection and management-channel errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Dialing the broker failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Opening a channel on an established connection failed.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Queue declare/bind/consume failed, or the link is not open yet.
    #[error("Setup error: {0}")]
    Setup(String),

    /// Releasing a broker resource failed.
    #[error("Teardown error: {0}")]
    Teardown(String),
}

/// Errors raised by one direction of a gateway transport pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport was closed locally or by the broker.
    #[error("Transport closed")]
    Closed,

    /// Any other broker-side I/O failure.
    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// An inbound frame could not be decoded into a message.
#[derive(Debug, Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(pub String);

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Persistent gateway registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Existence/status query failed.
    #[error("Lookup failed: {0}")]
    Lookup(String),

    /// Status update failed.
    #[error("Update failed: {0}")]
    Update(String),

    /// Lookup did not complete within its deadline.
    #[error("Lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced to a caller blocked in an RPC.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No correlated reply arrived within the deadline.
    #[error("RPC timed out after {0:?}")]
    Timeout(Duration),

    /// The session was stopped while the call was outstanding.
    #[error("RPC transport closed")]
    TransportClosed,

    /// The request could not be encoded.
    #[error("RPC request encode error: {0}")]
    Encode(String),

    /// Publishing the request failed.
    #[error("RPC transport error: {0}")]
    Transport(#[from] TransportError),

    /// The correlated reply could not be decoded.
    #[error("RPC reply decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Business-logic creation or processing errors
#[derive(Debug, Error)]
pub enum LogicError {
    /// A message could not be processed.
    #[error("Processing failed: {0}")]
    Process(String),

    /// Underlying registry call failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors of the outward gateway supervisor surface.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No session is attached for the gateway.
    #[error("Unknown gateway: {0}")]
    UnknownGateway(String),

    /// The session's RPC failed.
    #[error("RPC failed: {0}")]
    Rpc(#[from] RpcError),

    /// Broker connectivity failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A session's transport failed to close cleanly.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLx operation error.
    #[error("SQLx error: {0}")]
    Sqlx(String),

    /// Migration execution error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Requested record was not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Invalid gateway/device status string value.
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// Generic serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_config_error_variant() {
        let err = ConfigError::MissingField("server.id".to_string());
        assert!(err.to_string().contains("Missing required field"));
    }

    #[test]
    fn wraps_rpc_timeout_into_gateway_error() {
        let err: GatewayError = RpcError::Timeout(Duration::from_millis(1500)).into();
        let text = err.to_string();
        assert!(text.contains("RPC failed"));
        assert!(text.contains("1.5s"));
    }

    #[test]
    fn broker_errors_pass_through_gateway_error() {
        let err: GatewayError = BrokerError::Setup("no connection".to_string()).into();
        assert_eq!(err.to_string(), "Setup error: no connection");
    }

    #[test]
    fn decode_error_wraps_serde_failure() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err = DecodeError::from(serde_err);
        assert!(err.to_string().starts_with("Decode error:"));
    }

    #[test]
    fn registry_timeout_names_deadline() {
        let err = RegistryError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Lookup timed out after 5s");

        let db = DatabaseError::NotFound("gw1".to_string());
        assert_eq!(db.to_string(), "Not found: gw1");
    }

    #[test]
    fn logic_error_is_transparent_over_registry() {
        let err: LogicError = RegistryError::Update("locked".to_string()).into();
        assert_eq!(err.to_string(), "Update failed: locked");
    }
}
