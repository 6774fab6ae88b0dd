//! Error types for the driver core

use ouroboros_bson::{BsonError, Document};
use thiserror::Error;

use crate::address::ServerAddress;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors raised by connections, pools, server nodes and the topology
#[derive(Error, Debug)]
pub enum DriverError {
    // ==================== Wire Errors ====================

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection {connection_id} to {address} failed: {source}")]
    Connection {
        address: ServerAddress,
        connection_id: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection {connection_id} to {address} is {state}")]
    ConnectionState {
        address: ServerAddress,
        connection_id: u64,
        state: String,
    },

    // ==================== Server Responses ====================

    #[error("Command {command_name} failed on {address} (connection {connection_id}): {message}")]
    Command {
        command_name: String,
        message: String,
        command: Box<Document>,
        response: Box<Document>,
        address: ServerAddress,
        connection_id: u64,
    },

    #[error("Write concern error on {address}: {message}")]
    WriteConcern {
        message: String,
        acknowledgment: Box<Document>,
        address: ServerAddress,
    },

    #[error("Cursor {cursor_id} not found on {address}")]
    CursorNotFound {
        cursor_id: i64,
        address: ServerAddress,
    },

    // ==================== Authentication ====================

    #[error("Authentication state error: {0}")]
    AuthenticationState(String),

    #[error("Authentication of {username} on {database} failed: {message}")]
    Authentication {
        username: String,
        database: String,
        message: String,
    },

    // ==================== Serialization ====================

    #[error(transparent)]
    Bson(#[from] BsonError),

    // ==================== Topology ====================

    #[error("Server {0} is no longer connected")]
    NotConnected(ServerAddress),

    #[error("Server {address} belongs to replica set {actual:?}, expected {expected}")]
    ReplicaSetMismatch {
        address: ServerAddress,
        expected: String,
        actual: Option<String>,
    },

    #[error("Server {0} is not a primary and secondaries were not allowed")]
    NotPrimary(ServerAddress),

    #[error("No suitable server: {0}")]
    NoSuitableServer(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl DriverError {
    /// Check if the operation may succeed when retried on a fresh connection
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Connection { .. }
                | DriverError::ConnectionState { .. }
                | DriverError::NotConnected(_)
                | DriverError::NoSuitableServer(_)
                | DriverError::Timeout(_)
        )
    }

    /// Check if the error came from the socket rather than the server
    pub fn is_network_error(&self) -> bool {
        matches!(self, DriverError::Connection { .. })
    }

    /// The server response attached to command and write errors
    pub fn response(&self) -> Option<&Document> {
        match self {
            DriverError::Command { response, .. } => Some(response),
            DriverError::WriteConcern { acknowledgment, .. } => Some(acknowledgment),
            _ => None,
        }
    }

    pub(crate) fn io(address: &ServerAddress, connection_id: u64, source: std::io::Error) -> Self {
        DriverError::Connection {
            address: address.clone(),
            connection_id,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ouroboros_bson::doc;

    fn address() -> ServerAddress {
        ServerAddress::new("db1", 27017)
    }

    #[test]
    fn test_retryable_classification() {
        let io = DriverError::io(
            &address(),
            7,
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        );
        assert!(io.is_retryable());
        assert!(io.is_network_error());

        let auth = DriverError::AuthenticationState("admin already authenticated".into());
        assert!(!auth.is_retryable());
        assert!(!auth.is_network_error());
    }

    #[test]
    fn test_command_error_carries_context() {
        let err = DriverError::Command {
            command_name: "ping".into(),
            message: "unauthorized".into(),
            command: Box::new(doc! { "ping": 1 }),
            response: Box::new(doc! { "ok": 0, "errmsg": "unauthorized" }),
            address: address(),
            connection_id: 3,
        };
        assert_eq!(err.response().unwrap().get_str("errmsg").unwrap(), "unauthorized");
        let text = err.to_string();
        assert!(text.contains("db1:27017"));
        assert!(text.contains("connection 3"));
    }

    #[test]
    fn test_bson_conversion() {
        let err: DriverError = BsonError::FieldNotFound("ok".into()).into();
        assert!(matches!(err, DriverError::Bson(_)));
    }
}
