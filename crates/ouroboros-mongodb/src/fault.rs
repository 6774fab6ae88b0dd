//! Deciding what a failed operation does to its connection

use crate::error::DriverError;

/// What to do with a connection after an operation on it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// The stream is still in sync; keep using the connection
    KeepConnection,
    /// Close only the faulted connection
    CloseConnection,
    /// Close every connection in the owning pool
    ClearPool,
}

/// Classify a failure observed on a connection
///
/// Socket failures and stream desynchronisation close the connection.
/// Errors the server reported in a well-formed reply leave it open.
/// `ClearPool` is never returned here; it is reserved for fault kinds
/// known to affect every connection to a server.
pub fn classify_fault(error: &DriverError) -> FaultAction {
    match error {
        DriverError::Connection { .. } | DriverError::Protocol(_) | DriverError::Timeout(_) => {
            FaultAction::CloseConnection
        }
        DriverError::ConnectionState { .. } => FaultAction::CloseConnection,
        DriverError::Command { .. }
        | DriverError::WriteConcern { .. }
        | DriverError::CursorNotFound { .. }
        | DriverError::Authentication { .. }
        | DriverError::AuthenticationState(_)
        | DriverError::Bson(_) => FaultAction::KeepConnection,
        DriverError::NotConnected(_)
        | DriverError::ReplicaSetMismatch { .. }
        | DriverError::NotPrimary(_)
        | DriverError::NoSuitableServer(_)
        | DriverError::InvalidConfiguration(_) => FaultAction::KeepConnection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ServerAddress;
    use ouroboros_bson::{doc, BsonError};
    use std::io;

    fn io_error(kind: io::ErrorKind) -> DriverError {
        DriverError::io(&ServerAddress::new("db", 27017), 1, io::Error::new(kind, "boom"))
    }

    #[test]
    fn test_io_faults_close_connection() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof,
        ] {
            assert_eq!(classify_fault(&io_error(kind)), FaultAction::CloseConnection);
        }
        assert_eq!(
            classify_fault(&DriverError::Protocol("bad length".into())),
            FaultAction::CloseConnection
        );
    }

    #[test]
    fn test_server_errors_keep_connection() {
        let err = DriverError::Command {
            command_name: "count".into(),
            message: "ns missing".into(),
            command: Box::new(doc! { "count": "c" }),
            response: Box::new(doc! { "ok": 0 }),
            address: ServerAddress::new("db", 27017),
            connection_id: 1,
        };
        assert_eq!(classify_fault(&err), FaultAction::KeepConnection);
        assert_eq!(
            classify_fault(&DriverError::Bson(BsonError::FieldNotFound("x".into()))),
            FaultAction::KeepConnection
        );
    }

    #[test]
    fn test_never_escalates_to_pool() {
        let samples = [
            io_error(io::ErrorKind::ConnectionRefused),
            DriverError::Protocol("x".into()),
            DriverError::Timeout("x".into()),
            DriverError::AuthenticationState("x".into()),
            DriverError::NotConnected(ServerAddress::new("db", 27017)),
        ];
        for err in &samples {
            assert_ne!(classify_fault(err), FaultAction::ClearPool);
        }
    }
}
