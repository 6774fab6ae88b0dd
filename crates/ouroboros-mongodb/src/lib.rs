//! MongoDB wire-protocol driver core for ouroboros
//!
//! This crate owns everything between a BSON document and a socket: message
//! framing, connections, pooling, server monitoring and server selection.
//!
//! # Features
//! - Legacy opcode messages (query, insert, update, delete, get-more, kill-cursors, reply)
//! - Lazily dialed connections with per-connection authentication state
//! - Bounded connection pool with generations, idle and lifetime expiry
//! - Per-server state machine with health checks and change notifications
//! - Read-preference and latency-window server selection
//! - Replica-set discovery driven by the primary's host list

pub mod address;
pub mod auth;
pub mod concern;
pub mod config;
pub mod connection;
pub mod error;
pub mod fault;
pub mod pool;
pub mod protocol;
pub mod selector;
pub mod server;
pub mod topology;

pub use address::{AddressResolver, DnsResolver, ServerAddress, DEFAULT_PORT};
pub use auth::{Authenticator, Authenticators, Credential, NonceAuthenticator};
pub use concern::{Acknowledgment, WriteConcern};
pub use config::{ConnectionMode, ConnectionSettings, DriverSettings, PoolSettings};
pub use connection::{CommandOptions, Connection, ConnectionOwner, ConnectionState};
pub use error::{DriverError, Result};
pub use fault::{classify_fault, FaultAction};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use selector::{
    CompositeSelector, ConnectedSelector, LatencyWindowSelector, PrimarySelector,
    ReadPreference, ReadPreferenceSelector, SecondarySelector, ServerSelector,
};
pub use server::{ServerDescription, ServerInstance, ServerState, ServerStateChanged};
pub use topology::Topology;

pub use ouroboros_bson::{doc, Bson, Document};
