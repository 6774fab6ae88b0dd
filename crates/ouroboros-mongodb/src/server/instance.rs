//! One server: its state machine, health checks and connection pool

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use ouroboros_bson::doc;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::description::{ServerDescription, ServerState};
use super::events::{ListenerId, ServerStateChanged, StateChangeListeners};
use crate::address::{AddressResolver, ServerAddress};
use crate::auth::{Authenticators, Credential, ADMIN_DATABASE};
use crate::config::{ConnectionSettings, DriverSettings};
use crate::connection::{Connection, ConnectionOwner, ConnectionState};
use crate::error::{DriverError, Result};
use crate::fault::FaultAction;
use crate::pool::{ConnectionPool, PooledConnection};

/// A server node
///
/// State moves Disconnected → Connecting → Connected on `connect`, and
/// through Disconnecting back to Disconnected on `disconnect`. A connection
/// fault forces Connected to Unknown until the next health check.
/// Health checks use a dedicated monitor connection outside the pool.
pub struct ServerInstance {
    address: ServerAddress,
    connection_settings: ConnectionSettings,
    resolver: Arc<dyn AddressResolver>,
    authenticators: Authenticators,
    description: RwLock<ServerDescription>,
    /// Serializes connect, verify and disconnect
    lifecycle: tokio::sync::Mutex<()>,
    monitor: tokio::sync::Mutex<Option<Connection>>,
    pool: Arc<ConnectionPool>,
    listeners: StateChangeListeners,
}

impl ServerInstance {
    pub fn new(address: ServerAddress, settings: &DriverSettings) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ServerInstance>| {
            let owner: Weak<dyn ConnectionOwner> = weak.clone();
            Self {
                pool: Arc::new(ConnectionPool::new(address.clone(), settings, owner)),
                description: RwLock::new(ServerDescription::new(address.clone())),
                address,
                connection_settings: settings.connection.clone(),
                resolver: Arc::clone(&settings.resolver),
                authenticators: settings.authenticators.clone(),
                lifecycle: tokio::sync::Mutex::new(()),
                monitor: tokio::sync::Mutex::new(None),
                listeners: StateChangeListeners::new(),
            }
        })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// A consistent snapshot of the current description
    pub fn description(&self) -> ServerDescription {
        self.description.read().clone()
    }

    pub fn state(&self) -> ServerState {
        self.description.read().state
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn listeners(&self) -> &StateChangeListeners {
        &self.listeners
    }

    pub fn subscribe<F>(&self, func: F) -> ListenerId
    where
        F: Fn(&ServerStateChanged) + Send + Sync + 'static,
    {
        self.listeners.subscribe(func)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Get a pooled connection authenticated for `credential`
    pub async fn acquire(&self, credential: Option<&Credential>) -> Result<PooledConnection> {
        self.pool.acquire(credential).await
    }

    /// Apply `change` under the lock and notify listeners if state or role moved
    fn update_description(&self, change: impl FnOnce(&mut ServerDescription)) {
        let (previous, current) = {
            let mut description = self.description.write();
            let previous = description.clone();
            change(&mut description);
            description.last_update = Some(Utc::now());
            (previous, description.clone())
        };

        if previous.role_changed(&current) {
            debug!(
                address = %self.address,
                from = ?previous.state,
                to = ?current.state,
                primary = current.is_primary,
                secondary = current.is_secondary,
                "Server state changed"
            );
            self.listeners.dispatch(&ServerStateChanged {
                address: self.address.clone(),
                previous,
                current,
            });
        }
    }

    // ==================== Probes ====================

    fn monitor_connection(&self) -> Connection {
        Connection::new(
            self.address.clone(),
            self.connection_settings.clone(),
            Arc::clone(&self.resolver),
            self.authenticators.clone(),
        )
    }

    /// Liveness probe; returns the measured round trip
    async fn ping(&self) -> Result<Duration> {
        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(|c| c.state() == ConnectionState::Closed) {
            *monitor = None;
        }
        let connection = monitor.get_or_insert_with(|| self.monitor_connection());
        let started = Instant::now();
        connection.run_command(ADMIN_DATABASE, doc! { "ping": 1 }).await?;
        Ok(started.elapsed())
    }

    /// Status probe; returns the current description updated from the replies
    async fn probe_status(&self) -> Result<ServerDescription> {
        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(|c| c.state() == ConnectionState::Closed) {
            *monitor = None;
        }
        let connection = monitor.get_or_insert_with(|| self.monitor_connection());
        let is_master = connection
            .run_command(ADMIN_DATABASE, doc! { "ismaster": 1 })
            .await?;
        let build_info = connection
            .run_command(ADMIN_DATABASE, doc! { "buildinfo": 1 })
            .await?;

        let mut next = self.description();
        next.apply_is_master(&is_master);
        next.apply_build_info(&build_info);
        Ok(next)
    }

    async fn drop_monitor(&self) {
        if let Some(connection) = self.monitor.lock().await.take() {
            connection.close().await;
        }
    }

    async fn mark_disconnected(&self, error: &DriverError) {
        self.pool.clear();
        self.drop_monitor().await;
        let message = error.to_string();
        self.update_description(|d| {
            d.state = ServerState::Disconnected;
            d.reset_role();
            d.last_error = Some(message);
        });
    }

    // ==================== Lifecycle ====================

    /// Connect and record the server's role
    ///
    /// Fails and reverts to Disconnected if the server is not a primary and
    /// `slave_ok` is false.
    pub async fn connect(&self, slave_ok: bool) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ServerState::Connected {
            return Ok(());
        }
        self.update_description(|d| d.state = ServerState::Connecting);

        let probed = match self.ping().await {
            Ok(rtt) => self.probe_status().await.map(|mut next| {
                next.record_round_trip(rtt);
                next
            }),
            Err(e) => Err(e),
        };
        let mut next = match probed {
            Ok(next) => next,
            Err(e) => {
                warn!(address = %self.address, error = %e, "Connect failed");
                self.mark_disconnected(&e).await;
                return Err(e);
            }
        };

        if !next.is_primary && !slave_ok {
            let error = DriverError::NotPrimary(self.address.clone());
            self.mark_disconnected(&error).await;
            return Err(error);
        }

        next.state = ServerState::Connected;
        next.last_error = None;
        self.update_description(|d| *d = next);
        debug!(address = %self.address, "Server connected");
        Ok(())
    }

    /// Periodic health check
    ///
    /// A failed liveness probe clears the pool before the status probe runs.
    /// A failed status probe forces the server to Disconnected.
    pub async fn verify_state(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if matches!(self.state(), ServerState::Disconnected | ServerState::Disconnecting) {
            return Ok(());
        }

        let round_trip = match self.ping().await {
            Ok(rtt) => Some(rtt),
            Err(e) => {
                warn!(address = %self.address, error = %e, "Liveness probe failed; clearing pool");
                self.pool.clear();
                self.drop_monitor().await;
                None
            }
        };

        match self.probe_status().await {
            Ok(mut next) => {
                if let Some(rtt) = round_trip {
                    next.record_round_trip(rtt);
                }
                next.state = ServerState::Connected;
                next.last_error = None;
                self.update_description(|d| *d = next);
                self.pool.prune();
                Ok(())
            }
            Err(e) => {
                warn!(address = %self.address, error = %e, "Status probe failed");
                self.mark_disconnected(&e).await;
                Err(e)
            }
        }
    }

    /// Tear down: clear the pool and close the monitor connection
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ServerState::Disconnected {
            return;
        }
        self.update_description(|d| d.state = ServerState::Disconnecting);
        self.pool.clear();
        self.drop_monitor().await;
        self.update_description(|d| {
            d.state = ServerState::Disconnected;
            d.reset_role();
        });
        debug!(address = %self.address, "Server disconnected");
    }

    /// Stop trusting the cached role until the next health check
    pub fn invalidate(&self) {
        self.update_description(|d| {
            if d.state == ServerState::Connected {
                d.state = ServerState::Unknown;
            }
        });
    }
}

impl ConnectionOwner for ServerInstance {
    fn max_document_size(&self) -> usize {
        self.description.read().max_document_size
    }

    fn max_message_length(&self) -> usize {
        self.description.read().max_message_length
    }

    fn is_connected(&self) -> bool {
        self.state() == ServerState::Connected
    }

    fn on_fault(&self, connection_id: u64, action: FaultAction, error: &DriverError) {
        warn!(
            address = %self.address,
            connection_id,
            ?action,
            error = %error,
            "Pooled connection faulted"
        );
        if action == FaultAction::ClearPool {
            self.pool.clear();
        }
        self.invalidate();
    }
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_instance_is_disconnected() {
        let settings = DriverSettings::new([ServerAddress::new("db1", 27017)]);
        let server = ServerInstance::new(ServerAddress::new("db1", 27017), &settings);
        assert_eq!(server.state(), ServerState::Disconnected);
        assert!(matches!(
            server.acquire(None).await,
            Err(DriverError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_records_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::from(listener.local_addr().unwrap());
        drop(listener);

        let settings = DriverSettings::new([address.clone()]);
        let server = ServerInstance::new(address, &settings);
        let states = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        server.subscribe(move |e| seen.lock().push(e.current.state));

        assert!(server.connect(true).await.is_err());
        let description = server.description();
        assert_eq!(description.state, ServerState::Disconnected);
        assert!(description.last_error.is_some());
        assert_eq!(
            *states.lock(),
            vec![ServerState::Connecting, ServerState::Disconnected]
        );
    }

    #[tokio::test]
    async fn test_invalidate_only_from_connected() {
        let settings = DriverSettings::new([ServerAddress::new("db1", 27017)]);
        let server = ServerInstance::new(ServerAddress::new("db1", 27017), &settings);
        server.invalidate();
        assert_eq!(server.state(), ServerState::Disconnected);

        server.update_description(|d| d.state = ServerState::Connected);
        server.invalidate();
        assert_eq!(server.state(), ServerState::Unknown);
    }
}
