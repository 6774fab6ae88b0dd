//! Per-server connection pooling
//!
//! Provides a generation-tracked connection pool with:
//! - Max connection limit enforced through a wait queue
//! - Idle and lifetime expiry
//! - Preference for connections already holding the caller's credential
//! - RAII guard for automatic return to the pool

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;

use crate::address::{AddressResolver, ServerAddress};
use crate::auth::{Authenticators, Credential};
use crate::config::{ConnectionSettings, DriverSettings, PoolSettings};
use crate::connection::{Connection, ConnectionOwner, ConnectionState};
use crate::error::{DriverError, Result};

/// Connection pool for one server
///
/// Use `Arc<ConnectionPool>` for sharing across tasks. Connections carry
/// the generation they were created in; [`ConnectionPool::clear`] bumps the
/// generation so outstanding connections are discarded when released.
pub struct ConnectionPool {
    address: ServerAddress,
    settings: PoolSettings,
    connection_settings: ConnectionSettings,
    resolver: Arc<dyn AddressResolver>,
    authenticators: Authenticators,
    owner: Weak<dyn ConnectionOwner>,
    generation: AtomicU64,
    /// Available (idle) connections, most recently used at the back
    idle: Mutex<VecDeque<Arc<Connection>>>,
    in_use: AtomicUsize,
    permits: Arc<Semaphore>,
}

impl ConnectionPool {
    pub fn new(address: ServerAddress, settings: &DriverSettings, owner: Weak<dyn ConnectionOwner>) -> Self {
        Self {
            address,
            settings: settings.pool.clone(),
            connection_settings: settings.connection.clone(),
            resolver: Arc::clone(&settings.resolver),
            authenticators: settings.authenticators.clone(),
            owner,
            generation: AtomicU64::new(0),
            idle: Mutex::new(VecDeque::new()),
            in_use: AtomicUsize::new(0),
            permits: Arc::new(Semaphore::new(settings.pool.max_pool_size)),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Get a connection authenticated for `credential`
    ///
    /// This method will:
    /// 1. Fail with `NotConnected` unless the owning server is connected
    /// 2. Wait up to the wait-queue timeout for a free slot, then check the
    ///    server again
    /// 3. Reuse an idle connection holding or able to take the credential
    /// 4. Otherwise dial a new connection
    pub async fn acquire(self: &Arc<Self>, credential: Option<&Credential>) -> Result<PooledConnection> {
        if !self.owner.upgrade().is_some_and(|o| o.is_connected()) {
            return Err(DriverError::NotConnected(self.address.clone()));
        }

        let permit = match timeout(
            self.settings.wait_queue_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DriverError::NotConnected(self.address.clone())),
            Err(_) => {
                return Err(DriverError::Timeout(format!(
                    "no connection to {} became available within {:?}",
                    self.address, self.settings.wait_queue_timeout
                )))
            }
        };
        // The server may have gone away while this task waited for a slot
        if !self.owner.upgrade().is_some_and(|o| o.is_connected()) {
            return Err(DriverError::NotConnected(self.address.clone()));
        }

        let connection = match self.take_idle(credential) {
            Some(connection) => connection,
            None => self.dial().await?,
        };
        connection.check_authentication(credential).await?;

        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection {
            connection,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    async fn dial(&self) -> Result<Arc<Connection>> {
        let generation = self.generation();
        let connection = Connection::new(
            self.address.clone(),
            self.connection_settings.clone(),
            Arc::clone(&self.resolver),
            self.authenticators.clone(),
        )
        .with_owner(self.owner.clone(), generation);
        connection.open().await?;
        debug!(
            address = %self.address,
            connection_id = connection.id(),
            generation,
            "Added connection to pool"
        );
        Ok(Arc::new(connection))
    }

    fn is_reusable(&self, connection: &Connection) -> bool {
        connection.generation() == self.generation()
            && connection.state() == ConnectionState::Open
            && !connection.is_expired(&self.settings)
    }

    fn take_idle(&self, credential: Option<&Credential>) -> Option<Arc<Connection>> {
        let mut idle = self.idle.lock();
        idle.retain(|c| self.is_reusable(c));

        let position = match credential {
            None => idle.len().checked_sub(1),
            Some(credential) => idle
                .iter()
                .rposition(|c| c.is_authenticated(credential))
                .or_else(|| idle.iter().rposition(|c| c.can_authenticate(credential))),
        }?;
        idle.remove(position)
    }

    /// Return a connection; stale or broken ones are dropped
    fn release(&self, connection: Arc<Connection>) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        if !self.is_reusable(&connection) {
            debug!(
                address = %self.address,
                connection_id = connection.id(),
                generation = connection.generation(),
                "Discarding connection"
            );
            return;
        }
        self.idle.lock().push_back(connection);
    }

    /// Close idle connections and invalidate outstanding ones
    pub fn clear(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let drained: Vec<Arc<Connection>> = self.idle.lock().drain(..).collect();
        debug!(
            address = %self.address,
            generation,
            closed = drained.len(),
            "Cleared connection pool"
        );
    }

    /// Drop idle connections past their idle time or lifetime
    pub fn prune(&self) {
        self.idle.lock().retain(|c| self.is_reusable(c));
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            in_use: self.in_use.load(Ordering::SeqCst),
            generation: self.generation(),
            max_size: self.settings.max_pool_size,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub generation: u64,
    pub max_size: usize,
}

/// RAII guard for a pooled connection
///
/// The connection is returned to the pool when dropped.
pub struct PooledConnection {
    connection: Arc<Connection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.connection));
    }
}
