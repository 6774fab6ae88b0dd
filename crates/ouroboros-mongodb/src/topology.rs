//! The set of known servers, their monitoring and server selection

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::ServerAddress;
use crate::config::{ConnectionMode, DriverSettings};
use crate::error::{DriverError, Result};
use crate::pool::PooledConnection;
use crate::selector::{CompositeSelector, ConnectedSelector, PrimarySelector, ReadPreferenceSelector, ServerSelector};
use crate::server::{ListenerId, ServerDescription, ServerInstance, ServerState, ServerStateChanged, StateChangeListeners};

const SELECTION_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// All servers the driver talks to
///
/// In replica-set mode the primary's host list decides membership: unknown
/// hosts are added and connected, absent ones are disconnected and removed.
/// Direct and sharded modes keep the seed list fixed.
pub struct Topology {
    settings: DriverSettings,
    mode: ConnectionMode,
    servers: RwLock<BTreeMap<ServerAddress, Arc<ServerInstance>>>,
    listeners: Arc<StateChangeListeners>,
    round_robin: AtomicUsize,
    cancel: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Topology {
    /// Connect to the seeds and start the heartbeat monitor
    ///
    /// Fails when no seed could be connected.
    pub async fn connect(settings: DriverSettings) -> Result<Arc<Self>> {
        settings.validate()?;
        let topology = Arc::new(Self {
            mode: settings.effective_mode(),
            servers: RwLock::new(BTreeMap::new()),
            listeners: Arc::new(StateChangeListeners::new()),
            round_robin: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            monitor: Mutex::new(None),
            settings,
        });

        for seed in topology.settings.seeds.clone() {
            topology.add_server(seed);
        }
        topology.refresh().await;

        if !topology.descriptions().iter().any(ServerDescription::is_connected) {
            let errors: Vec<String> = topology
                .descriptions()
                .into_iter()
                .map(|d| format!("{}: {}", d.address, d.last_error.unwrap_or_else(|| "not connected".into())))
                .collect();
            topology.shutdown().await;
            return Err(DriverError::NoSuitableServer(format!(
                "could not connect to any seed ({})",
                errors.join("; ")
            )));
        }

        topology.start_monitor();
        info!(mode = ?topology.mode, servers = topology.servers().len(), "Topology connected");
        Ok(topology)
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn servers(&self) -> Vec<Arc<ServerInstance>> {
        self.servers.read().values().cloned().collect()
    }

    pub fn server(&self, address: &ServerAddress) -> Option<Arc<ServerInstance>> {
        self.servers.read().get(address).cloned()
    }

    /// Snapshots of every server, ordered by address
    pub fn descriptions(&self) -> Vec<ServerDescription> {
        self.servers().iter().map(|s| s.description()).collect()
    }

    /// Listen to state changes of every current and future server
    pub fn subscribe<F>(&self, func: F) -> ListenerId
    where
        F: Fn(&ServerStateChanged) + Send + Sync + 'static,
    {
        self.listeners.subscribe(func)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn slave_ok(&self) -> bool {
        match self.mode {
            ConnectionMode::Direct => self.settings.read_preference.allows_secondary(),
            _ => true,
        }
    }

    // ==================== Membership ====================

    fn add_server(&self, address: ServerAddress) -> Arc<ServerInstance> {
        let mut servers = self.servers.write();
        if let Some(existing) = servers.get(&address) {
            return Arc::clone(existing);
        }
        let server = ServerInstance::new(address.clone(), &self.settings);
        let forward = Arc::clone(&self.listeners);
        server.subscribe(move |event| forward.dispatch(event));
        servers.insert(address.clone(), Arc::clone(&server));
        info!(address = %address, "Added server to topology");
        server
    }

    async fn remove_server(&self, address: &ServerAddress) {
        let removed = self.servers.write().remove(address);
        if let Some(server) = removed {
            server.disconnect().await;
            info!(address = %address, "Removed server from topology");
        }
    }

    /// Health-check every server, then reconcile membership
    pub async fn refresh(&self) {
        let slave_ok = self.slave_ok();
        let servers = self.servers();
        let results = join_all(servers.iter().map(|server| async move {
            let result = match server.state() {
                ServerState::Disconnected => server.connect(slave_ok).await,
                _ => server.verify_state().await,
            };
            (server.address().clone(), result)
        }))
        .await;
        for (address, result) in results {
            if let Err(e) = result {
                debug!(address = %address, error = %e, "Health check failed");
            }
        }

        if self.mode == ConnectionMode::ReplicaSet {
            self.retire_foreign_members().await;
            self.reconcile().await;
        }
    }

    /// Drop servers that belong to another replica set
    async fn retire_foreign_members(&self) {
        let Some(expected) = self.settings.replica_set_name.clone() else {
            return;
        };
        for description in self.descriptions() {
            if !description.is_connected() || description.replica_set_name.as_deref() == Some(&expected) {
                continue;
            }
            let error = DriverError::ReplicaSetMismatch {
                address: description.address.clone(),
                expected: expected.clone(),
                actual: description.replica_set_name.clone(),
            };
            warn!(error = %error, "Retiring server");
            self.remove_server(&description.address).await;
        }
    }

    /// Align membership with the primary's reported host list
    async fn reconcile(&self) {
        let Some(primary) = self
            .descriptions()
            .into_iter()
            .find(|d| d.is_connected() && d.is_primary)
        else {
            return;
        };
        if primary.hosts.is_empty() {
            return;
        }

        let known: Vec<ServerAddress> = self.servers.read().keys().cloned().collect();
        let added: Vec<Arc<ServerInstance>> = primary
            .hosts
            .iter()
            .filter(|host| !known.contains(host))
            .map(|host| self.add_server(host.clone()))
            .collect();
        let results = join_all(added.iter().map(|server| server.connect(true))).await;
        for (server, result) in added.iter().zip(results) {
            if let Err(e) = result {
                debug!(address = %server.address(), error = %e, "Could not connect discovered host");
            }
        }

        for address in known {
            if address != primary.address && !primary.hosts.contains(&address) {
                self.remove_server(&address).await;
            }
        }
    }

    // ==================== Selection ====================

    fn try_select(&self, selector: &dyn ServerSelector) -> Option<Arc<ServerInstance>> {
        let servers = self.servers();
        let descriptions: Vec<ServerDescription> = servers.iter().map(|s| s.description()).collect();
        let candidates: Vec<&ServerDescription> = descriptions.iter().collect();
        let selected = selector.select(&candidates);
        if selected.is_empty() {
            return None;
        }
        let chosen = selected[self.round_robin.fetch_add(1, Ordering::Relaxed) % selected.len()];
        servers.into_iter().find(|s| *s.address() == chosen.address)
    }

    /// Pick a server, refreshing until one matches or the selection timeout passes
    ///
    /// A timeout too large to represent as a deadline retries without limit.
    pub async fn select_server(&self, selector: &dyn ServerSelector) -> Result<Arc<ServerInstance>> {
        let deadline = Instant::now().checked_add(self.settings.server_selection_timeout);
        loop {
            if let Some(server) = self.try_select(selector) {
                return Ok(server);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(DriverError::NoSuitableServer(format!(
                    "no server matched within {:?}",
                    self.settings.server_selection_timeout
                )));
            }
            self.refresh().await;
            if let Some(server) = self.try_select(selector) {
                return Ok(server);
            }
            let pause = match deadline {
                Some(deadline) => {
                    SELECTION_RETRY_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))
                }
                None => SELECTION_RETRY_INTERVAL,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// A server that accepts writes
    pub async fn select_primary(&self) -> Result<Arc<ServerInstance>> {
        let selector = CompositeSelector::new()
            .then(ConnectedSelector)
            .then(PrimarySelector);
        self.select_server(&selector).await
    }

    /// A server for reads under the configured read preference
    pub async fn select_for_read(&self) -> Result<Arc<ServerInstance>> {
        let selector = ReadPreferenceSelector::new(
            self.settings.read_preference,
            self.settings.secondary_acceptable_latency,
        );
        self.select_server(&selector).await
    }

    /// Select a server and check out a connection holding the configured credential
    pub async fn acquire(&self, selector: &dyn ServerSelector) -> Result<PooledConnection> {
        let server = self.select_server(selector).await?;
        server.acquire(self.settings.credential.as_ref()).await
    }

    // ==================== Monitoring ====================

    fn start_monitor(self: &Arc<Self>) {
        let topology = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.settings.heartbeat_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(topology) = topology.upgrade() else {
                    break;
                };
                topology.refresh().await;
            }
            debug!("Topology monitor stopped");
        });
        *self.monitor.lock() = Some(handle);
    }

    /// Stop monitoring and disconnect every server
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Topology monitor ended abnormally");
            }
        }
        join_all(self.servers().iter().map(|s| s.disconnect())).await;
        info!("Topology shut down");
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("mode", &self.mode)
            .field("servers", &*self.servers.read())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_requires_a_reachable_seed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::from(listener.local_addr().unwrap());
        drop(listener);

        let result = Topology::connect(DriverSettings::new([address])).await;
        assert!(matches!(result, Err(DriverError::NoSuitableServer(_))));
    }

    #[tokio::test]
    async fn test_connect_validates_settings() {
        let result = Topology::connect(DriverSettings::default()).await;
        assert!(matches!(result, Err(DriverError::InvalidConfiguration(_))));
    }
}
