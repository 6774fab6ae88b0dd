//! Server state-change notifications
//!
//! Listeners are called synchronously after a server's description changed
//! state or role. A panicking listener is logged and skipped; it never
//! reaches the health check that triggered it.
//!
//! # Example
//! ```
//! use ouroboros_mongodb::server::StateChangeListeners;
//!
//! let listeners = StateChangeListeners::new();
//! let id = listeners.subscribe(|event| {
//!     println!("{} is now {:?}", event.address, event.current.state);
//! });
//! assert!(listeners.unsubscribe(id));
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use super::description::ServerDescription;
use crate::address::ServerAddress;

/// A server moved between states or changed role
#[derive(Debug, Clone)]
pub struct ServerStateChanged {
    pub address: ServerAddress,
    pub previous: ServerDescription,
    pub current: ServerDescription,
}

/// Handler for state changes
pub trait StateChangeListener: Send + Sync {
    fn on_state_changed(&self, event: &ServerStateChanged);
}

/// Function-based listener
pub struct FnListener<F>
where
    F: Fn(&ServerStateChanged) + Send + Sync,
{
    func: F,
}

impl<F> FnListener<F>
where
    F: Fn(&ServerStateChanged) + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> StateChangeListener for FnListener<F>
where
    F: Fn(&ServerStateChanged) + Send + Sync,
{
    fn on_state_changed(&self, event: &ServerStateChanged) {
        (self.func)(event);
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registry of state-change listeners
#[derive(Default)]
pub struct StateChangeListeners {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn StateChangeListener>)>>,
}

impl StateChangeListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn StateChangeListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Register a function listener
    pub fn subscribe<F>(&self, func: F) -> ListenerId
    where
        F: Fn(&ServerStateChanged) + Send + Sync + 'static,
    {
        self.register(Arc::new(FnListener::new(func)))
    }

    /// Returns false when the id was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Call every listener; panics are caught and logged
    pub fn dispatch(&self, event: &ServerStateChanged) {
        let listeners: Vec<Arc<dyn StateChangeListener>> =
            self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_state_changed(event))).is_err() {
                warn!(address = %event.address, "State change listener panicked");
            }
        }
    }
}
