//! Server nodes: descriptions, state-change events and the node state machine

pub mod description;
pub mod events;
pub mod instance;

pub use description::{ServerDescription, ServerState};
pub use events::{FnListener, ListenerId, ServerStateChanged, StateChangeListener, StateChangeListeners};
pub use instance::ServerInstance;
