//! WolfCoord - Leader Election and Service Registry
//!
//! Cluster coordination on top of a hierarchical, watchable namespace with
//! ephemeral and sequential nodes.
//!
//! # Architecture
//!
//! Each process opens one session on the coordination store. Within that
//! session it volunteers for leadership by creating a sequential ephemeral
//! node; the smallest node leads, and every other process watches only its
//! immediate predecessor. Processes publish their address to a service
//! registry whose members are cached and refreshed from a children watch.
//!
//! # Features
//!
//! - Coordination store server and client over a framed TCP protocol
//! - In-memory namespace for embedding and tests
//! - Leader election with one watch per participant
//! - Watch-refreshed service registry with snapshot publication
//! - HTTP API for node status and membership

pub mod config;
pub mod error;
pub mod store;
pub mod session;
pub mod coordination;
pub mod node;
pub mod api;

pub use config::WolfCoordConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfCoordConfig;
    pub use crate::error::{Error, Result};
    pub use crate::store::{CoordinationStore, CreateMode, MemoryStore, RemoteStore, StoreEvent};
    pub use crate::session::{CoordinationSession, DisconnectReason, SessionState, Watcher};
    pub use crate::coordination::{
        ClusterMembership, LeaderElector, LeaderState, OnElectionCallback, SequentialGroup,
        ServiceRegistry,
    };
    pub use crate::node::ClusterNode;
}
