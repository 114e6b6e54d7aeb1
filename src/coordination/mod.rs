//! Coordination Module
//!
//! Leader election and service registry built on sequential ephemeral nodes.

pub mod callback;
pub mod election;
pub mod registry;
pub mod sequence;

pub use callback::OnElectionCallback;
pub use election::{LeaderElector, LeaderState};
pub use registry::{ClusterMembership, ServiceRegistry};
pub use sequence::{Position, SequentialGroup};
