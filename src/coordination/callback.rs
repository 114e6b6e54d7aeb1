//! Role callback invoked by the leader elector

use async_trait::async_trait;

use crate::error::Result;

/// Application behavior run on leadership transitions
#[async_trait]
pub trait OnElectionCallback: Send + Sync {
    /// This process just became leader. A failure is logged but the role
    /// is kept; leadership only ends with the election node.
    async fn on_elected_leader(&self) -> Result<()>;

    /// This process is a follower. Runs on every re-evaluation, so it must
    /// tolerate being called while worker behavior is already running.
    async fn on_worker(&self);
}
