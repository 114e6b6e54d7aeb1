//! Coordination Store
//!
//! The capability interface the election and registry logic consume, plus
//! the in-memory namespace and the TCP server/client that expose it.
//!
//! Every operation that takes a `watch` flag arms a one-shot watch: it fires
//! at most once and must be re-armed by the caller to see later changes.

pub mod memory;
pub mod protocol;
mod server;
mod client;

pub use memory::{MemorySession, MemoryStore, WatchKind};
pub use server::StoreServer;
pub use client::RemoteStore;
#[cfg(test)]
pub(crate) use server::spawn_local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Session identifier assigned by the store
pub type SessionId = u64;

/// Version value meaning "do not check the version"
pub const ANY_VERSION: i32 = -1;

/// Receiving side of a session's notification channel
pub type EventReceiver = mpsc::UnboundedReceiver<StoreEvent>;

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    /// Build a mode from the two independent flags
    pub fn new(ephemeral: bool, sequential: bool) -> Self {
        match (ephemeral, sequential) {
            (false, false) => CreateMode::Persistent,
            (false, true) => CreateMode::PersistentSequential,
            (true, false) => CreateMode::Ephemeral,
            (true, true) => CreateMode::EphemeralSequential,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::PersistentSequential | CreateMode::EphemeralSequential)
    }
}

/// Node metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Store transaction that created the node
    pub czxid: u64,
    /// Store transaction that last modified the node
    pub mzxid: u64,
    /// Creation time (unix millis)
    pub ctime: i64,
    /// Data version, bumped on every `set_data`
    pub version: i32,
    /// Owning session for ephemeral nodes
    pub ephemeral_owner: Option<SessionId>,
    pub data_length: usize,
    pub num_children: usize,
}

/// Notifications delivered on a session's channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    /// Session established
    Connected,
    /// Connection to the store dropped
    Disconnected,
    /// Session expired; its ephemeral nodes are gone
    Expired,
    NodeCreated(String),
    NodeDeleted(String),
    NodeDataChanged(String),
    NodeChildrenChanged(String),
}

impl StoreEvent {
    /// Path the event refers to, if it is a node event
    pub fn path(&self) -> Option<&str> {
        match self {
            StoreEvent::NodeCreated(p)
            | StoreEvent::NodeDeleted(p)
            | StoreEvent::NodeDataChanged(p)
            | StoreEvent::NodeChildrenChanged(p) => Some(p),
            _ => None,
        }
    }

    /// Whether this is a session lifecycle event
    pub fn is_session_event(&self) -> bool {
        self.path().is_none()
    }

    /// Get the event name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            StoreEvent::Connected => "Connected",
            StoreEvent::Disconnected => "Disconnected",
            StoreEvent::Expired => "Expired",
            StoreEvent::NodeCreated(_) => "NodeCreated",
            StoreEvent::NodeDeleted(_) => "NodeDeleted",
            StoreEvent::NodeDataChanged(_) => "NodeDataChanged",
            StoreEvent::NodeChildrenChanged(_) => "NodeChildrenChanged",
        }
    }
}

/// Operations on a hierarchical, watchable namespace, bound to one session
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Session this handle operates under
    fn session_id(&self) -> SessionId;

    /// Create a node; returns the actual path (with sequence suffix, if any)
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Delete a node; `ANY_VERSION` skips the version check
    async fn delete(&self, path: &str, version: i32) -> Result<()>;

    /// Stat a node, optionally arming a watch on it
    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>>;

    /// List child names (unordered), optionally arming a children watch
    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>>;

    /// Read a node's payload, optionally arming a data watch.
    ///
    /// Fails with `NoNode` without arming anything if the node is absent.
    async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat)>;

    /// Replace a node's payload
    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> Result<Stat>;

    /// End the session; the store deletes its ephemeral nodes
    async fn close(&self) -> Result<()>;
}

/// Join a parent path and a child name
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of a path (`None` for the root)
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Check that a path is absolute, has no empty segments and no trailing slash
pub fn validate_path(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(Error::InvalidPath(path.to_string()));
    }
    if path[1..].split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Create `path` and any missing ancestors as persistent nodes.
///
/// Safe to run concurrently from several processes.
pub async fn ensure_path(store: &dyn CoordinationStore, path: &str) -> Result<()> {
    validate_path(path)?;
    if path == "/" {
        return Ok(());
    }

    let mut current = String::new();
    for segment in path[1..].split('/') {
        current.push('/');
        current.push_str(segment);

        if store.exists(&current, false).await?.is_some() {
            continue;
        }
        match store.create(&current, &[], CreateMode::Persistent).await {
            Ok(_) => tracing::info!("Created persistent node {}", current),
            Err(Error::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join("/", "election"), "/election");
        assert_eq!(join("/election", "c_0000000001"), "/election/c_0000000001");
        assert_eq!(parent("/election/c_1"), Some("/election"));
        assert_eq!(parent("/election"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(basename("/service_registry/n_0000000003"), "n_0000000003");
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a/b").is_ok());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
        assert!(validate_path("/a/../b").is_err());
    }

    #[test]
    fn test_create_mode_flags() {
        let mode = CreateMode::new(true, true);
        assert_eq!(mode, CreateMode::EphemeralSequential);
        assert!(mode.is_ephemeral() && mode.is_sequential());
        assert!(!CreateMode::new(false, false).is_ephemeral());
    }

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() {
        let namespace = MemoryStore::new();
        let (session, _events) = namespace.connect().await;

        ensure_path(&session, "/apps/election").await.unwrap();
        ensure_path(&session, "/apps/election").await.unwrap();

        let stat = session.exists("/apps/election", false).await.unwrap().unwrap();
        assert!(stat.ephemeral_owner.is_none());
        assert_eq!(session.get_children("/apps", false).await.unwrap(), vec!["election"]);
    }
}
