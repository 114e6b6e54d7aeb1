//! In-Memory Coordination Namespace
//!
//! A complete hierarchical namespace with sessions, ephemeral and
//! sequential nodes and one-shot watches. Backs the TCP store server and
//! serves as the fake store in tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{
    basename, parent, validate_path, CoordinationStore, CreateMode, EventReceiver, SessionId,
    Stat, StoreEvent, ANY_VERSION,
};
use crate::error::{Error, Result};

/// Width of the zero-padded sequence suffix
const SEQUENCE_WIDTH: usize = 10;

/// Class of a registered watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchKind {
    /// Armed by `get_data` or by `exists` on a present node
    Data,
    /// Armed by `exists` on an absent node
    Exist,
    /// Armed by `get_children`
    Child,
}

struct Node {
    data: Vec<u8>,
    czxid: u64,
    mzxid: u64,
    ctime: i64,
    version: i32,
    ephemeral_owner: Option<SessionId>,
    children: BTreeSet<String>,
    /// Next suffix handed to a sequential child
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, zxid: u64, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            czxid: zxid,
            mzxid: zxid,
            ctime: chrono::Utc::now().timestamp_millis(),
            version: 0,
            ephemeral_owner,
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            czxid: self.czxid,
            mzxid: self.mzxid,
            ctime: self.ctime,
            version: self.version,
            ephemeral_owner: self.ephemeral_owner,
            data_length: self.data.len(),
            num_children: self.children.len(),
        }
    }
}

struct SessionEntry {
    events: mpsc::UnboundedSender<StoreEvent>,
    ephemerals: BTreeSet<String>,
}

#[derive(Default)]
struct WatchTable {
    data: HashMap<String, HashSet<SessionId>>,
    exist: HashMap<String, HashSet<SessionId>>,
    child: HashMap<String, HashSet<SessionId>>,
}

impl WatchTable {
    fn table(&mut self, kind: WatchKind) -> &mut HashMap<String, HashSet<SessionId>> {
        match kind {
            WatchKind::Data => &mut self.data,
            WatchKind::Exist => &mut self.exist,
            WatchKind::Child => &mut self.child,
        }
    }

    fn add(&mut self, kind: WatchKind, path: &str, session: SessionId) {
        self.table(kind).entry(path.to_string()).or_default().insert(session);
    }

    /// Remove and return every session watching `path` through any of `kinds`
    fn take(&mut self, kinds: &[WatchKind], path: &str) -> HashSet<SessionId> {
        let mut sessions = HashSet::new();
        for kind in kinds {
            if let Some(watchers) = self.table(*kind).remove(path) {
                sessions.extend(watchers);
            }
        }
        sessions
    }

    fn purge_session(&mut self, session: SessionId) {
        for kind in [WatchKind::Data, WatchKind::Exist, WatchKind::Child] {
            let table = self.table(kind);
            table.retain(|_, watchers| {
                watchers.remove(&session);
                !watchers.is_empty()
            });
        }
    }

    fn for_session(&self, session: SessionId) -> Vec<(WatchKind, String)> {
        let mut out = Vec::new();
        for (kind, table) in [
            (WatchKind::Data, &self.data),
            (WatchKind::Exist, &self.exist),
            (WatchKind::Child, &self.child),
        ] {
            for (path, watchers) in table {
                if watchers.contains(&session) {
                    out.push((kind, path.clone()));
                }
            }
        }
        out.sort();
        out
    }
}

struct Namespace {
    nodes: HashMap<String, Node>,
    sessions: HashMap<SessionId, SessionEntry>,
    watches: WatchTable,
    zxid: u64,
    next_session_id: SessionId,
}

impl Namespace {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), 0, None));
        Self {
            nodes,
            sessions: HashMap::new(),
            watches: WatchTable::default(),
            zxid: 0,
            next_session_id: 1,
        }
    }

    fn check_session(&self, session: SessionId) -> Result<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(Error::SessionExpired)
        }
    }

    fn next_zxid(&mut self) -> u64 {
        self.zxid += 1;
        self.zxid
    }

    /// Deliver `event` to every session removed from the given watch classes
    fn trigger(&mut self, kinds: &[WatchKind], path: &str, event: StoreEvent) {
        for session in self.watches.take(kinds, path) {
            if let Some(entry) = self.sessions.get(&session) {
                tracing::trace!("Watch fired for session {}: {:?}", session, event);
                let _ = entry.events.send(event.clone());
            }
        }
    }

    fn create(&mut self, session: SessionId, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        validate_path(path)?;
        let parent_path = parent(path).ok_or_else(|| Error::NodeExists(path.to_string()))?;

        let parent_node = self
            .nodes
            .get_mut(parent_path)
            .ok_or_else(|| Error::NoParent(path.to_string()))?;
        if parent_node.ephemeral_owner.is_some() {
            return Err(Error::NoChildrenForEphemerals(path.to_string()));
        }

        let full_path = if mode.is_sequential() {
            format!("{}{:0width$}", path, parent_node.next_sequence, width = SEQUENCE_WIDTH)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&full_path) {
            return Err(Error::NodeExists(full_path));
        }

        let parent_path = parent_path.to_string();
        let zxid = self.next_zxid();
        if let Some(parent_node) = self.nodes.get_mut(&parent_path) {
            if mode.is_sequential() {
                parent_node.next_sequence += 1;
            }
            parent_node.children.insert(basename(&full_path).to_string());
        }

        let owner = mode.is_ephemeral().then_some(session);
        self.nodes.insert(full_path.clone(), Node::new(data.to_vec(), zxid, owner));
        if owner.is_some() {
            if let Some(entry) = self.sessions.get_mut(&session) {
                entry.ephemerals.insert(full_path.clone());
            }
        }

        self.trigger(&[WatchKind::Exist], &full_path, StoreEvent::NodeCreated(full_path.clone()));
        self.trigger(&[WatchKind::Child], &parent_path, StoreEvent::NodeChildrenChanged(parent_path.clone()));

        Ok(full_path)
    }

    fn delete(&mut self, path: &str, version: i32) -> Result<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(Error::InvalidPath(path.to_string()));
        }

        let node = self.nodes.get(path).ok_or_else(|| Error::NoNode(path.to_string()))?;
        if version != ANY_VERSION && version != node.version {
            return Err(Error::BadVersion {
                path: path.to_string(),
                expected: version,
                actual: node.version,
            });
        }
        if !node.children.is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }

        let owner = node.ephemeral_owner;
        self.nodes.remove(path);
        self.next_zxid();
        if let Some(owner) = owner {
            if let Some(entry) = self.sessions.get_mut(&owner) {
                entry.ephemerals.remove(path);
            }
        }

        let parent_path = parent(path).unwrap_or("/").to_string();
        if let Some(parent_node) = self.nodes.get_mut(&parent_path) {
            parent_node.children.remove(basename(path));
        }

        self.trigger(
            &[WatchKind::Data, WatchKind::Exist, WatchKind::Child],
            path,
            StoreEvent::NodeDeleted(path.to_string()),
        );
        self.trigger(&[WatchKind::Child], &parent_path, StoreEvent::NodeChildrenChanged(parent_path.clone()));

        Ok(())
    }

    fn exists(&mut self, session: SessionId, path: &str, watch: bool) -> Result<Option<Stat>> {
        validate_path(path)?;
        let stat = self.nodes.get(path).map(Node::stat);
        if watch {
            let kind = if stat.is_some() { WatchKind::Data } else { WatchKind::Exist };
            self.watches.add(kind, path, session);
        }
        Ok(stat)
    }

    fn get_children(&mut self, session: SessionId, path: &str, watch: bool) -> Result<Vec<String>> {
        validate_path(path)?;
        let node = self.nodes.get(path).ok_or_else(|| Error::NoNode(path.to_string()))?;
        let children = node.children.iter().cloned().collect();
        if watch {
            self.watches.add(WatchKind::Child, path, session);
        }
        Ok(children)
    }

    fn get_data(&mut self, session: SessionId, path: &str, watch: bool) -> Result<(Vec<u8>, Stat)> {
        validate_path(path)?;
        let node = self.nodes.get(path).ok_or_else(|| Error::NoNode(path.to_string()))?;
        let result = (node.data.clone(), node.stat());
        if watch {
            self.watches.add(WatchKind::Data, path, session);
        }
        Ok(result)
    }

    fn set_data(&mut self, path: &str, data: &[u8], version: i32) -> Result<Stat> {
        validate_path(path)?;
        let zxid = self.zxid + 1;
        let node = self.nodes.get_mut(path).ok_or_else(|| Error::NoNode(path.to_string()))?;
        if version != ANY_VERSION && version != node.version {
            return Err(Error::BadVersion {
                path: path.to_string(),
                expected: version,
                actual: node.version,
            });
        }
        node.data = data.to_vec();
        node.version += 1;
        node.mzxid = zxid;
        let stat = node.stat();
        self.zxid = zxid;

        self.trigger(
            &[WatchKind::Data, WatchKind::Exist],
            path,
            StoreEvent::NodeDataChanged(path.to_string()),
        );
        Ok(stat)
    }

    /// Tear down a session: notify it (if asked), drop its watches and
    /// delete its ephemeral nodes, firing watches held by other sessions.
    fn remove_session(&mut self, session: SessionId, notify: Option<StoreEvent>) -> bool {
        let Some(entry) = self.sessions.remove(&session) else {
            return false;
        };
        if let Some(event) = notify {
            let _ = entry.events.send(event);
        }
        self.watches.purge_session(session);

        for path in entry.ephemerals.iter() {
            if let Err(e) = self.delete(path, ANY_VERSION) {
                tracing::warn!("Failed to remove ephemeral node {} of session {}: {}", path, session, e);
            }
        }

        tracing::debug!(
            "Session {} removed ({} ephemeral nodes deleted)",
            session,
            entry.ephemerals.len()
        );
        true
    }
}

/// Shared in-memory namespace; every `connect` opens a new session on it
#[derive(Clone)]
pub struct MemoryStore {
    namespace: Arc<Mutex<Namespace>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty namespace containing only the root node
    pub fn new() -> Self {
        Self {
            namespace: Arc::new(Mutex::new(Namespace::new())),
        }
    }

    /// Open a new session. `Connected` is queued on its channel immediately.
    pub async fn connect(&self) -> (MemorySession, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut ns = self.namespace.lock().await;
        let id = ns.next_session_id;
        ns.next_session_id += 1;
        let _ = tx.send(StoreEvent::Connected);
        ns.sessions.insert(
            id,
            SessionEntry {
                events: tx,
                ephemerals: BTreeSet::new(),
            },
        );
        tracing::debug!("Session {} opened", id);

        (
            MemorySession {
                id,
                namespace: Arc::clone(&self.namespace),
            },
            rx,
        )
    }

    /// Expire a session as the store would after a missed timeout
    pub async fn expire_session(&self, session: SessionId) -> bool {
        let mut ns = self.namespace.lock().await;
        ns.remove_session(session, Some(StoreEvent::Expired))
    }

    /// Outstanding watch registrations held by a session
    pub async fn watches(&self, session: SessionId) -> Vec<(WatchKind, String)> {
        self.namespace.lock().await.watches.for_session(session)
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.namespace.lock().await.sessions.len()
    }
}

/// One session on a `MemoryStore`
pub struct MemorySession {
    id: SessionId,
    namespace: Arc<Mutex<Namespace>>,
}

impl MemorySession {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let mut ns = self.namespace.lock().await;
        ns.check_session(self.id)?;
        ns.create(self.id, path, data, mode)
    }

    async fn delete(&self, path: &str, version: i32) -> Result<()> {
        let mut ns = self.namespace.lock().await;
        ns.check_session(self.id)?;
        ns.delete(path, version)
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>> {
        let mut ns = self.namespace.lock().await;
        ns.check_session(self.id)?;
        ns.exists(self.id, path, watch)
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        let mut ns = self.namespace.lock().await;
        ns.check_session(self.id)?;
        ns.get_children(self.id, path, watch)
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat)> {
        let mut ns = self.namespace.lock().await;
        ns.check_session(self.id)?;
        ns.get_data(self.id, path, watch)
    }

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> Result<Stat> {
        let mut ns = self.namespace.lock().await;
        ns.check_session(self.id)?;
        ns.set_data(path, data, version)
    }

    async fn close(&self) -> Result<()> {
        let mut ns = self.namespace.lock().await;
        ns.remove_session(self.id, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn with_root(store: &MemoryStore, root: &str) -> (MemorySession, EventReceiver) {
        let (session, mut events) = store.connect().await;
        assert_eq!(events.recv().await, Some(StoreEvent::Connected));
        session.create(root, &[], CreateMode::Persistent).await.unwrap();
        (session, events)
    }

    #[tokio::test]
    async fn test_sequential_names_are_zero_padded() {
        let store = MemoryStore::new();
        let (session, _events) = with_root(&store, "/election").await;

        let a = session.create("/election/c_", &[], CreateMode::EphemeralSequential).await.unwrap();
        let b = session.create("/election/c_", &[], CreateMode::EphemeralSequential).await.unwrap();
        let c = session.create("/election/c_", &[], CreateMode::EphemeralSequential).await.unwrap();

        assert_eq!(a, "/election/c_0000000000");
        assert_eq!(b, "/election/c_0000000001");
        assert_eq!(c, "/election/c_0000000002");
    }

    #[tokio::test]
    async fn test_create_errors() {
        let store = MemoryStore::new();
        let (session, _events) = with_root(&store, "/registry").await;

        let err = session.create("/missing/n_", &[], CreateMode::EphemeralSequential).await.unwrap_err();
        assert!(matches!(err, Error::NoParent(_)));

        let err = session.create("/registry", &[], CreateMode::Persistent).await.unwrap_err();
        assert!(matches!(err, Error::NodeExists(_)));

        session.create("/registry/tmp", &[], CreateMode::Ephemeral).await.unwrap();
        let err = session.create("/registry/tmp/x", &[], CreateMode::Persistent).await.unwrap_err();
        assert!(matches!(err, Error::NoChildrenForEphemerals(_)));
    }

    #[tokio::test]
    async fn test_delete_checks_version_and_children() {
        let store = MemoryStore::new();
        let (session, _events) = with_root(&store, "/a").await;
        session.create("/a/b", b"x", CreateMode::Persistent).await.unwrap();

        assert!(matches!(session.delete("/a", ANY_VERSION).await, Err(Error::NotEmpty(_))));
        assert!(matches!(session.delete("/a/b", 3).await, Err(Error::BadVersion { .. })));

        session.set_data("/a/b", b"y", 0).await.unwrap();
        session.delete("/a/b", 1).await.unwrap();
        assert!(matches!(session.delete("/a/b", ANY_VERSION).await, Err(Error::NoNode(_))));
    }

    #[tokio::test]
    async fn test_watch_fires_once() {
        let store = MemoryStore::new();
        let (owner, _owner_events) = with_root(&store, "/registry").await;
        let (watcher, mut events) = store.connect().await;
        assert_eq!(events.recv().await, Some(StoreEvent::Connected));

        watcher.get_children("/registry", true).await.unwrap();
        owner.create("/registry/n_", b"a", CreateMode::EphemeralSequential).await.unwrap();
        owner.create("/registry/n_", b"b", CreateMode::EphemeralSequential).await.unwrap();

        assert_eq!(events.recv().await, Some(StoreEvent::NodeChildrenChanged("/registry".into())));
        assert!(events.try_recv().is_err());
        assert!(store.watches(watcher.id()).await.is_empty());
    }

    #[tokio::test]
    async fn test_get_data_on_missing_node_arms_nothing() {
        let store = MemoryStore::new();
        let (session, _events) = with_root(&store, "/election").await;

        let err = session.get_data("/election/c_0000000007", true).await.unwrap_err();
        assert!(err.is_transient_race());
        assert!(store.watches(session.id()).await.is_empty());

        // exists() on an absent node arms a creation watch
        session.exists("/election/c_0000000007", true).await.unwrap();
        assert_eq!(
            store.watches(session.id()).await,
            vec![(WatchKind::Exist, "/election/c_0000000007".to_string())]
        );
    }

    #[tokio::test]
    async fn test_data_watch_sees_change_and_delete() {
        let store = MemoryStore::new();
        let (session, mut events) = with_root(&store, "/cfg").await;

        session.get_data("/cfg", true).await.unwrap();
        session.set_data("/cfg", b"v1", ANY_VERSION).await.unwrap();
        assert_eq!(events.recv().await, Some(StoreEvent::NodeDataChanged("/cfg".into())));

        session.exists("/cfg", true).await.unwrap();
        session.delete("/cfg", ANY_VERSION).await.unwrap();
        assert_eq!(events.recv().await, Some(StoreEvent::NodeDeleted("/cfg".into())));
    }

    #[tokio::test]
    async fn test_close_removes_ephemerals_and_notifies_watchers() {
        let store = MemoryStore::new();
        let (observer, mut events) = with_root(&store, "/registry").await;
        let (member, _member_events) = store.connect().await;

        let path = member.create("/registry/n_", b"10.0.0.1:9000", CreateMode::EphemeralSequential).await.unwrap();
        observer.exists(&path, true).await.unwrap();

        member.close().await.unwrap();

        assert_eq!(events.recv().await, Some(StoreEvent::NodeDeleted(path.clone())));
        assert!(observer.exists(&path, false).await.unwrap().is_none());
        assert!(matches!(member.exists("/registry", false).await, Err(Error::SessionExpired)));
        assert_eq!(store.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_expire_session_sends_expired() {
        let store = MemoryStore::new();
        let (session, mut events) = with_root(&store, "/election").await;
        session.create("/election/c_", &[], CreateMode::EphemeralSequential).await.unwrap();

        assert!(store.expire_session(session.id()).await);
        assert_eq!(events.recv().await, Some(StoreEvent::Expired));
        assert!(!store.expire_session(session.id()).await);

        let (other, _other_events) = store.connect().await;
        assert!(other.get_children("/election", false).await.unwrap().is_empty());
    }
}
