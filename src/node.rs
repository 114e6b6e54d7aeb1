//! Cluster Node
//!
//! Wires one session, the leader elector and the service registry into a
//! running cluster member. The leader takes itself out of the registry and
//! follows membership; workers publish their address.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::WolfCoordConfig;
use crate::coordination::{LeaderElector, LeaderState, OnElectionCallback, SequentialGroup, ServiceRegistry};
use crate::error::{Error, Result};
use crate::session::{CoordinationSession, DisconnectReason, SessionState};

/// Leader/worker behavior of a cluster node
pub struct ClusterRole {
    registry: Arc<ServiceRegistry>,
    advertise_address: String,
}

impl ClusterRole {
    pub fn new(registry: Arc<ServiceRegistry>, advertise_address: String) -> Self {
        Self {
            registry,
            advertise_address,
        }
    }
}

#[async_trait]
impl OnElectionCallback for ClusterRole {
    async fn on_elected_leader(&self) -> Result<()> {
        self.registry.unregister_from_cluster().await?;
        self.registry.register_for_updates().await?;
        Ok(())
    }

    async fn on_worker(&self) {
        match self.registry.register_to_cluster(&self.advertise_address).await {
            Ok(_) | Err(Error::AlreadyRegistered(_)) => {}
            Err(e) => tracing::error!("Failed to register {} to cluster: {}", self.advertise_address, e),
        }
    }
}

/// Point-in-time view of a node, served by the HTTP API
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub advertise_address: String,
    pub session_id: u64,
    pub session_state: SessionState,
    pub leader_state: LeaderState,
    pub election_node: Option<String>,
    pub current_leader: Option<String>,
    pub watched_predecessor: Option<String>,
    pub registry_node: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A cluster member bound to one session
pub struct ClusterNode {
    id: String,
    advertise_address: String,
    session: Arc<CoordinationSession>,
    elector: Arc<LeaderElector>,
    registry: Arc<ServiceRegistry>,
    started_at: DateTime<Utc>,
}

impl ClusterNode {
    /// Connect to the configured store and join the cluster
    pub async fn start(config: &WolfCoordConfig) -> Result<Arc<Self>> {
        tracing::info!(
            "Connecting to coordination store at {} (session timeout {} ms)",
            config.store.address,
            config.store.session_timeout_ms
        );
        let session = CoordinationSession::connect(
            &config.store.address,
            config.session_timeout(),
            config.connect_timeout(),
        )
        .await?;

        Self::with_session(config, session).await
    }

    /// Join the cluster over an established session.
    ///
    /// On failure the session is closed so no half-joined state survives.
    pub async fn with_session(config: &WolfCoordConfig, session: Arc<CoordinationSession>) -> Result<Arc<Self>> {
        match Self::join(config, Arc::clone(&session)).await {
            Ok(node) => Ok(node),
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    tracing::warn!("Failed to close session after join error: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn join(config: &WolfCoordConfig, session: Arc<CoordinationSession>) -> Result<Arc<Self>> {
        let store = session.store();
        let election = SequentialGroup::new(&config.election.root, &config.election.prefix);
        let membership = SequentialGroup::new(&config.registry.root, &config.registry.prefix);

        election.bootstrap(store.as_ref()).await?;
        membership.bootstrap(store.as_ref()).await?;

        let registry = Arc::new(ServiceRegistry::new(Arc::clone(&store), membership));
        let role = Arc::new(ClusterRole::new(
            Arc::clone(&registry),
            config.node.advertise_address.clone(),
        ));
        let elector = Arc::new(LeaderElector::new(store, election, role));

        session.add_watcher(elector.clone()).await;
        session.add_watcher(registry.clone()).await;

        elector.volunteer_for_leadership().await?;
        let state = elector.reevaluate_leadership().await?;
        tracing::info!("Node {} joined the cluster as {}", config.node.id, state);

        Ok(Arc::new(Self {
            id: config.node.id.clone(),
            advertise_address: config.node.advertise_address.clone(),
            session,
            elector,
            registry,
            started_at: Utc::now(),
        }))
    }

    /// Block until the session ends
    pub async fn run(&self) -> Result<DisconnectReason> {
        self.session.await_disconnect().await
    }

    /// Leave the cluster; the store removes this node's ephemeral nodes
    pub async fn close(&self) -> Result<()> {
        tracing::info!("Node {} leaving the cluster", self.id);
        self.session.close().await
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &Arc<CoordinationSession> {
        &self.session
    }

    pub fn elector(&self) -> &Arc<LeaderElector> {
        &self.elector
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Snapshot of this node's coordination state
    pub async fn status(&self) -> NodeStatus {
        let current_leader = match self.elector.current_leader().await {
            Ok(leader) => leader,
            Err(e) => {
                tracing::warn!("Failed to read current leader: {}", e);
                None
            }
        };

        NodeStatus {
            node_id: self.id.clone(),
            advertise_address: self.advertise_address.clone(),
            session_id: self.session.store().session_id(),
            session_state: self.session.state(),
            leader_state: self.elector.state(),
            election_node: self.elector.election_node().await,
            current_leader,
            watched_predecessor: self.elector.watched_path().await,
            registry_node: self.registry.current_node().await,
            started_at: self.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn config(id: &str, address: &str) -> WolfCoordConfig {
        WolfCoordConfig::from_str(&format!(
            "[node]\nid = \"{}\"\nadvertise_address = \"{}\"\n",
            id, address
        ))
        .unwrap()
    }

    async fn start(namespace: &MemoryStore, id: &str, address: &str) -> Arc<ClusterNode> {
        let (store, events) = namespace.connect().await;
        let session = CoordinationSession::start(Arc::new(store), events);
        session.wait_connected(Duration::from_secs(1)).await.unwrap();
        ClusterNode::with_session(&config(id, address), session).await.unwrap()
    }

    async fn wait_for_members(node: &ClusterNode, expected: &[&str]) {
        let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        expected.sort();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let mut addresses = node.registry().get_all_service_addresses().await.unwrap().addresses();
            addresses.sort();
            if addresses == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "membership {:?} never became {:?}",
                addresses,
                expected
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_leader_tracks_workers() {
        let namespace = MemoryStore::new();
        let leader = start(&namespace, "node-1", "10.0.0.1:9000").await;
        let worker_a = start(&namespace, "node-2", "10.0.0.2:9000").await;
        let worker_b = start(&namespace, "node-3", "10.0.0.3:9000").await;

        assert!(leader.elector().is_leader());
        assert!(!leader.registry().is_registered().await);
        assert!(worker_a.registry().is_registered().await);
        assert!(worker_b.registry().is_registered().await);

        wait_for_members(&leader, &["10.0.0.2:9000", "10.0.0.3:9000"]).await;

        let status = worker_b.status().await;
        assert_eq!(status.leader_state, LeaderState::Follower);
        assert_eq!(status.current_leader.as_deref(), Some("c_0000000000"));
        assert_eq!(status.watched_predecessor.as_deref(), Some("/election/c_0000000001"));
    }

    #[tokio::test]
    async fn test_new_leader_leaves_registry() {
        let namespace = MemoryStore::new();
        let leader = start(&namespace, "node-1", "10.0.0.1:9000").await;
        let successor = start(&namespace, "node-2", "10.0.0.2:9000").await;
        let _worker = start(&namespace, "node-3", "10.0.0.3:9000").await;

        leader.close().await.unwrap();

        let mut rx = successor.elector().subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == LeaderState::Leader))
            .await
            .expect("successor was not promoted")
            .unwrap();

        assert!(!successor.registry().is_registered().await);
        wait_for_members(&successor, &["10.0.0.3:9000"]).await;
    }

    #[tokio::test]
    async fn test_follower_status_names_live_leader() {
        let namespace = MemoryStore::new();
        let nodes = vec![
            start(&namespace, "node-1", "10.0.0.1:9000").await,
            start(&namespace, "node-2", "10.0.0.2:9000").await,
            start(&namespace, "node-3", "10.0.0.3:9000").await,
        ];

        nodes[0].close().await.unwrap();
        let mut rx = nodes[1].elector().subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == LeaderState::Leader))
            .await
            .expect("successor was not promoted")
            .unwrap();

        // node-3 watches node-2 and was never woken
        let status = nodes[2].status().await;
        assert_eq!(status.leader_state, LeaderState::Follower);
        assert_eq!(status.watched_predecessor.as_deref(), Some("/election/c_0000000001"));
        assert_eq!(status.current_leader.as_deref(), Some("c_0000000001"));
    }

    #[tokio::test]
    async fn test_run_returns_on_expiry() {
        let namespace = MemoryStore::new();
        let node = start(&namespace, "node-1", "10.0.0.1:9000").await;

        namespace.expire_session(node.session().store().session_id()).await;
        assert_eq!(node.run().await.unwrap(), DisconnectReason::Expired);
        assert_eq!(node.elector().state(), LeaderState::Disconnected);
    }
}
