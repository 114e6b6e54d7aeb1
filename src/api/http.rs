//! HTTP API Server
//!
//! Read-only REST API exposing a node's election and membership state.

use std::sync::Arc;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::coordination::LeaderState;
use crate::error::{Error, Result};
use crate::node::ClusterNode;
use crate::session::SessionState;

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// Node for the current session; `None` while (re)joining
    pub node: RwLock<Option<Arc<ClusterNode>>>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node_id: String) -> Self {
        let state = Arc::new(AppState {
            node_id,
            node: RwLock::new(None),
        });

        Self { config, state }
    }

    /// Point the API at the node of the current session
    pub async fn set_node(&self, node: Option<Arc<ClusterNode>>) {
        *self.state.node.write().await = node;
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/cluster/members", get(handle_members))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub session_state: Option<SessionState>,
    pub leader_state: Option<LeaderState>,
}

/// One registered member
#[derive(Debug, Serialize)]
pub struct MemberEntry {
    pub node: String,
    pub address: String,
}

/// Membership response
#[derive(Debug, Serialize)]
pub struct MembersResponse {
    pub node_id: String,
    pub leader: Option<String>,
    pub members: Vec<MemberEntry>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn unavailable(message: String) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: message,
            code: "UNAVAILABLE".to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let node = state.node.read().await.clone();
    let session_state = node.as_ref().map(|n| n.session().state());
    let leader_state = node.as_ref().map(|n| n.elector().state());

    let healthy = session_state == Some(SessionState::Connected);
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(HealthResponse {
            healthy,
            node_id: state.node_id.clone(),
            session_state,
            leader_state,
        }),
    )
}

async fn handle_status(
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(node) = state.node.read().await.clone() else {
        return unavailable(format!("node {} has not joined the cluster", state.node_id));
    };

    Json(node.status().await).into_response()
}

async fn handle_members(
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(node) = state.node.read().await.clone() else {
        return unavailable(format!("node {} has not joined the cluster", state.node_id));
    };

    let leader = match node.elector().current_leader().await {
        Ok(leader) => leader,
        Err(e) => {
            tracing::warn!("Failed to read current leader: {}", e);
            return unavailable(e.to_string());
        }
    };

    match node.registry().get_all_service_addresses().await {
        Ok(membership) => Json(MembersResponse {
            node_id: state.node_id.clone(),
            leader,
            members: membership
                .iter()
                .map(|(name, address)| MemberEntry {
                    node: name.clone(),
                    address: address.clone(),
                })
                .collect(),
        })
        .into_response(),
        Err(e) => {
            tracing::warn!("Failed to read cluster membership: {}", e);
            unavailable(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WolfCoordConfig;
    use crate::session::CoordinationSession;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn join(namespace: &MemoryStore, id: &str, address: &str) -> Arc<ClusterNode> {
        let config = WolfCoordConfig::from_str(&format!(
            "[node]\nid = \"{}\"\nadvertise_address = \"{}\"\n",
            id, address
        ))
        .unwrap();
        let (store, events) = namespace.connect().await;
        let session = CoordinationSession::start(Arc::new(store), events);
        session.wait_connected(Duration::from_secs(1)).await.unwrap();
        ClusterNode::with_session(&config, session).await.unwrap()
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_endpoints_before_join() {
        let server = HttpServer::new(ApiConfig::default(), "node-1".to_string());
        let router = HttpServer::create_router(server.state(), false);

        let (status, body) = get(router.clone(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["healthy"], false);

        let (status, body) = get(router, "/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_status_and_members() {
        let namespace = MemoryStore::new();
        let leader = join(&namespace, "node-1", "10.0.0.1:9000").await;
        let _worker = join(&namespace, "node-2", "10.0.0.2:9000").await;

        let server = HttpServer::new(ApiConfig::default(), "node-1".to_string());
        server.set_node(Some(Arc::clone(&leader))).await;
        let router = HttpServer::create_router(server.state(), true);

        let (status, body) = get(router.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["leader_state"], "Leader");

        let (status, body) = get(router.clone(), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["election_node"], "c_0000000000");
        assert!(body["watched_predecessor"].is_null());

        // Pick up the worker's registration without waiting on the watch
        leader.registry().register_for_updates().await.unwrap();
        let (status, body) = get(router, "/cluster/members").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["leader"], "c_0000000000");
        let members = body["members"].as_array().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0]["address"], "10.0.0.2:9000");
    }

    #[tokio::test]
    async fn test_members_reports_leader_after_handover() {
        let namespace = MemoryStore::new();
        let first = join(&namespace, "node-1", "10.0.0.1:9000").await;
        let second = join(&namespace, "node-2", "10.0.0.2:9000").await;
        let third = join(&namespace, "node-3", "10.0.0.3:9000").await;

        let server = HttpServer::new(ApiConfig::default(), "node-3".to_string());
        server.set_node(Some(Arc::clone(&third))).await;
        let router = HttpServer::create_router(server.state(), false);

        first.close().await.unwrap();
        let mut rx = second.elector().subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == LeaderState::Leader))
            .await
            .expect("successor was not promoted")
            .unwrap();

        let (status, body) = get(router, "/cluster/members").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["leader"], "c_0000000001");
    }
}
