//! Service Registry
//!
//! Members publish their address as an ephemeral sequential node under the
//! registry root. The registry keeps a cached snapshot of every live
//! member, rebuilt in full whenever the children watch on the root fires.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use super::sequence::SequentialGroup;
use crate::error::{Error, Result};
use crate::session::Watcher;
use crate::store::{CoordinationStore, StoreEvent, ANY_VERSION};

/// Point-in-time snapshot of live members
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterMembership {
    /// Member node name -> published metadata
    members: BTreeMap<String, String>,
}

impl ClusterMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: String, metadata: String) {
        self.members.insert(node, metadata);
    }

    /// Published metadata of every member, in node order
    pub fn addresses(&self) -> Vec<String> {
        self.members.values().cloned().collect()
    }

    pub fn get(&self, node: &str) -> Option<&str> {
        self.members.get(node).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Registers this process and tracks every other member
pub struct ServiceRegistry {
    store: Arc<dyn CoordinationStore>,
    group: SequentialGroup,
    /// Full path of this process's registry node
    current: Mutex<Option<String>>,
    /// Last published snapshot; `None` until first refresh
    cache: RwLock<Option<Arc<ClusterMembership>>>,
    /// One refresh at a time
    refresh_lock: Mutex<()>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, group: SequentialGroup) -> Self {
        Self {
            store,
            group,
            current: Mutex::new(None),
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Publish `metadata` under a new ephemeral node. Once per session.
    pub async fn register_to_cluster(&self, metadata: &str) -> Result<String> {
        let mut current = self.current.lock().await;
        if let Some(path) = current.as_ref() {
            return Err(Error::AlreadyRegistered(path.clone()));
        }

        let name = self
            .group
            .join(self.store.as_ref(), metadata.as_bytes())
            .await
            .map_err(|e| e.into_registration(self.group.root()))?;

        let path = self.group.path_of(&name);
        tracing::info!("Registered to cluster as {} with {}", path, metadata);
        *current = Some(path.clone());
        Ok(path)
    }

    /// Remove this process's node. A node that is already gone is not an error.
    pub async fn unregister_from_cluster(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        let Some(path) = current.take() else {
            return Ok(());
        };

        match self.store.delete(&path, ANY_VERSION).await {
            Ok(()) => {
                tracing::info!("Unregistered {} from cluster", path);
                Ok(())
            }
            Err(Error::NoNode(_)) => {
                tracing::debug!("Registry node {} already gone", path);
                Ok(())
            }
            Err(e) => {
                let err = e.into_registration(&path);
                *current = Some(path);
                Err(err)
            }
        }
    }

    /// Cached membership, loaded and watched on first use
    pub async fn get_all_service_addresses(&self) -> Result<Arc<ClusterMembership>> {
        if let Some(snapshot) = self.cache.read().await.as_ref() {
            return Ok(Arc::clone(snapshot));
        }
        self.refresh().await
    }

    /// Load membership now and keep it updated from here on
    pub async fn register_for_updates(&self) -> Result<()> {
        self.refresh().await.map(|_| ())
    }

    /// Cached snapshot without touching the store
    pub async fn cached(&self) -> Option<Arc<ClusterMembership>> {
        self.cache.read().await.clone()
    }

    pub async fn is_registered(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Own registry node path, if registered
    pub async fn current_node(&self) -> Option<String> {
        self.current.lock().await.clone()
    }

    pub fn group(&self) -> &SequentialGroup {
        &self.group
    }

    /// List members, re-arm the children watch and swap in a new snapshot
    async fn refresh(&self) -> Result<Arc<ClusterMembership>> {
        let _guard = self.refresh_lock.lock().await;

        let children = self.group.members(self.store.as_ref(), true).await?;
        let reads = children.iter().map(|child| {
            let path = self.group.path_of(child);
            async move {
                let result = self.store.get_data(&path, false).await;
                (path, result)
            }
        });
        let results = futures::future::join_all(reads).await;

        let mut membership = ClusterMembership::new();
        for (child, (path, result)) in children.into_iter().zip(results) {
            match result {
                Ok((data, _)) => {
                    membership.insert(child, String::from_utf8_lossy(&data).into_owned());
                }
                Err(e) if e.is_transient_race() => {
                    tracing::debug!("Member {} left during refresh", path);
                }
                Err(e) => return Err(e),
            }
        }

        let snapshot = Arc::new(membership);
        *self.cache.write().await = Some(Arc::clone(&snapshot));
        tracing::info!("The cluster addresses are: {:?}", snapshot.addresses());
        Ok(snapshot)
    }
}

#[async_trait]
impl Watcher for ServiceRegistry {
    async fn process(&self, event: &StoreEvent) -> Result<()> {
        match event {
            StoreEvent::NodeChildrenChanged(path) if path == self.group.root() => {
                self.refresh().await?;
                Ok(())
            }
            StoreEvent::Disconnected | StoreEvent::Expired => {
                *self.cache.write().await = None;
                *self.current.lock().await = None;
                tracing::debug!("Registry cache dropped ({})", event.type_name());
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
